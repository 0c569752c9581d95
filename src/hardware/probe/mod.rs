//! Attribute Probes
//!
//! A probe inspects one device and contributes a partial attribute set.
//! The set of probes is closed: new kinds are added as `Probe` variants.
//!
//! Probes are independent of one another so the pipeline can run them
//! concurrently. Every run is bounded by the context timeout and a failure
//! only costs the attributes that probe would have contributed.

pub mod attributes;
pub mod blkid;
pub mod identity;
pub mod mount;
pub mod pipeline;
pub mod smart;
pub mod sysfs;

pub use attributes::*;
pub use identity::*;
pub use pipeline::*;

use crate::config::ProbeConfig;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Probe Context
// =============================================================================

/// Environment shared by all probes
#[derive(Debug, Clone)]
pub struct ProbeContext {
    /// Root of sysfs (for testing)
    pub sysfs_root: PathBuf,
    /// Mount table to inspect
    pub mountinfo_path: PathBuf,
    /// smartctl binary
    pub smartctl_path: String,
    /// blkid binary
    pub blkid_path: String,
    /// Upper bound for a single probe run
    pub timeout: Duration,
}

impl Default for ProbeContext {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            mountinfo_path: PathBuf::from("/proc/self/mountinfo"),
            smartctl_path: "smartctl".to_string(),
            blkid_path: "blkid".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ProbeContext {
    /// sysfs directory for a kernel device name
    pub fn block_dir(&self, name: &str) -> PathBuf {
        self.sysfs_root.join("class/block").join(name)
    }
}

// =============================================================================
// Device Handle
// =============================================================================

/// What a probe is given to inspect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Kernel name (sda, nvme0n1)
    pub name: String,
    /// Device node (/dev/sda)
    pub dev_path: String,
    /// sysfs directory
    pub sysfs_path: PathBuf,
}

impl DeviceHandle {
    /// Build a handle from a device path, locating its sysfs directory
    /// under the context root unless one is supplied
    pub fn resolve(dev_path: &str, sysfs_path: Option<&str>, ctx: &ProbeContext) -> Self {
        let name = Path::new(dev_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| dev_path.to_string());

        let sysfs_path = sysfs_path
            .map(PathBuf::from)
            .unwrap_or_else(|| ctx.block_dir(&name));

        Self {
            name,
            dev_path: dev_path.to_string(),
            sysfs_path,
        }
    }
}

// =============================================================================
// Probe Failures
// =============================================================================

/// Why a probe produced no contribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    /// Hardware, driver or tool absent; skipped silently
    Unavailable(String),
    /// Transient failure; skipped this cycle and retried on the next
    /// observation
    Error(String),
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::Unavailable(reason) => write!(f, "unavailable: {}", reason),
            ProbeFailure::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

pub type ProbeResult = std::result::Result<DeviceAttributes, ProbeFailure>;

// =============================================================================
// Probe
// =============================================================================

/// The closed set of attribute probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Probe {
    /// Identification and rotational flag from sysfs
    Sysfs,
    /// Size and block sizes from sysfs
    Capacity,
    /// smartctl identify and health
    Smart,
    /// Partition table and filesystem signatures via blkid
    Blkid,
    /// Mount points from the mount table
    Mount,
}

impl Probe {
    pub const ALL: [Probe; 5] = [
        Probe::Sysfs,
        Probe::Capacity,
        Probe::Smart,
        Probe::Blkid,
        Probe::Mount,
    ];

    /// Config key of this probe
    pub fn key(&self) -> &'static str {
        match self {
            Probe::Sysfs => "sysfs-probe",
            Probe::Capacity => "capacity-probe",
            Probe::Smart => "smart-probe",
            Probe::Blkid => "blkid-probe",
            Probe::Mount => "mount-probe",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.key() == key)
    }

    /// Enabled probes in configured (priority) order. Unknown keys are
    /// logged and skipped; a probe listed twice keeps its first position.
    pub fn from_configs(configs: &[ProbeConfig]) -> Vec<Probe> {
        let mut probes = Vec::new();
        for config in configs {
            let Some(probe) = Probe::from_key(config.key.trim()) else {
                warn!(key = %config.key, "Unknown probe in config, ignoring");
                continue;
            };
            if config.is_enabled() && !probes.contains(&probe) {
                probes.push(probe);
            }
        }
        probes
    }

    /// Inspect a device. Callers bound the run with `ProbeContext::timeout`.
    pub async fn run(&self, handle: &DeviceHandle, ctx: &ProbeContext) -> ProbeResult {
        match self {
            Probe::Sysfs => sysfs::probe_identity(handle, ctx).await,
            Probe::Capacity => sysfs::probe_capacity(handle, ctx).await,
            Probe::Smart => smart::probe(handle, ctx).await,
            Probe::Blkid => blkid::probe(handle, ctx).await,
            Probe::Mount => mount::probe(handle, ctx).await,
        }
    }
}

impl std::fmt::Display for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}
