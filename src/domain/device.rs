//! Device Domain Types
//!
//! The canonical, inventory-resident device record and its stable identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

use super::claim::ClaimKey;
use super::ports::DriveType;

// =============================================================================
// Device Identity
// =============================================================================

/// Stable, reboot-invariant key of a physical device
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity(pub String);

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Shard index for this identity
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() as usize) % shard_count
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DeviceIdentity {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Device Attributes
// =============================================================================

/// Kind of block device as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Partition,
    Loop,
    Ram,
    Zram,
    Dm,
    Md,
}

impl DeviceKind {
    /// Classify from the kernel device name (`sda`, `loop0`, `dm-1`, ...)
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("loop") {
            DeviceKind::Loop
        } else if name.starts_with("zram") {
            DeviceKind::Zram
        } else if name.starts_with("ram") {
            DeviceKind::Ram
        } else if name.starts_with("dm-") {
            DeviceKind::Dm
        } else if name.starts_with("md") {
            DeviceKind::Md
        } else {
            DeviceKind::Disk
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Disk => write!(f, "disk"),
            DeviceKind::Partition => write!(f, "partition"),
            DeviceKind::Loop => write!(f, "loop"),
            DeviceKind::Ram => write!(f, "ram"),
            DeviceKind::Zram => write!(f, "zram"),
            DeviceKind::Dm => write!(f, "dm"),
            DeviceKind::Md => write!(f, "md"),
        }
    }
}

/// Hardware identification details
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDetails {
    pub serial: Option<String>,
    pub wwn: Option<String>,
    pub model: Option<String>,
    pub vendor: Option<String>,
    pub firmware: Option<String>,
    pub kind: Option<DeviceKind>,
    pub removable: Option<bool>,
}

/// Partition table information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Partition table type (gpt, dos)
    pub table_type: Option<String>,
    /// Partition table UUID
    pub table_uuid: Option<String>,
    /// Kernel names of child partitions
    pub partitions: Vec<String>,
}

/// Filesystem information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub fs_type: Option<String>,
    pub fs_uuid: Option<String>,
    /// Mount points of the device or any of its partitions
    pub mount_points: Vec<String>,
}

/// Health attributes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthAttributes {
    /// Overall self-assessment
    pub passed: Option<bool>,
    pub temperature_celsius: Option<i32>,
    pub percentage_used: Option<u8>,
    pub power_on_hours: Option<u64>,
}

// =============================================================================
// Claim State
// =============================================================================

/// Reference to the claim holding a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimRef {
    pub claim: ClaimKey,
    pub bound_at: DateTime<Utc>,
}

/// Binding state of a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimState {
    #[default]
    Unclaimed,
    Claimed(ClaimRef),
}

impl ClaimState {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimState::Claimed(_))
    }

    /// Key of the holding claim, if any
    pub fn holder(&self) -> Option<&ClaimKey> {
        match self {
            ClaimState::Claimed(r) => Some(&r.claim),
            ClaimState::Unclaimed => None,
        }
    }
}

// =============================================================================
// Device Record
// =============================================================================

/// Canonical device record held by the inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    /// Node the device is attached to
    pub host: String,
    /// Current OS path; may change across reboots
    pub path: String,
    pub sysfs_path: Option<String>,
    pub capacity_bytes: u64,
    pub logical_block_size: Option<u32>,
    pub physical_block_size: Option<u32>,
    pub drive_type: DriveType,
    pub details: DeviceDetails,
    pub partition: Option<PartitionInfo>,
    pub filesystem: Option<FilesystemInfo>,
    pub health: Option<HealthAttributes>,
    /// Result of the last filter chain evaluation
    pub visible: bool,
    pub claim_state: ClaimState,
    /// Removed from the host while claimed
    pub stale: bool,
    /// Bumped by the inventory on every write
    pub generation: u64,
    pub updated_at: DateTime<Utc>,
}

impl DeviceRecord {
    /// Compare everything except bookkeeping fields
    pub fn semantically_eq(&self, other: &DeviceRecord) -> bool {
        self.identity == other.identity
            && self.host == other.host
            && self.path == other.path
            && self.sysfs_path == other.sysfs_path
            && self.capacity_bytes == other.capacity_bytes
            && self.logical_block_size == other.logical_block_size
            && self.physical_block_size == other.physical_block_size
            && self.drive_type == other.drive_type
            && self.details == other.details
            && self.partition == other.partition
            && self.filesystem == other.filesystem
            && self.health == other.health
            && self.visible == other.visible
            && self.claim_state == other.claim_state
            && self.stale == other.stale
    }

    /// Available for a new binding
    pub fn is_available(&self) -> bool {
        self.visible && !self.stale && !self.claim_state.is_claimed()
    }

    pub fn mount_points(&self) -> &[String] {
        self.filesystem
            .as_ref()
            .map(|fs| fs.mount_points.as_slice())
            .unwrap_or(&[])
    }
}
