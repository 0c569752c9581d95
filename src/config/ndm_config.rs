//! Node Disk Manager Configuration
//!
//! The probe, filter and feature gate configuration handed to the pipeline
//! at startup. The file is usually mounted from a ConfigMap and may be
//! either JSON or YAML.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

// =============================================================================
// Constants
// =============================================================================

/// Default path at which the config is present inside the container
pub const DEFAULT_CONFIG_FILE_PATH: &str = "/host/node-disk-manager.config";

// =============================================================================
// Config Types
// =============================================================================

/// Configs of probes, filters and feature gates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDiskManagerConfig {
    /// Probe configs, in priority order
    #[serde(rename = "probeconfigs", default)]
    pub probe_configs: Vec<ProbeConfig>,

    /// Filter configs, in evaluation order
    #[serde(rename = "filterconfigs", default)]
    pub filter_configs: Vec<FilterConfig>,

    /// Switches for optional behaviour
    #[serde(rename = "featuregates", default, skip_serializing_if = "Vec::is_empty")]
    pub feature_gates: Vec<FeatureGateConfig>,
}

/// Config of a single probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub key: String,
    pub name: String,
    pub state: String,
}

/// Config of a single filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub key: String,
    pub name: String,
    pub state: String,
    /// Comma separated terms a device must match at least one of
    #[serde(default)]
    pub include: String,
    /// Comma separated terms that hide a device
    #[serde(default)]
    pub exclude: String,
}

/// State of an optional feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureGateConfig {
    pub feature: String,
    pub state: String,
}

impl ProbeConfig {
    pub fn new(key: &str, name: &str, enabled: bool) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            state: enabled.to_string(),
        }
    }

    /// Whether the probe should run; malformed states disable it
    pub fn is_enabled(&self) -> bool {
        state_or_disabled(&self.key, &self.state)
    }
}

impl FilterConfig {
    pub fn new(key: &str, name: &str, enabled: bool, include: &str, exclude: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            state: enabled.to_string(),
            include: include.to_string(),
            exclude: exclude.to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        state_or_disabled(&self.key, &self.state)
    }

    /// Include terms, split on commas with blanks dropped
    pub fn include_terms(&self) -> Vec<String> {
        split_terms(&self.include)
    }

    /// Exclude terms, split on commas with blanks dropped
    pub fn exclude_terms(&self) -> Vec<String> {
        split_terms(&self.exclude)
    }
}

// =============================================================================
// Defaults
// =============================================================================

impl Default for NodeDiskManagerConfig {
    fn default() -> Self {
        Self {
            probe_configs: vec![
                ProbeConfig::new("sysfs-probe", "sysfs probe", true),
                ProbeConfig::new("capacity-probe", "capacity probe", true),
                ProbeConfig::new("blkid-probe", "blkid probe", true),
                ProbeConfig::new("mount-probe", "mount probe", true),
                ProbeConfig::new("smart-probe", "smart probe", true),
            ],
            filter_configs: vec![
                FilterConfig::new(
                    "os-disk-exclude-filter",
                    "os disk exclude filter",
                    true,
                    "",
                    "/,/etc/hosts,/boot",
                ),
                FilterConfig::new(
                    "vendor-filter",
                    "vendor filter",
                    true,
                    "",
                    "CLOUDBYT,OpenEBS",
                ),
                FilterConfig::new(
                    "path-filter",
                    "path filter",
                    true,
                    "",
                    "loop,/dev/fd0,/dev/sr0,/dev/ram,/dev/dm-,/dev/md,/dev/rbd,/dev/zd",
                ),
                FilterConfig::new(
                    "device-validity-filter",
                    "device validity filter",
                    true,
                    "",
                    "",
                ),
            ],
            feature_gates: vec![
                FeatureGateConfig {
                    feature: "GPTBasedUUID".to_string(),
                    state: "true".to_string(),
                },
                FeatureGateConfig {
                    feature: "PartitionTableUUID".to_string(),
                    state: "false".to_string(),
                },
                FeatureGateConfig {
                    feature: "UseOSDisk".to_string(),
                    state: "false".to_string(),
                },
                FeatureGateConfig {
                    feature: "ChangeDetection".to_string(),
                    state: "true".to_string(),
                },
            ],
        }
    }
}

// =============================================================================
// Loading
// =============================================================================

impl NodeDiskManagerConfig {
    /// Load config from a file.
    ///
    /// Valid JSON is parsed as JSON, anything else as YAML. Any read or
    /// parse failure is a `ConfigInvalid` error; the caller decides
    /// whether to fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| Error::ConfigInvalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let config = Self::parse(&data).map_err(|e| Error::ConfigInvalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        info!(
            path = %path.display(),
            probes = config.probe_configs.len(),
            filters = config.filter_configs.len(),
            "Loaded node disk manager config"
        );
        Ok(config)
    }

    /// Parse config text (JSON first, YAML otherwise)
    pub fn parse(data: &str) -> Result<Self> {
        let config = if serde_json::from_str::<serde_json::Value>(data).is_ok() {
            serde_json::from_str(data)?
        } else {
            serde_yaml::from_str(data)?
        };
        Ok(config)
    }

    /// Look up a probe config by key
    pub fn probe(&self, key: &str) -> Option<&ProbeConfig> {
        self.probe_configs.iter().find(|p| p.key == key)
    }

    /// Look up a filter config by key
    pub fn filter(&self, key: &str) -> Option<&FilterConfig> {
        self.filter_configs.iter().find(|f| f.key == key)
    }
}

// =============================================================================
// Truthy / Falsy
// =============================================================================

/// Parse a truthy/falsy config string. Returns `None` for anything that is
/// neither.
pub fn parse_state(state: &str) -> Option<bool> {
    match state.trim().to_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" | "on" | "enabled" => Some(true),
        "0" | "f" | "false" | "n" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

fn state_or_disabled(key: &str, state: &str) -> bool {
    match parse_state(state) {
        Some(enabled) => enabled,
        None => {
            warn!(key = %key, state = %state, "Unrecognised state, treating as disabled");
            false
        }
    }
}

fn split_terms(value: &str) -> Vec<String> {
    let terms: Vec<String> = value
        .split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect();
    debug!(?terms, "Parsed filter terms");
    terms
}
