//! Feature Gates
//!
//! Immutable lookup table of optional behaviours. A config reload builds a
//! new table and swaps the whole `Arc`; entries are never mutated in place.

use super::ndm_config::{parse_state, FeatureGateConfig};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

// =============================================================================
// Known Features
// =============================================================================

/// Optional behaviours consulted by probes, filters and the reconciler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Derive identity from WWN/serial and on-disk UUIDs instead of the
    /// legacy attribute hash with path fallback
    GptBasedUuid,
    /// Allow the partition table UUID as an identity source
    PartitionTableUuid,
    /// Do not hide devices that carry OS mount points
    UseOsDisk,
    /// Emit `Changed` observations when sysfs attributes of a known device
    /// change between scans
    ChangeDetection,
}

impl Feature {
    pub const ALL: [Feature; 4] = [
        Feature::GptBasedUuid,
        Feature::PartitionTableUuid,
        Feature::UseOsDisk,
        Feature::ChangeDetection,
    ];

    /// Name used in the config file
    pub fn name(&self) -> &'static str {
        match self {
            Feature::GptBasedUuid => "GPTBasedUUID",
            Feature::PartitionTableUuid => "PartitionTableUUID",
            Feature::UseOsDisk => "UseOSDisk",
            Feature::ChangeDetection => "ChangeDetection",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolved feature gate table
#[derive(Debug, Clone, Default)]
pub struct FeatureGates {
    gates: HashMap<Feature, bool>,
}

impl FeatureGates {
    /// Build the table from config entries. Unknown names and malformed
    /// states are logged and left disabled.
    pub fn from_config(entries: &[FeatureGateConfig]) -> Self {
        let mut gates = HashMap::new();

        for entry in entries {
            let Some(feature) = Feature::from_name(entry.feature.trim()) else {
                warn!(feature = %entry.feature, "Unknown feature gate, ignoring");
                continue;
            };

            let enabled = match parse_state(&entry.state) {
                Some(enabled) => enabled,
                None => {
                    warn!(
                        feature = %feature,
                        state = %entry.state,
                        "Malformed feature gate state, treating as disabled"
                    );
                    false
                }
            };

            if enabled {
                debug!("Feature Gate {} enabled", feature);
            } else {
                debug!("Feature Gate {} disabled", feature);
            }
            gates.insert(feature, enabled);
        }

        Self { gates }
    }

    /// Build a table with exactly the given features enabled
    pub fn with_enabled(features: &[Feature]) -> Self {
        Self {
            gates: features.iter().map(|f| (*f, true)).collect(),
        }
    }

    pub fn is_enabled(&self, feature: Feature) -> bool {
        self.gates.get(&feature).copied().unwrap_or(false)
    }

    /// Lookup by config name; unknown names are disabled
    pub fn is_enabled_by_name(&self, name: &str) -> bool {
        Feature::from_name(name)
            .map(|f| self.is_enabled(f))
            .unwrap_or(false)
    }

    /// Enabled features, for startup logging
    pub fn enabled(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|f| self.is_enabled(*f))
            .collect()
    }
}
