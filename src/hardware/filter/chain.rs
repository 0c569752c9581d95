//! Ordered evaluation of the configured filters

use super::Filter;
use crate::config::{Feature, FeatureGates, FilterConfig};
use crate::domain::DeviceRecord;
use crate::metrics::AgentMetrics;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of running the chain on a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterVerdict {
    pub visible: bool,
    /// Key of the first filter that hid the record
    pub excluded_by: Option<String>,
}

impl FilterVerdict {
    pub fn visible() -> Self {
        Self {
            visible: true,
            excluded_by: None,
        }
    }

    pub fn excluded(filter: &Filter) -> Self {
        Self {
            visible: false,
            excluded_by: Some(filter.key().to_string()),
        }
    }
}

/// Enabled filters in configured order
pub struct FilterChain {
    filters: Vec<Filter>,
    metrics: Arc<AgentMetrics>,
}

impl FilterChain {
    /// Build the chain from config. Disabled filters are dropped, unknown
    /// keys are logged, and the OS disk filter is skipped when `UseOSDisk`
    /// is enabled.
    pub fn from_config(
        configs: &[FilterConfig],
        gates: &FeatureGates,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let mut filters = Vec::new();
        for config in configs {
            let Some(filter) = Filter::from_config(config) else {
                warn!(key = %config.key, "Unknown filter in config, ignoring");
                continue;
            };
            if !config.is_enabled() {
                debug!(filter = %filter, "Filter disabled");
                continue;
            }
            if matches!(filter, Filter::OsDiskExclude(_)) && gates.is_enabled(Feature::UseOsDisk) {
                debug!(filter = %filter, "UseOSDisk enabled, OS disks stay visible");
                continue;
            }
            filters.push(filter);
        }
        Self { filters, metrics }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Run the filters in order, stopping at the first exclusion
    pub fn evaluate(&self, record: &DeviceRecord) -> FilterVerdict {
        for filter in &self.filters {
            if filter.excludes(record) {
                debug!(
                    path = %record.path,
                    identity = %record.identity,
                    filter = %filter,
                    "Device excluded"
                );
                self.metrics
                    .filter_exclusions
                    .with_label_values(&[filter.key()])
                    .inc();
                return FilterVerdict::excluded(filter);
            }
        }
        FilterVerdict::visible()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::record;
    use super::*;
    use crate::config::NodeDiskManagerConfig;
    use crate::domain::FilesystemInfo;

    fn default_chain(gates: &FeatureGates) -> FilterChain {
        FilterChain::from_config(
            &NodeDiskManagerConfig::default().filter_configs,
            gates,
            Arc::new(AgentMetrics::new().unwrap()),
        )
    }

    #[test]
    fn test_first_exclusion_wins() {
        let chain = default_chain(&FeatureGates::default());
        let mut r = record("/dev/loop0");
        r.details.vendor = Some("OpenEBS".into());

        let verdict = chain.evaluate(&r);
        assert!(!verdict.visible);
        // vendor-filter precedes path-filter in the default config
        assert_eq!(verdict.excluded_by.as_deref(), Some(Filter::VENDOR));
        assert_eq!(
            chain
                .metrics
                .filter_exclusions
                .with_label_values(&[Filter::PATH])
                .get(),
            0
        );
    }

    #[test]
    fn test_plain_disk_is_visible() {
        let chain = default_chain(&FeatureGates::default());
        assert_eq!(chain.evaluate(&record("/dev/sdb")), FilterVerdict::visible());
    }

    #[test]
    fn test_use_os_disk_skips_os_filter() {
        let mut r = record("/dev/sda");
        r.filesystem = Some(FilesystemInfo {
            mount_points: vec!["/".into()],
            ..Default::default()
        });

        let chain = default_chain(&FeatureGates::default());
        assert_eq!(
            chain.evaluate(&r).excluded_by.as_deref(),
            Some(Filter::OS_DISK_EXCLUDE)
        );

        let chain = default_chain(&FeatureGates::with_enabled(&[Feature::UseOsDisk]));
        assert!(chain.evaluate(&r).visible);
    }

    #[test]
    fn test_disabled_filters_are_dropped() {
        let configs = vec![
            FilterConfig::new(Filter::PATH, "path filter", false, "", "sd"),
            FilterConfig::new("bogus-filter", "bogus", true, "", ""),
        ];
        let chain = FilterChain::from_config(
            &configs,
            &FeatureGates::default(),
            Arc::new(AgentMetrics::new().unwrap()),
        );
        assert!(chain.filters().is_empty());
        assert!(chain.evaluate(&record("/dev/sdb")).visible);
    }
}
