//! Filter Chain
//!
//! Configured include/exclude rules deciding which probed devices are
//! visible. Filters are a closed set; each inspects one aspect of the
//! record (path, vendor, mount points, kind and capacity).

pub mod chain;

pub use chain::*;

use crate::config::FilterConfig;
use crate::domain::DeviceRecord;
use glob::Pattern;

// =============================================================================
// Match Terms
// =============================================================================

/// One comma separated term from a filter config
#[derive(Debug, Clone)]
pub enum Term {
    /// Matched by substring (paths) or equality (everything else)
    Literal(String),
    /// Term containing glob metacharacters
    Glob(Pattern),
}

impl Term {
    pub fn parse(raw: &str) -> Self {
        if raw.contains(['*', '?', '[']) {
            if let Ok(pattern) = Pattern::new(raw) {
                return Term::Glob(pattern);
            }
        }
        Term::Literal(raw.to_string())
    }

    /// Path semantics: literal terms match anywhere in the value
    fn matches_substring(&self, value: &str) -> bool {
        match self {
            Term::Literal(term) => value.contains(term.as_str()),
            Term::Glob(pattern) => pattern.matches(value),
        }
    }

    fn matches_exact(&self, value: &str) -> bool {
        match self {
            Term::Literal(term) => value == term,
            Term::Glob(pattern) => pattern.matches(value),
        }
    }

    fn matches_ignore_case(&self, value: &str) -> bool {
        match self {
            Term::Literal(term) => value.eq_ignore_ascii_case(term),
            Term::Glob(pattern) => pattern.matches_with(
                value,
                glob::MatchOptions {
                    case_sensitive: false,
                    ..Default::default()
                },
            ),
        }
    }
}

fn parse_terms(raw: Vec<String>) -> Vec<Term> {
    raw.iter().map(|t| Term::parse(t)).collect()
}

// =============================================================================
// Filters
// =============================================================================

/// Include and exclude terms of one filter
#[derive(Debug, Clone, Default)]
pub struct FilterTerms {
    pub include: Vec<Term>,
    pub exclude: Vec<Term>,
}

impl FilterTerms {
    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            include: parse_terms(config.include_terms()),
            exclude: parse_terms(config.exclude_terms()),
        }
    }
}

/// The closed set of device filters
#[derive(Debug, Clone)]
pub enum Filter {
    /// Terms against the device path
    Path(FilterTerms),
    /// Terms against the vendor string
    Vendor(FilterTerms),
    /// Exclude terms are OS mount points
    OsDiskExclude(FilterTerms),
    /// Zero capacity devices, plus terms against the device kind
    DeviceValidity(FilterTerms),
}

impl Filter {
    pub const PATH: &'static str = "path-filter";
    pub const VENDOR: &'static str = "vendor-filter";
    pub const OS_DISK_EXCLUDE: &'static str = "os-disk-exclude-filter";
    pub const DEVICE_VALIDITY: &'static str = "device-validity-filter";

    /// Build a filter from its config; `None` for unknown keys
    pub fn from_config(config: &FilterConfig) -> Option<Self> {
        let terms = FilterTerms::from_config(config);
        match config.key.trim() {
            Self::PATH => Some(Filter::Path(terms)),
            Self::VENDOR => Some(Filter::Vendor(terms)),
            Self::OS_DISK_EXCLUDE => Some(Filter::OsDiskExclude(terms)),
            Self::DEVICE_VALIDITY => Some(Filter::DeviceValidity(terms)),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Filter::Path(_) => Self::PATH,
            Filter::Vendor(_) => Self::VENDOR,
            Filter::OsDiskExclude(_) => Self::OS_DISK_EXCLUDE,
            Filter::DeviceValidity(_) => Self::DEVICE_VALIDITY,
        }
    }

    fn terms(&self) -> &FilterTerms {
        match self {
            Filter::Path(t)
            | Filter::Vendor(t)
            | Filter::OsDiskExclude(t)
            | Filter::DeviceValidity(t) => t,
        }
    }

    /// Whether this filter hides the record
    pub fn excludes(&self, record: &DeviceRecord) -> bool {
        if let Filter::DeviceValidity(_) = self {
            if record.capacity_bytes == 0 {
                return true;
            }
        }

        let values = self.values(record);
        let terms = self.terms();

        if terms
            .exclude
            .iter()
            .any(|term| values.iter().any(|v| self.term_matches(term, v)))
        {
            return true;
        }

        !terms.include.is_empty()
            && !terms
                .include
                .iter()
                .any(|term| values.iter().any(|v| self.term_matches(term, v)))
    }

    /// Record values this filter matches its terms against
    fn values(&self, record: &DeviceRecord) -> Vec<String> {
        match self {
            Filter::Path(_) => vec![record.path.clone()],
            Filter::Vendor(_) => record.details.vendor.iter().cloned().collect(),
            Filter::OsDiskExclude(_) => record.mount_points().to_vec(),
            Filter::DeviceValidity(_) => record
                .details
                .kind
                .iter()
                .map(|kind| kind.to_string())
                .collect(),
        }
    }

    fn term_matches(&self, term: &Term, value: &str) -> bool {
        match self {
            Filter::Path(_) => term.matches_substring(value),
            Filter::Vendor(_) => term.matches_ignore_case(value),
            Filter::OsDiskExclude(_) | Filter::DeviceValidity(_) => term.matches_exact(value),
        }
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimState, DeviceDetails, DeviceIdentity, DeviceKind, FilesystemInfo};
    use chrono::Utc;

    pub(crate) fn record(path: &str) -> DeviceRecord {
        DeviceRecord {
            identity: DeviceIdentity::new("blockdevice-test"),
            host: "node-1".into(),
            path: path.into(),
            sysfs_path: None,
            capacity_bytes: 10 * 1024 * 1024 * 1024,
            logical_block_size: Some(512),
            physical_block_size: Some(4096),
            drive_type: Default::default(),
            details: DeviceDetails {
                vendor: Some("ATA".into()),
                kind: Some(DeviceKind::Disk),
                ..Default::default()
            },
            partition: None,
            filesystem: None,
            health: None,
            visible: false,
            claim_state: ClaimState::Unclaimed,
            stale: false,
            generation: 0,
            updated_at: Utc::now(),
        }
    }

    fn filter(key: &str, include: &str, exclude: &str) -> Filter {
        Filter::from_config(&FilterConfig::new(key, key, true, include, exclude)).unwrap()
    }

    #[test]
    fn test_path_terms_match_substrings() {
        let f = filter(Filter::PATH, "", "loop,/dev/sr0");
        assert!(f.excludes(&record("/dev/loop3")));
        assert!(f.excludes(&record("/dev/sr0")));
        assert!(!f.excludes(&record("/dev/sdb")));
    }

    #[test]
    fn test_path_glob_terms() {
        let f = filter(Filter::PATH, "/dev/sd*", "");
        assert!(!f.excludes(&record("/dev/sdb")));
        assert!(f.excludes(&record("/dev/nvme0n1")));
    }

    #[test]
    fn test_vendor_is_case_insensitive_equality() {
        let f = filter(Filter::VENDOR, "", "CLOUDBYT,OpenEBS");
        let mut r = record("/dev/sdb");
        r.details.vendor = Some("openebs".into());
        assert!(f.excludes(&r));

        r.details.vendor = Some("OpenEBSx".into());
        assert!(!f.excludes(&r));

        // Unknown vendor never matches an exclude term
        r.details.vendor = None;
        assert!(!f.excludes(&r));
    }

    #[test]
    fn test_os_disk_mount_points() {
        let f = filter(Filter::OS_DISK_EXCLUDE, "", "/,/etc/hosts,/boot");
        let mut r = record("/dev/sda");
        r.filesystem = Some(FilesystemInfo {
            mount_points: vec!["/boot".into()],
            ..Default::default()
        });
        assert!(f.excludes(&r));

        r.filesystem = Some(FilesystemInfo {
            mount_points: vec!["/mnt/data".into()],
            ..Default::default()
        });
        assert!(!f.excludes(&r));
    }

    #[test]
    fn test_device_validity() {
        let f = filter(Filter::DEVICE_VALIDITY, "", "partition");
        let mut r = record("/dev/sdb");
        assert!(!f.excludes(&r));

        r.details.kind = Some(DeviceKind::Partition);
        assert!(f.excludes(&r));

        r.details.kind = Some(DeviceKind::Disk);
        r.capacity_bytes = 0;
        assert!(f.excludes(&r));
    }

    #[test]
    fn test_unknown_filter_key() {
        assert!(Filter::from_config(&FilterConfig::new("udev-filter", "x", true, "", "")).is_none());
    }
}
