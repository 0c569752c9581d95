//! Block Device Scanner
//!
//! Enumerates block devices from sysfs. Partitions are skipped; the blkid
//! and mount probes fold them into their parent disk.

use crate::error::Result;
use crate::hardware::probe::DeviceHandle;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Scanner Configuration
// =============================================================================

/// Configuration for the device scanner
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Path to sysfs (for testing)
    pub sysfs_root: PathBuf,
    /// Directory device nodes live in
    pub dev_dir: PathBuf,
    /// Kernel name prefixes never reported (the filter chain handles
    /// everything else)
    pub ignored_prefixes: Vec<String>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            dev_dir: PathBuf::from("/dev"),
            ignored_prefixes: Vec::new(),
        }
    }
}

// =============================================================================
// Scanned Device
// =============================================================================

/// Cheap sysfs attributes whose change means the device should be probed
/// again
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    pub size: Option<String>,
    pub read_only: Option<String>,
    pub removable: Option<String>,
    pub holders: Vec<String>,
    /// Partition children, e.g. `sda1`
    pub partitions: Vec<String>,
}

/// A device found by one scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub handle: DeviceHandle,
    pub fingerprint: Fingerprint,
}

// =============================================================================
// Device Scanner
// =============================================================================

/// Scans `<sysfs_root>/class/block`
#[derive(Debug, Clone)]
pub struct DeviceScanner {
    config: ScannerConfig,
}

impl DeviceScanner {
    pub fn new(config: ScannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// All whole block devices, ordered by name
    pub fn scan(&self) -> Result<Vec<ScannedDevice>> {
        let block_path = self.config.sysfs_root.join("class/block");
        if !block_path.exists() {
            debug!("No block class at {:?}", block_path);
            return Ok(Vec::new());
        }

        let mut devices = Vec::new();
        for entry in fs::read_dir(&block_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();

            if !self.should_include_device(&name) {
                continue;
            }

            let sysfs_path = entry.path();
            if is_partition(&sysfs_path) {
                continue;
            }

            let dev_path = self.config.dev_dir.join(&name);
            devices.push(ScannedDevice {
                handle: DeviceHandle {
                    name,
                    dev_path: dev_path.to_string_lossy().to_string(),
                    sysfs_path: sysfs_path.clone(),
                },
                fingerprint: fingerprint(&sysfs_path),
            });
        }

        devices.sort_by(|a, b| a.handle.name.cmp(&b.handle.name));
        Ok(devices)
    }

    /// Check if a device should be reported at all
    fn should_include_device(&self, name: &str) -> bool {
        !self
            .config
            .ignored_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

/// Partitions have a "partition" file
pub fn is_partition(sysfs_path: &Path) -> bool {
    sysfs_path.join("partition").exists()
}

fn fingerprint(sysfs_path: &Path) -> Fingerprint {
    let read = |attr: &str| {
        fs::read_to_string(sysfs_path.join(attr))
            .ok()
            .map(|v| v.trim().to_string())
    };

    let list = |dir: &Path, keep: &dyn Fn(&Path) -> bool| {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| keep(&e.path()))
                    .map(|e| e.file_name().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    };

    Fingerprint {
        size: read("size"),
        read_only: read("ro"),
        removable: read("removable"),
        holders: list(&sysfs_path.join("holders"), &|_: &Path| true),
        partitions: list(sysfs_path, &is_partition),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Create `<root>/class/block/<name>` with a size attribute
    pub(crate) fn add_device(root: &Path, name: &str, sectors: u64) -> PathBuf {
        let dir = root.join("class/block").join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("size"), format!("{}\n", sectors)).unwrap();
        fs::write(dir.join("ro"), "0\n").unwrap();
        fs::write(dir.join("removable"), "0\n").unwrap();
        dir
    }

    fn scanner(root: &Path) -> DeviceScanner {
        DeviceScanner::new(ScannerConfig {
            sysfs_root: root.to_path_buf(),
            ..Default::default()
        })
    }

    #[test]
    fn test_scan_skips_partitions() {
        let dir = TempDir::new().unwrap();
        add_device(dir.path(), "sdb", 2048);
        add_device(dir.path(), "sda", 2048);
        let part = add_device(dir.path(), "sda1", 1024);
        fs::write(part.join("partition"), "1\n").unwrap();

        let names: Vec<_> = scanner(dir.path())
            .scan()
            .unwrap()
            .into_iter()
            .map(|d| d.handle.dev_path)
            .collect();
        assert_eq!(names, vec!["/dev/sda", "/dev/sdb"]);
    }

    #[test]
    fn test_ignored_prefixes() {
        let dir = TempDir::new().unwrap();
        add_device(dir.path(), "sda", 2048);
        add_device(dir.path(), "zram0", 2048);

        let scanner = DeviceScanner::new(ScannerConfig {
            sysfs_root: dir.path().to_path_buf(),
            ignored_prefixes: vec!["zram".to_string()],
            ..Default::default()
        });
        let scanned = scanner.scan().unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].handle.name, "sda");
    }

    #[test]
    fn test_fingerprint_reads_holders() {
        let dir = TempDir::new().unwrap();
        let sda = add_device(dir.path(), "sda", 2048);
        fs::create_dir_all(sda.join("holders/dm-1")).unwrap();
        fs::create_dir_all(sda.join("holders/dm-0")).unwrap();

        let scanned = scanner(dir.path()).scan().unwrap();
        let fp = &scanned[0].fingerprint;
        assert_eq!(fp.size.as_deref(), Some("2048"));
        assert_eq!(fp.holders, vec!["dm-0", "dm-1"]);
    }

    #[test]
    fn test_missing_sysfs_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(scanner(&dir.path().join("absent")).scan().unwrap().is_empty());
    }
}
