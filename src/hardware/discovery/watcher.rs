//! Device Watcher
//!
//! Turns successive scans into device observations.
//!
//! The sysfs fingerprint only covers what sysfs shows. Mount state and
//! on-disk metadata change without touching it, so every `resync_every`
//! polls each known device is reported as `Changed` and goes through the
//! pipeline again. Unchanged results are absorbed by the inventory.

use super::scanner::{DeviceScanner, ScannedDevice};
use crate::config::{Feature, FeatureGates};
use crate::domain::{DeviceObservation, ObservationKind};
use crate::error::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Polls between full re-probes unless configured otherwise
pub const DEFAULT_RESYNC_EVERY: u32 = 6;

/// Poll-based source of `DeviceObservation`s
pub struct DeviceWatcher {
    scanner: DeviceScanner,
    gates: Arc<FeatureGates>,
    /// Last scan keyed by device path; `None` before the first poll
    previous: Option<BTreeMap<String, ScannedDevice>>,
    resync_every: u32,
    polls: u64,
}

impl DeviceWatcher {
    pub fn new(scanner: DeviceScanner, gates: Arc<FeatureGates>) -> Self {
        Self {
            scanner,
            gates,
            previous: None,
            resync_every: DEFAULT_RESYNC_EVERY,
            polls: 0,
        }
    }

    /// Re-probe every known device each `polls` polls; 0 disables it
    pub fn with_resync_every(mut self, polls: u32) -> Self {
        self.resync_every = polls;
        self
    }

    /// Rescan and report what changed since the previous poll. The first
    /// poll reports every device as added.
    pub fn poll(&mut self) -> Result<Vec<DeviceObservation>> {
        let current: BTreeMap<String, ScannedDevice> = self
            .scanner
            .scan()?
            .into_iter()
            .map(|d| (d.handle.dev_path.clone(), d))
            .collect();

        self.polls += 1;
        let change_detection = self.gates.is_enabled(Feature::ChangeDetection);
        let resync = self.resync_every > 0 && self.polls % u64::from(self.resync_every) == 0;
        let mut observations = Vec::new();

        match &self.previous {
            None => {
                info!(devices = current.len(), "Initial device scan");
                observations.extend(current.values().map(|d| added(d, ObservationKind::Added)));
            }
            Some(previous) => {
                if resync {
                    debug!(devices = current.len(), "Periodic re-probe");
                }
                for (path, device) in &current {
                    match previous.get(path) {
                        None => observations.push(added(device, ObservationKind::Added)),
                        Some(before) if change_detection && before.fingerprint != device.fingerprint => {
                            debug!(path = %path, "Device attributes changed");
                            observations.push(added(device, ObservationKind::Changed));
                        }
                        Some(_) if resync => {
                            observations.push(added(device, ObservationKind::Changed));
                        }
                        Some(_) => {}
                    }
                }
                for path in previous.keys() {
                    if !current.contains_key(path) {
                        observations.push(DeviceObservation::removed(path.clone()));
                    }
                }
            }
        }

        self.previous = Some(current);
        Ok(observations)
    }
}

fn added(device: &ScannedDevice, kind: ObservationKind) -> DeviceObservation {
    DeviceObservation::new(
        device.handle.dev_path.clone(),
        Some(device.handle.sysfs_path.to_string_lossy().to_string()),
        kind,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::discovery::scanner::tests::add_device;
    use crate::hardware::discovery::ScannerConfig;
    use std::fs;
    use tempfile::TempDir;

    fn watcher(root: &std::path::Path, gates: FeatureGates) -> DeviceWatcher {
        DeviceWatcher::new(
            DeviceScanner::new(ScannerConfig {
                sysfs_root: root.to_path_buf(),
                ..Default::default()
            }),
            Arc::new(gates),
        )
    }

    fn kinds(observations: &[DeviceObservation]) -> Vec<(String, ObservationKind)> {
        observations.iter().map(|o| (o.path.clone(), o.kind)).collect()
    }

    #[test]
    fn test_first_poll_adds_everything() {
        let dir = TempDir::new().unwrap();
        add_device(dir.path(), "sda", 2048);
        add_device(dir.path(), "sdb", 2048);

        let mut watcher = watcher(dir.path(), FeatureGates::default());
        let observations = watcher.poll().unwrap();
        assert_eq!(
            kinds(&observations),
            vec![
                ("/dev/sda".to_string(), ObservationKind::Added),
                ("/dev/sdb".to_string(), ObservationKind::Added),
            ]
        );
        assert!(observations[0].sysfs_path.as_deref().unwrap().ends_with("class/block/sda"));
        assert!(watcher.poll().unwrap().is_empty());
    }

    #[test]
    fn test_add_and_remove() {
        let dir = TempDir::new().unwrap();
        let sda = add_device(dir.path(), "sda", 2048);
        let mut watcher = watcher(dir.path(), FeatureGates::default());
        watcher.poll().unwrap();

        fs::remove_dir_all(sda).unwrap();
        add_device(dir.path(), "sdc", 2048);
        assert_eq!(
            kinds(&watcher.poll().unwrap()),
            vec![
                ("/dev/sdc".to_string(), ObservationKind::Added),
                ("/dev/sda".to_string(), ObservationKind::Removed),
            ]
        );
    }

    #[test]
    fn test_periodic_resync_reports_every_device() {
        let dir = TempDir::new().unwrap();
        add_device(dir.path(), "sda", 2048);
        add_device(dir.path(), "sdb", 2048);

        let mut watcher = watcher(dir.path(), FeatureGates::default()).with_resync_every(3);
        assert_eq!(watcher.poll().unwrap().len(), 2);
        assert!(watcher.poll().unwrap().is_empty());
        assert_eq!(
            kinds(&watcher.poll().unwrap()),
            vec![
                ("/dev/sda".to_string(), ObservationKind::Changed),
                ("/dev/sdb".to_string(), ObservationKind::Changed),
            ]
        );
        assert!(watcher.poll().unwrap().is_empty());
    }

    #[test]
    fn test_resync_disabled() {
        let dir = TempDir::new().unwrap();
        add_device(dir.path(), "sda", 2048);

        let mut watcher = watcher(dir.path(), FeatureGates::default()).with_resync_every(0);
        watcher.poll().unwrap();
        for _ in 0..10 {
            assert!(watcher.poll().unwrap().is_empty());
        }
    }

    #[test]
    fn test_new_partition_is_a_change() {
        let dir = TempDir::new().unwrap();
        let sda = add_device(dir.path(), "sda", 2048);
        let mut watcher = watcher(
            dir.path(),
            FeatureGates::with_enabled(&[Feature::ChangeDetection]),
        )
        .with_resync_every(0);
        watcher.poll().unwrap();

        fs::create_dir_all(sda.join("sda1")).unwrap();
        fs::write(sda.join("sda1/partition"), "1\n").unwrap();
        assert_eq!(
            kinds(&watcher.poll().unwrap()),
            vec![("/dev/sda".to_string(), ObservationKind::Changed)]
        );
    }

    #[test]
    fn test_change_detection_gate() {
        let dir = TempDir::new().unwrap();
        let sda = add_device(dir.path(), "sda", 2048);

        let mut without = watcher(dir.path(), FeatureGates::default());
        let mut with = watcher(
            dir.path(),
            FeatureGates::with_enabled(&[Feature::ChangeDetection]),
        );
        without.poll().unwrap();
        with.poll().unwrap();

        fs::write(sda.join("size"), "4096\n").unwrap();
        assert!(without.poll().unwrap().is_empty());
        assert_eq!(
            kinds(&with.poll().unwrap()),
            vec![("/dev/sda".to_string(), ObservationKind::Changed)]
        );
    }
}
