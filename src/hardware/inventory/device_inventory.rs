//! Sharded Device Inventory
//!
//! A 64-way sharded store of canonical device records keyed by identity.
//! Every write to an identity happens under its shard's write lock, which
//! is also where inventory events are emitted, so subscribers observe the
//! writes to one identity in order.

use super::{InventoryDelta, InventoryEvent};
use crate::domain::{ClaimKey, ClaimRef, ClaimState, DeviceIdentity, DeviceRecord, DriveType};
use crate::error::{Error, Result};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

// =============================================================================
// Constants
// =============================================================================

/// Number of shards in the inventory
pub const INVENTORY_SHARD_COUNT: usize = 64;

/// Capacity of the event broadcast buffer
pub const INVENTORY_EVENT_CAPACITY: usize = 1024;

// =============================================================================
// Shard Statistics
// =============================================================================

/// Statistics for a single shard
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct ShardStats {
    /// Number of devices in shard
    pub device_count: AtomicU64,
    /// Total writes to this shard
    pub update_count: AtomicU64,
}

// =============================================================================
// Inventory Shard
// =============================================================================

/// A single shard of the inventory
#[repr(C, align(64))]
pub struct InventoryShard {
    devices: RwLock<HashMap<DeviceIdentity, DeviceRecord>>,
    stats: ShardStats,
}

impl std::fmt::Debug for InventoryShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryShard")
            .field("device_count", &self.stats.device_count.load(Ordering::Relaxed))
            .field("update_count", &self.stats.update_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl InventoryShard {
    fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            stats: ShardStats::default(),
        }
    }

    fn device_count(&self) -> usize {
        self.stats.device_count.load(Ordering::Relaxed) as usize
    }

    fn get(&self, identity: &DeviceIdentity) -> Option<DeviceRecord> {
        self.devices.read().get(identity).cloned()
    }

    fn records(&self) -> Vec<DeviceRecord> {
        self.devices.read().values().cloned().collect()
    }
}

// =============================================================================
// Inventory Statistics
// =============================================================================

/// Counters across all shards
#[derive(Debug, Default)]
pub struct InventoryStats {
    pub devices: AtomicU64,
    pub created: AtomicU64,
    pub updated: AtomicU64,
    /// Upserts that carried no semantic change
    pub unchanged: AtomicU64,
    pub removed: AtomicU64,
    pub marked_stale: AtomicU64,
    pub binds: AtomicU64,
    pub bind_conflicts: AtomicU64,
    pub releases: AtomicU64,
}

impl InventoryStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> InventoryStatsSnapshot {
        InventoryStatsSnapshot {
            devices: self.devices.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            marked_stale: self.marked_stale.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            bind_conflicts: self.bind_conflicts.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of inventory statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InventoryStatsSnapshot {
    pub devices: u64,
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub removed: u64,
    pub marked_stale: u64,
    pub binds: u64,
    pub bind_conflicts: u64,
    pub releases: u64,
}

// =============================================================================
// Device Inventory
// =============================================================================

/// Authoritative per-node device store
pub struct DeviceInventory {
    shards: Box<[InventoryShard]>,
    /// Current OS path to identity. Lock order: shard, then paths.
    paths: RwLock<HashMap<String, DeviceIdentity>>,
    stats: InventoryStats,
    event_sender: broadcast::Sender<InventoryEvent>,
}

impl std::fmt::Debug for DeviceInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInventory")
            .field("devices", &self.len())
            .finish()
    }
}

impl DeviceInventory {
    /// Create a new device inventory
    pub fn new() -> Arc<Self> {
        Self::with_event_capacity(INVENTORY_EVENT_CAPACITY)
    }

    /// Create an inventory with a custom event buffer
    pub fn with_event_capacity(capacity: usize) -> Arc<Self> {
        let shards: Vec<InventoryShard> = (0..INVENTORY_SHARD_COUNT)
            .map(|_| InventoryShard::new())
            .collect();
        let (event_sender, _) = broadcast::channel(capacity.max(1));

        Arc::new(Self {
            shards: shards.into_boxed_slice(),
            paths: RwLock::new(HashMap::new()),
            stats: InventoryStats::default(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<InventoryEvent> {
        self.event_sender.subscribe()
    }

    #[inline]
    fn shard(&self, identity: &DeviceIdentity) -> &InventoryShard {
        &self.shards[identity.shard_index(INVENTORY_SHARD_COUNT)]
    }

    fn emit(&self, event: InventoryEvent) {
        // No receivers is fine
        let _ = self.event_sender.send(event);
    }

    /// Create or update a record. Claim state is owned by the inventory and
    /// survives updates; a re-appearing device is no longer stale.
    pub fn upsert(&self, mut record: DeviceRecord) -> InventoryDelta {
        let shard = self.shard(&record.identity);
        let mut devices = shard.devices.write();

        let delta = match devices.get(&record.identity) {
            Some(existing) => {
                record.claim_state = existing.claim_state.clone();
                record.stale = false;
                if existing.semantically_eq(&record) {
                    self.stats.unchanged.fetch_add(1, Ordering::Relaxed);
                    return InventoryDelta::Unchanged(existing.clone());
                }

                record.generation = existing.generation + 1;
                record.updated_at = Utc::now();
                let previous = existing.clone();
                if previous.path != record.path {
                    self.reindex_path(&previous.path, &record);
                }

                devices.insert(record.identity.clone(), record.clone());
                self.stats.updated.fetch_add(1, Ordering::Relaxed);
                self.emit(InventoryEvent::Updated {
                    identity: record.identity.clone(),
                    available: record.is_available(),
                });
                InventoryDelta::Updated {
                    previous,
                    current: record,
                }
            }
            None => {
                record.claim_state = ClaimState::Unclaimed;
                record.stale = false;
                record.generation = 1;
                record.updated_at = Utc::now();
                self.paths
                    .write()
                    .insert(record.path.clone(), record.identity.clone());

                devices.insert(record.identity.clone(), record.clone());
                shard.stats.device_count.fetch_add(1, Ordering::Relaxed);
                self.stats.devices.fetch_add(1, Ordering::Relaxed);
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                self.emit(InventoryEvent::Added {
                    identity: record.identity.clone(),
                    available: record.is_available(),
                });
                InventoryDelta::Created(record)
            }
        };

        shard.stats.update_count.fetch_add(1, Ordering::Relaxed);
        delta
    }

    fn reindex_path(&self, old_path: &str, record: &DeviceRecord) {
        let mut paths = self.paths.write();
        if paths.get(old_path) == Some(&record.identity) {
            paths.remove(old_path);
        }
        paths.insert(record.path.clone(), record.identity.clone());
    }

    fn unindex_path(&self, record: &DeviceRecord) {
        let mut paths = self.paths.write();
        if paths.get(&record.path) == Some(&record.identity) {
            paths.remove(&record.path);
        }
    }

    /// The device left the host. Unclaimed entries are deleted; claimed
    /// entries are kept, hidden and flagged stale until their claim lets go.
    pub fn remove(&self, identity: &DeviceIdentity) -> InventoryDelta {
        let shard = self.shard(identity);
        let mut devices = shard.devices.write();

        let Some(existing) = devices.get_mut(identity) else {
            return InventoryDelta::NotFound;
        };

        let delta = match existing.claim_state.holder().cloned() {
            Some(claim) => {
                if existing.stale {
                    return InventoryDelta::Unchanged(existing.clone());
                }
                existing.stale = true;
                existing.visible = false;
                existing.generation += 1;
                existing.updated_at = Utc::now();
                let record = existing.clone();
                self.unindex_path(&record);

                self.stats.marked_stale.fetch_add(1, Ordering::Relaxed);
                warn!(identity = %identity, claim = %claim, "Claimed device removed from host, marked stale");
                self.emit(InventoryEvent::Stale {
                    identity: identity.clone(),
                    claim,
                });
                InventoryDelta::MarkedStale(record)
            }
            None => {
                let record = existing.clone();
                devices.remove(identity);
                self.delete_bookkeeping(shard, &record);
                InventoryDelta::Removed(record)
            }
        };

        shard.stats.update_count.fetch_add(1, Ordering::Relaxed);
        delta
    }

    // Caller holds the shard write lock and has already removed the entry
    fn delete_bookkeeping(&self, shard: &InventoryShard, record: &DeviceRecord) {
        self.unindex_path(record);
        shard.stats.device_count.fetch_sub(1, Ordering::Relaxed);
        self.stats.devices.fetch_sub(1, Ordering::Relaxed);
        self.stats.removed.fetch_add(1, Ordering::Relaxed);
        debug!(identity = %record.identity, "Device removed from inventory");
        self.emit(InventoryEvent::Removed {
            identity: record.identity.clone(),
        });
    }

    /// Get a record by identity
    pub fn get(&self, identity: &DeviceIdentity) -> Option<DeviceRecord> {
        self.shard(identity).get(identity)
    }

    /// Identity of the device currently at `path`
    pub fn identity_for_path(&self, path: &str) -> Option<DeviceIdentity> {
        self.paths.read().get(path).cloned()
    }

    /// Copy of every record
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records = Vec::with_capacity(self.len());
        for shard in self.shards.iter() {
            records.extend(shard.records());
        }
        records
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.device_count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible, unclaimed, non-stale records on `host` satisfying the size
    /// and drive type constraints
    pub fn eligible(
        &self,
        host: &str,
        min_capacity: u64,
        drive_type: Option<DriveType>,
    ) -> Vec<DeviceRecord> {
        let mut candidates = Vec::new();
        for shard in self.shards.iter() {
            let devices = shard.devices.read();
            candidates.extend(
                devices
                    .values()
                    .filter(|r| {
                        r.is_available()
                            && r.host == host
                            && r.capacity_bytes >= min_capacity
                            && drive_type.map_or(true, |t| r.drive_type == t)
                    })
                    .cloned(),
            );
        }
        candidates
    }

    /// Stale entries with the claim still holding them
    pub fn stale_entries(&self) -> Vec<(DeviceIdentity, Option<ClaimKey>)> {
        let mut entries = Vec::new();
        for shard in self.shards.iter() {
            let devices = shard.devices.read();
            entries.extend(
                devices
                    .values()
                    .filter(|r| r.stale)
                    .map(|r| (r.identity.clone(), r.claim_state.holder().cloned())),
            );
        }
        entries
    }

    /// Atomically check that a device is free and mark it claimed
    pub fn bind(&self, identity: &DeviceIdentity, claim: &ClaimKey) -> Result<DeviceRecord> {
        let shard = self.shard(identity);
        let mut devices = shard.devices.write();

        let Some(record) = devices.get_mut(identity) else {
            return Err(Error::DeviceNotEligible {
                device: identity.to_string(),
                reason: "device vanished".to_string(),
            });
        };

        if let Some(holder) = record.claim_state.holder() {
            if holder == claim {
                return Ok(record.clone());
            }
            self.stats.bind_conflicts.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ExclusivityViolation {
                device: identity.to_string(),
                holder: holder.to_string(),
                claim: claim.to_string(),
            });
        }

        if record.stale || !record.visible {
            return Err(Error::DeviceNotEligible {
                device: identity.to_string(),
                reason: if record.stale {
                    "device is stale".to_string()
                } else {
                    "device is filtered out".to_string()
                },
            });
        }

        record.claim_state = ClaimState::Claimed(ClaimRef {
            claim: claim.clone(),
            bound_at: Utc::now(),
        });
        record.generation += 1;
        record.updated_at = Utc::now();
        let bound = record.clone();

        shard.stats.update_count.fetch_add(1, Ordering::Relaxed);
        self.stats.binds.fetch_add(1, Ordering::Relaxed);
        self.emit(InventoryEvent::Updated {
            identity: identity.clone(),
            available: false,
        });
        Ok(bound)
    }

    /// Unbind a device held by `claim`. A stale device is deleted instead.
    pub fn release(&self, identity: &DeviceIdentity, claim: &ClaimKey) -> Result<InventoryDelta> {
        let shard = self.shard(identity);
        let mut devices = shard.devices.write();

        let Some(record) = devices.get_mut(identity) else {
            return Err(Error::DeviceNotFound {
                device: identity.to_string(),
            });
        };

        if record.claim_state.holder() != Some(claim) {
            debug!(identity = %identity, claim = %claim, "Release by non-holder ignored");
            return Ok(InventoryDelta::Unchanged(record.clone()));
        }

        self.stats.releases.fetch_add(1, Ordering::Relaxed);
        shard.stats.update_count.fetch_add(1, Ordering::Relaxed);

        if record.stale {
            let removed = record.clone();
            devices.remove(identity);
            self.delete_bookkeeping(shard, &removed);
            return Ok(InventoryDelta::Removed(removed));
        }

        let previous = record.clone();
        record.claim_state = ClaimState::Unclaimed;
        record.generation += 1;
        record.updated_at = Utc::now();
        let current = record.clone();

        self.emit(InventoryEvent::Updated {
            identity: identity.clone(),
            available: current.is_available(),
        });
        Ok(InventoryDelta::Updated { previous, current })
    }

    /// Delete a stale entry, returning the claim that held it
    pub fn release_stale(&self, identity: &DeviceIdentity) -> Option<ClaimRef> {
        let shard = self.shard(identity);
        let mut devices = shard.devices.write();

        if !devices.get(identity).map(|r| r.stale).unwrap_or(false) {
            return None;
        }
        let record = devices.remove(identity)?;
        self.delete_bookkeeping(shard, &record);
        if record.claim_state.is_claimed() {
            self.stats.releases.fetch_add(1, Ordering::Relaxed);
        }

        match record.claim_state {
            ClaimState::Claimed(claim_ref) => Some(claim_ref),
            ClaimState::Unclaimed => None,
        }
    }

    /// Get inventory statistics
    pub fn stats(&self) -> InventoryStatsSnapshot {
        self.stats.snapshot()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DeviceDetails;
    use assert_matches::assert_matches;

    const GB: u64 = 1024 * 1024 * 1024;

    fn device(id: &str, path: &str, capacity_gb: u64) -> DeviceRecord {
        DeviceRecord {
            identity: DeviceIdentity::new(id),
            host: "node-1".into(),
            path: path.into(),
            sysfs_path: None,
            capacity_bytes: capacity_gb * GB,
            logical_block_size: Some(512),
            physical_block_size: Some(512),
            drive_type: DriveType::Ssd,
            details: DeviceDetails::default(),
            partition: None,
            filesystem: None,
            health: None,
            visible: true,
            claim_state: ClaimState::Unclaimed,
            stale: false,
            generation: 0,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_shard_alignment() {
        assert_eq!(std::mem::align_of::<InventoryShard>(), 64);
    }

    #[test]
    fn test_upsert_and_get() {
        let inventory = DeviceInventory::new();
        let delta = inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));
        assert_matches!(delta, InventoryDelta::Created(ref r) if r.generation == 1);

        let record = inventory.get(&DeviceIdentity::new("blockdevice-a")).unwrap();
        assert_eq!(record.path, "/dev/sdb");
        assert_eq!(
            inventory.identity_for_path("/dev/sdb"),
            Some(DeviceIdentity::new("blockdevice-a"))
        );
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory.stats().created, 1);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let inventory = DeviceInventory::new();
        let mut rx = inventory.subscribe();
        inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));
        let delta = inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));

        assert_matches!(delta, InventoryDelta::Unchanged(ref r) if r.generation == 1);
        assert_matches!(rx.try_recv(), Ok(InventoryEvent::Added { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_upsert_preserves_claim_state() {
        let inventory = DeviceInventory::new();
        let id = DeviceIdentity::new("blockdevice-a");
        let claim = ClaimKey::new("default/c1");
        inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));
        inventory.bind(&id, &claim).unwrap();

        // Path changes after a reboot; the binding survives
        let delta = inventory.upsert(device("blockdevice-a", "/dev/sdc", 100));
        let current = delta.current().unwrap();
        assert_eq!(current.claim_state.holder(), Some(&claim));
        assert_eq!(current.path, "/dev/sdc");
        assert_eq!(inventory.identity_for_path("/dev/sdb"), None);
        assert_eq!(inventory.identity_for_path("/dev/sdc"), Some(id));
    }

    #[test]
    fn test_remove_unclaimed_deletes() {
        let inventory = DeviceInventory::new();
        let id = DeviceIdentity::new("blockdevice-a");
        inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));

        assert_matches!(inventory.remove(&id), InventoryDelta::Removed(_));
        assert!(inventory.get(&id).is_none());
        assert!(inventory.is_empty());
        assert_matches!(inventory.remove(&id), InventoryDelta::NotFound);
    }

    #[test]
    fn test_remove_claimed_marks_stale() {
        let inventory = DeviceInventory::new();
        let mut rx = inventory.subscribe();
        let id = DeviceIdentity::new("blockdevice-a");
        let claim = ClaimKey::new("default/c1");
        inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));
        inventory.bind(&id, &claim).unwrap();

        assert_matches!(inventory.remove(&id), InventoryDelta::MarkedStale(ref r) if r.stale && !r.visible);
        assert_eq!(inventory.stale_entries(), vec![(id.clone(), Some(claim.clone()))]);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_matches!(events.last(), Some(InventoryEvent::Stale { claim: c, .. }) if *c == claim);

        let claim_ref = inventory.release_stale(&id).unwrap();
        assert_eq!(claim_ref.claim, claim);
        assert!(inventory.get(&id).is_none());
    }

    #[test]
    fn test_bind_is_exclusive() {
        let inventory = DeviceInventory::new();
        let id = DeviceIdentity::new("blockdevice-a");
        inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));

        inventory.bind(&id, &ClaimKey::new("default/c1")).unwrap();
        // Rebinding by the holder is a no-op
        inventory.bind(&id, &ClaimKey::new("default/c1")).unwrap();

        let err = inventory.bind(&id, &ClaimKey::new("default/c2")).unwrap_err();
        assert_matches!(err, Error::ExclusivityViolation { .. });
        assert_eq!(inventory.stats().bind_conflicts, 1);
    }

    #[test]
    fn test_bind_rejects_hidden_devices() {
        let inventory = DeviceInventory::new();
        let mut hidden = device("blockdevice-a", "/dev/loop0", 100);
        hidden.visible = false;
        inventory.upsert(hidden);

        let err = inventory
            .bind(&DeviceIdentity::new("blockdevice-a"), &ClaimKey::new("default/c1"))
            .unwrap_err();
        assert_matches!(err, Error::DeviceNotEligible { .. });

        let err = inventory
            .bind(&DeviceIdentity::new("blockdevice-zz"), &ClaimKey::new("default/c1"))
            .unwrap_err();
        assert_matches!(err, Error::DeviceNotEligible { .. });
    }

    #[test]
    fn test_release() {
        let inventory = DeviceInventory::new();
        let id = DeviceIdentity::new("blockdevice-a");
        let claim = ClaimKey::new("default/c1");
        inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));
        inventory.bind(&id, &claim).unwrap();

        // Only the holder can release
        let delta = inventory.release(&id, &ClaimKey::new("default/other")).unwrap();
        assert_matches!(delta, InventoryDelta::Unchanged(_));

        let delta = inventory.release(&id, &claim).unwrap();
        assert!(delta.current().unwrap().is_available());
    }

    #[test]
    fn test_eligible_filters_candidates() {
        let inventory = DeviceInventory::new();
        inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));
        inventory.upsert(device("blockdevice-b", "/dev/sdc", 200));
        let mut hdd = device("blockdevice-c", "/dev/sdd", 300);
        hdd.drive_type = DriveType::Hdd;
        inventory.upsert(hdd);
        let mut remote = device("blockdevice-d", "/dev/sde", 300);
        remote.host = "node-2".into();
        inventory.upsert(remote);

        let mut ids: Vec<_> = inventory
            .eligible("node-1", 150 * GB, None)
            .into_iter()
            .map(|r| r.identity.0)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["blockdevice-b", "blockdevice-c"]);

        let ssd = inventory.eligible("node-1", 150 * GB, Some(DriveType::Ssd));
        assert_eq!(ssd.len(), 1);

        inventory
            .bind(&DeviceIdentity::new("blockdevice-b"), &ClaimKey::new("default/c1"))
            .unwrap();
        assert!(inventory
            .eligible("node-1", 150 * GB, Some(DriveType::Ssd))
            .is_empty());
    }

    #[test]
    fn test_reappearing_device_is_no_longer_stale() {
        let inventory = DeviceInventory::new();
        let id = DeviceIdentity::new("blockdevice-a");
        inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));
        inventory.bind(&id, &ClaimKey::new("default/c1")).unwrap();
        inventory.remove(&id);

        let delta = inventory.upsert(device("blockdevice-a", "/dev/sdb", 100));
        let current = delta.current().unwrap();
        assert!(!current.stale);
        assert!(current.claim_state.is_claimed());
        assert!(inventory.stale_entries().is_empty());
    }
}
