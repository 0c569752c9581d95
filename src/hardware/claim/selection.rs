//! Best-Fit Selection
//!
//! Picks the device for a claim: the smallest device that satisfies the
//! claim, ties broken by identity so the choice is deterministic.

use crate::domain::{ClaimRequest, DeviceRecord};
use std::cmp::Ordering;

/// Best-fit ordering: lowest capacity first, then lexicographic identity
pub fn best_fit_order(a: &DeviceRecord, b: &DeviceRecord) -> Ordering {
    a.capacity_bytes
        .cmp(&b.capacity_bytes)
        .then_with(|| a.identity.cmp(&b.identity))
}

/// Candidates satisfying the claim, best fit first
pub fn rank_candidates(mut candidates: Vec<DeviceRecord>, claim: &ClaimRequest) -> Vec<DeviceRecord> {
    candidates.retain(|device| device.is_available() && claim.constraints_match(device));
    candidates.sort_by(best_fit_order);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimState, DeviceDetails, DeviceIdentity, DriveType};
    use chrono::Utc;

    const GB: u64 = 1_000_000_000;

    fn make_device(id: &str, capacity_gb: u64, drive_type: DriveType) -> DeviceRecord {
        DeviceRecord {
            identity: DeviceIdentity::new(id),
            host: "node-1".into(),
            path: format!("/dev/{}", id),
            sysfs_path: None,
            capacity_bytes: capacity_gb * GB,
            logical_block_size: None,
            physical_block_size: None,
            drive_type,
            details: DeviceDetails::default(),
            partition: None,
            filesystem: None,
            health: None,
            visible: true,
            claim_state: ClaimState::Unclaimed,
            stale: false,
            generation: 1,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_best_fit_picks_smallest_sufficient() {
        let candidates = vec![
            make_device("blockdevice-a", 100, DriveType::Ssd),
            make_device("blockdevice-b", 150, DriveType::Ssd),
            make_device("blockdevice-c", 200, DriveType::Ssd),
        ];
        let claim = ClaimRequest::new("default/c1", 120 * GB, None, "node-1");

        let ranked = rank_candidates(candidates, &claim);
        assert_eq!(ranked[0].identity.as_str(), "blockdevice-b");
        assert_eq!(ranked.len(), 2);
    }

    #[test]
    fn test_ties_break_on_identity() {
        let candidates = vec![
            make_device("blockdevice-y", 150, DriveType::Ssd),
            make_device("blockdevice-x", 150, DriveType::Ssd),
        ];
        let claim = ClaimRequest::new("default/c1", 120 * GB, None, "node-1");

        let ranked = rank_candidates(candidates, &claim);
        assert_eq!(ranked[0].identity.as_str(), "blockdevice-x");
    }

    #[test]
    fn test_drive_type_and_host_constraints() {
        let mut remote = make_device("blockdevice-a", 500, DriveType::Ssd);
        remote.host = "node-2".into();
        let candidates = vec![
            remote,
            make_device("blockdevice-b", 150, DriveType::Hdd),
            make_device("blockdevice-c", 300, DriveType::Ssd),
        ];
        let claim = ClaimRequest::new("default/c1", 100 * GB, Some(DriveType::Ssd), "node-1");

        let ranked = rank_candidates(candidates, &claim);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].identity.as_str(), "blockdevice-c");
    }

    #[test]
    fn test_no_candidate() {
        let candidates = vec![make_device("blockdevice-a", 100, DriveType::Ssd)];
        let claim = ClaimRequest::new("default/c1", 120 * GB, None, "node-1");
        assert!(rank_candidates(candidates, &claim).is_empty());
    }

    #[test]
    fn test_rank_order() {
        let candidates = vec![
            make_device("blockdevice-c", 200, DriveType::Ssd),
            make_device("blockdevice-b", 150, DriveType::Ssd),
            make_device("blockdevice-a", 150, DriveType::Ssd),
        ];
        let claim = ClaimRequest::new("default/c1", 120 * GB, None, "node-1");
        let ranked: Vec<_> = rank_candidates(candidates, &claim)
            .into_iter()
            .map(|d| d.identity.0)
            .collect();
        assert_eq!(ranked, vec!["blockdevice-a", "blockdevice-b", "blockdevice-c"]);
    }
}
