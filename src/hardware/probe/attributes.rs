//! Partial Device Attributes
//!
//! Each probe contributes a `DeviceAttributes` with only the fields it could
//! determine. Contributions are merged fill-only: a field that an earlier
//! (higher priority) probe has set is never overwritten.

use crate::domain::{
    DeviceDetails, DeviceKind, DriveType, FilesystemInfo, HealthAttributes, PartitionInfo,
};
use serde::{Deserialize, Serialize};

/// Partial attribute set contributed by one probe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAttributes {
    // Identification
    pub serial: Option<String>,
    pub wwn: Option<String>,
    pub model: Option<String>,
    pub vendor: Option<String>,
    pub firmware: Option<String>,
    pub kind: Option<DeviceKind>,
    pub removable: Option<bool>,

    // Capacity
    pub capacity_bytes: Option<u64>,
    pub logical_block_size: Option<u32>,
    pub physical_block_size: Option<u32>,
    pub drive_type: Option<DriveType>,

    // Partitioning
    pub partition_table_type: Option<String>,
    pub partition_table_uuid: Option<String>,
    pub partitions: Option<Vec<String>>,

    // Filesystem
    pub fs_type: Option<String>,
    pub fs_uuid: Option<String>,
    pub mount_points: Option<Vec<String>>,

    pub health: Option<HealthAttributes>,
}

#[inline]
fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

impl DeviceAttributes {
    /// Fill every unset field from a lower priority contribution
    pub fn merge_from(&mut self, other: DeviceAttributes) {
        fill(&mut self.serial, other.serial);
        fill(&mut self.wwn, other.wwn);
        fill(&mut self.model, other.model);
        fill(&mut self.vendor, other.vendor);
        fill(&mut self.firmware, other.firmware);
        fill(&mut self.kind, other.kind);
        fill(&mut self.removable, other.removable);
        fill(&mut self.capacity_bytes, other.capacity_bytes);
        fill(&mut self.logical_block_size, other.logical_block_size);
        fill(&mut self.physical_block_size, other.physical_block_size);
        fill(&mut self.drive_type, other.drive_type);
        fill(&mut self.partition_table_type, other.partition_table_type);
        fill(&mut self.partition_table_uuid, other.partition_table_uuid);
        fill(&mut self.partitions, other.partitions);
        fill(&mut self.fs_type, other.fs_type);
        fill(&mut self.fs_uuid, other.fs_uuid);
        fill(&mut self.mount_points, other.mount_points);
        fill(&mut self.health, other.health);
    }

    /// Merge contributions in priority order (first wins)
    pub fn merge_all(contributions: impl IntoIterator<Item = DeviceAttributes>) -> Self {
        let mut merged = DeviceAttributes::default();
        for contribution in contributions {
            merged.merge_from(contribution);
        }
        merged
    }

    pub fn details(&self) -> DeviceDetails {
        DeviceDetails {
            serial: self.serial.clone(),
            wwn: self.wwn.clone(),
            model: self.model.clone(),
            vendor: self.vendor.clone(),
            firmware: self.firmware.clone(),
            kind: self.kind,
            removable: self.removable,
        }
    }

    /// Partition info, if any partitioning attribute is known
    pub fn partition_info(&self) -> Option<PartitionInfo> {
        if self.partition_table_type.is_none()
            && self.partition_table_uuid.is_none()
            && self.partitions.is_none()
        {
            return None;
        }
        Some(PartitionInfo {
            table_type: self.partition_table_type.clone(),
            table_uuid: self.partition_table_uuid.clone(),
            partitions: self.partitions.clone().unwrap_or_default(),
        })
    }

    /// Filesystem info, if any filesystem attribute is known
    pub fn filesystem_info(&self) -> Option<FilesystemInfo> {
        if self.fs_type.is_none() && self.fs_uuid.is_none() && self.mount_points.is_none() {
            return None;
        }
        Some(FilesystemInfo {
            fs_type: self.fs_type.clone(),
            fs_uuid: self.fs_uuid.clone(),
            mount_points: self.mount_points.clone().unwrap_or_default(),
        })
    }
}

/// Trim a raw attribute value, mapping blanks to `None`
pub fn non_empty(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_higher_priority_value_is_kept() {
        let a = DeviceAttributes {
            drive_type: Some(DriveType::Ssd),
            ..Default::default()
        };
        let b = DeviceAttributes {
            drive_type: Some(DriveType::Hdd),
            serial: Some("S3Z9NB0K".into()),
            ..Default::default()
        };

        let merged = DeviceAttributes::merge_all([a, b]);
        assert_eq!(merged.drive_type, Some(DriveType::Ssd));
        // Unset fields are still filled by the lower priority probe
        assert_eq!(merged.serial.as_deref(), Some("S3Z9NB0K"));
    }

    #[test]
    fn test_empty_mount_list_is_a_known_value() {
        let a = DeviceAttributes {
            mount_points: Some(Vec::new()),
            ..Default::default()
        };
        let b = DeviceAttributes {
            mount_points: Some(vec!["/".into()]),
            ..Default::default()
        };
        let merged = DeviceAttributes::merge_all([a, b]);
        assert_eq!(merged.mount_points, Some(Vec::new()));
        assert!(merged.filesystem_info().is_some());
    }

    #[test]
    fn test_partition_info_absent_when_unknown() {
        let attrs = DeviceAttributes::default();
        assert!(attrs.partition_info().is_none());
        assert!(attrs.filesystem_info().is_none());
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty("  WD-WCC4N0123  \n"), Some("WD-WCC4N0123".to_string()));
        assert_eq!(non_empty(" \n"), None);
    }
}
