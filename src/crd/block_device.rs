//! BlockDevice CRD
//!
//! Outward representation of one visible device in the inventory. The
//! object name is the device identity.

use crate::domain::{ClaimState, DeviceRecord};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carrying the node a device belongs to
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Label marking objects owned by this agent
pub const MANAGED_LABEL: &str = "ndm.io/managed";

// =============================================================================
// BlockDevice CRD
// =============================================================================

/// A block device discovered on a node
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "BlockDevice",
    plural = "blockdevices",
    shortname = "bd",
    status = "BlockDeviceStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeName"}"#,
    printcolumn = r#"{"name": "Path", "type": "string", "jsonPath": ".spec.path"}"#,
    printcolumn = r#"{"name": "Size", "type": "integer", "jsonPath": ".spec.capacity.storage"}"#,
    printcolumn = r#"{"name": "ClaimState", "type": "string", "jsonPath": ".status.claimState"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpec {
    /// Node the device is attached to
    pub node_name: String,

    /// Current device node path
    pub path: String,

    pub capacity: DeviceCapacity,

    #[serde(default)]
    pub details: DeviceDetailsSpec,

    #[serde(default)]
    pub partition: Option<PartitionSpec>,

    #[serde(default)]
    pub filesystem: Option<FilesystemSpec>,

    #[serde(default)]
    pub health: Option<HealthSpec>,
}

// =============================================================================
// Sub-Types
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapacity {
    /// Size in bytes
    pub storage: u64,
    #[serde(default)]
    pub logical_sector_size: Option<u32>,
    #[serde(default)]
    pub physical_sector_size: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetailsSpec {
    /// SSD, HDD or Unknown
    pub drive_type: String,
    /// disk, partition, loop, ...
    #[serde(default)]
    pub device_type: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub firmware_revision: Option<String>,
    #[serde(default)]
    pub wwn: Option<String>,
    #[serde(default)]
    pub removable: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PartitionSpec {
    #[serde(default)]
    pub table_type: Option<String>,
    #[serde(default)]
    pub table_uuid: Option<String>,
    #[serde(default)]
    pub partitions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemSpec {
    #[serde(default)]
    pub fs_type: Option<String>,
    #[serde(default)]
    pub fs_uuid: Option<String>,
    #[serde(default)]
    pub mount_points: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthSpec {
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub temperature_celsius: Option<i32>,
    #[serde(default)]
    pub percentage_used: Option<u8>,
    #[serde(default)]
    pub power_on_hours: Option<u64>,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatus {
    /// Unclaimed or Claimed
    pub claim_state: String,

    /// `namespace/name` of the claim holding the device
    #[serde(default)]
    pub claim_ref: Option<String>,

    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

// =============================================================================
// Conversion
// =============================================================================

impl BlockDevice {
    /// Build the object for an inventory record
    pub fn from_record(record: &DeviceRecord) -> Self {
        let spec = BlockDeviceSpec {
            node_name: record.host.clone(),
            path: record.path.clone(),
            capacity: DeviceCapacity {
                storage: record.capacity_bytes,
                logical_sector_size: record.logical_block_size,
                physical_sector_size: record.physical_block_size,
            },
            details: DeviceDetailsSpec {
                drive_type: record.drive_type.to_string(),
                device_type: record.details.kind.map(|k| k.to_string()),
                model: record.details.model.clone(),
                serial: record.details.serial.clone(),
                vendor: record.details.vendor.clone(),
                firmware_revision: record.details.firmware.clone(),
                wwn: record.details.wwn.clone(),
                removable: record.details.removable,
            },
            partition: record.partition.as_ref().map(|p| PartitionSpec {
                table_type: p.table_type.clone(),
                table_uuid: p.table_uuid.clone(),
                partitions: p.partitions.clone(),
            }),
            filesystem: record.filesystem.as_ref().map(|fs| FilesystemSpec {
                fs_type: fs.fs_type.clone(),
                fs_uuid: fs.fs_uuid.clone(),
                mount_points: fs.mount_points.clone(),
            }),
            health: record.health.as_ref().map(|h| HealthSpec {
                passed: h.passed,
                temperature_celsius: h.temperature_celsius,
                percentage_used: h.percentage_used,
                power_on_hours: h.power_on_hours,
            }),
        };

        let mut device = BlockDevice::new(record.identity.as_str(), spec);
        device.metadata.labels = Some(BTreeMap::from([
            (HOSTNAME_LABEL.to_string(), record.host.clone()),
            (MANAGED_LABEL.to_string(), "true".to_string()),
        ]));
        device.status = Some(BlockDeviceStatus::from_claim_state(
            &record.claim_state,
            record.updated_at,
        ));
        device
    }
}

impl BlockDeviceStatus {
    pub fn from_claim_state(state: &ClaimState, updated_at: DateTime<Utc>) -> Self {
        match state {
            ClaimState::Unclaimed => Self {
                claim_state: "Unclaimed".to_string(),
                claim_ref: None,
                last_updated: Some(updated_at),
            },
            ClaimState::Claimed(claim_ref) => Self {
                claim_state: "Claimed".to_string(),
                claim_ref: Some(claim_ref.claim.to_string()),
                last_updated: Some(updated_at),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ClaimKey, ClaimRef, DeviceDetails, DeviceIdentity, DeviceKind, DriveType, FilesystemInfo,
    };
    use kube::ResourceExt;

    fn record() -> DeviceRecord {
        DeviceRecord {
            identity: DeviceIdentity::new("blockdevice-0123abcd"),
            host: "node-1".into(),
            path: "/dev/sdb".into(),
            sysfs_path: Some("/sys/class/block/sdb".into()),
            capacity_bytes: 107_374_182_400,
            logical_block_size: Some(512),
            physical_block_size: Some(4096),
            drive_type: DriveType::Ssd,
            details: DeviceDetails {
                serial: Some("S3Z1NB0K".into()),
                model: Some("Samsung SSD 860".into()),
                kind: Some(DeviceKind::Disk),
                ..Default::default()
            },
            partition: None,
            filesystem: Some(FilesystemInfo {
                fs_type: Some("ext4".into()),
                fs_uuid: None,
                mount_points: vec!["/data".into()],
            }),
            health: None,
            visible: true,
            claim_state: ClaimState::Claimed(ClaimRef {
                claim: ClaimKey::new("default/c1"),
                bound_at: Utc::now(),
            }),
            stale: false,
            generation: 3,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_from_record() {
        let device = BlockDevice::from_record(&record());

        assert_eq!(device.name_any(), "blockdevice-0123abcd");
        assert_eq!(device.labels().get(HOSTNAME_LABEL).unwrap(), "node-1");
        assert_eq!(device.spec.capacity.storage, 107_374_182_400);
        assert_eq!(device.spec.details.drive_type, "SSD");
        assert_eq!(device.spec.details.device_type.as_deref(), Some("disk"));
        assert_eq!(
            device.spec.filesystem.as_ref().unwrap().mount_points,
            vec!["/data".to_string()]
        );

        let status = device.status.unwrap();
        assert_eq!(status.claim_state, "Claimed");
        assert_eq!(status.claim_ref.as_deref(), Some("default/c1"));
    }

    #[test]
    fn test_spec_serializes_camel_case() {
        let device = BlockDevice::from_record(&record());
        let json = serde_json::to_value(&device.spec).unwrap();
        assert_eq!(json["nodeName"], "node-1");
        assert_eq!(json["capacity"]["logicalSectorSize"], 512);
        assert_eq!(json["details"]["driveType"], "SSD");
    }
}
