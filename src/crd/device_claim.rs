//! DeviceClaim CRD
//!
//! A request for one device on a node. The agent reads the claimed size,
//! drive type and host and writes the status.

use crate::domain::{ClaimKey, ClaimPhase, ClaimRequest, DeviceIdentity, DriveType};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// DeviceClaim CRD
// =============================================================================

/// DeviceClaim asks for a device with at least `capacity` bytes on
/// `hostName`, optionally of a given drive type.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "openebs.io",
    version = "v1alpha1",
    kind = "DeviceClaim",
    plural = "deviceclaims",
    shortname = "dc",
    status = "DeviceClaimStatus",
    printcolumn = r#"{"name": "Host", "type": "string", "jsonPath": ".spec.hostName"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "integer", "jsonPath": ".spec.capacity"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Device", "type": "string", "jsonPath": ".status.deviceRef"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaimSpec {
    /// Minimum size in bytes
    pub capacity: u64,

    /// SSD, HDD or empty for any
    #[serde(default)]
    pub drive_type: String,

    /// Node the device must be on
    pub host_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClaimStatus {
    /// "", Pending or Bound
    #[serde(default)]
    pub phase: String,

    /// Identity of the bound device
    #[serde(default)]
    pub device_ref: Option<String>,
}

// =============================================================================
// Conversion
// =============================================================================

/// Parse a status phase; unknown values are treated as not yet observed
pub fn parse_phase(phase: &str) -> ClaimPhase {
    match phase {
        "Pending" => ClaimPhase::Pending,
        "Bound" => ClaimPhase::Bound,
        _ => ClaimPhase::Empty,
    }
}

impl DeviceClaim {
    pub fn key(&self) -> ClaimKey {
        ClaimKey::namespaced(
            &self.namespace().unwrap_or_else(|| "default".to_string()),
            &self.name_any(),
        )
    }

    /// Domain view of the claim, including a binding recorded in status
    pub fn to_request(&self) -> ClaimRequest {
        let mut request = ClaimRequest::new(
            self.key(),
            self.spec.capacity,
            DriveType::parse_constraint(&self.spec.drive_type),
            self.spec.host_name.clone(),
        );

        if let Some(status) = &self.status {
            request.phase = parse_phase(&status.phase);
            request.bound_device = match request.phase {
                ClaimPhase::Bound => status.device_ref.clone().map(DeviceIdentity::new),
                _ => None,
            };
            if request.phase == ClaimPhase::Bound && request.bound_device.is_none() {
                request.phase = ClaimPhase::Empty;
            }
        }
        request
    }
}

impl DeviceClaimStatus {
    pub fn from_request(request: &ClaimRequest) -> Self {
        Self {
            phase: request.phase.to_string(),
            device_ref: request.bound_device.as_ref().map(|d| d.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(drive_type: &str, status: Option<DeviceClaimStatus>) -> DeviceClaim {
        let mut claim = DeviceClaim::new(
            "c1",
            DeviceClaimSpec {
                capacity: 10_000_000_000,
                drive_type: drive_type.to_string(),
                host_name: "node-1".to_string(),
            },
        );
        claim.metadata.namespace = Some("openebs".to_string());
        claim.status = status;
        claim
    }

    #[test]
    fn test_to_request_new_claim() {
        let request = claim("", None).to_request();
        assert_eq!(request.key.as_str(), "openebs/c1");
        assert_eq!(request.requested_capacity, 10_000_000_000);
        assert_eq!(request.drive_type, None);
        assert_eq!(request.target_host, "node-1");
        assert_eq!(request.phase, ClaimPhase::Empty);
    }

    #[test]
    fn test_to_request_bound_claim() {
        let status = DeviceClaimStatus {
            phase: "Bound".to_string(),
            device_ref: Some("blockdevice-abc".to_string()),
        };
        let request = claim("SSD", Some(status)).to_request();
        assert_eq!(request.drive_type, Some(DriveType::Ssd));
        assert_eq!(request.phase, ClaimPhase::Bound);
        assert_eq!(request.bound_device, Some(DeviceIdentity::new("blockdevice-abc")));
    }

    #[test]
    fn test_bound_without_device_is_reset() {
        let status = DeviceClaimStatus {
            phase: "Bound".to_string(),
            device_ref: None,
        };
        assert_eq!(claim("", Some(status)).to_request().phase, ClaimPhase::Empty);
    }

    #[test]
    fn test_status_from_request() {
        let mut request = claim("", None).to_request();
        request.mark_pending();
        let status = DeviceClaimStatus::from_request(&request);
        assert_eq!(status.phase, "Pending");
        assert!(status.device_ref.is_none());

        request.mark_bound(DeviceIdentity::new("blockdevice-abc"));
        let json = serde_json::to_value(DeviceClaimStatus::from_request(&request)).unwrap();
        assert_eq!(json["phase"], "Bound");
        assert_eq!(json["deviceRef"], "blockdevice-abc");
    }
}
