//! Domain Ports - Core trait definitions for the node disk agent
//!
//! These traits define the boundaries between the discovery/claim core and
//! external systems. Adapters implement these traits to provide concrete
//! functionality.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::claim::{ClaimKey, ClaimRequest};
use super::device::{DeviceIdentity, DeviceRecord};

// =============================================================================
// Drive Type
// =============================================================================

/// Drive type classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DriveType {
    Ssd,
    Hdd,
    #[default]
    Unknown,
}

impl DriveType {
    /// Parse the drive type names used in claim objects. Empty strings mean
    /// "no constraint" and yield `None`.
    pub fn parse_constraint(value: &str) -> Option<DriveType> {
        match value.trim().to_uppercase().as_str() {
            "" => None,
            "SSD" | "NVME" => Some(DriveType::Ssd),
            "HDD" => Some(DriveType::Hdd),
            _ => Some(DriveType::Unknown),
        }
    }
}

impl std::fmt::Display for DriveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveType::Ssd => write!(f, "SSD"),
            DriveType::Hdd => write!(f, "HDD"),
            DriveType::Unknown => write!(f, "Unknown"),
        }
    }
}

// =============================================================================
// Device Observations
// =============================================================================

/// Kind of hardware change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservationKind {
    Added,
    Changed,
    Removed,
}

impl std::fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservationKind::Added => write!(f, "added"),
            ObservationKind::Changed => write!(f, "changed"),
            ObservationKind::Removed => write!(f, "removed"),
        }
    }
}

/// Raw, ephemeral notification from the OS event source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceObservation {
    /// Device node path (e.g. /dev/sda)
    pub path: String,
    /// sysfs directory of the device, if known
    pub sysfs_path: Option<String>,
    pub kind: ObservationKind,
}

impl DeviceObservation {
    pub fn new(path: impl Into<String>, sysfs_path: Option<String>, kind: ObservationKind) -> Self {
        Self {
            path: path.into(),
            sysfs_path,
            kind,
        }
    }

    pub fn removed(path: impl Into<String>) -> Self {
        Self::new(path, None, ObservationKind::Removed)
    }
}

/// Claim notification from the control-plane watch layer
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimEvent {
    Upserted(ClaimRequest),
    Deleted(ClaimKey),
}

// =============================================================================
// Device Publisher Port
// =============================================================================

/// Port for pushing visible device records to the resource model
#[async_trait]
pub trait DevicePublisher: Send + Sync {
    /// Create or update the outward representation of a visible device
    async fn publish_device(&self, record: &DeviceRecord) -> Result<()>;

    /// Remove the outward representation of a device
    async fn retract_device(&self, identity: &DeviceIdentity) -> Result<()>;
}

// =============================================================================
// Claim Publisher Port
// =============================================================================

/// Port for pushing claim phase changes to the resource model
#[async_trait]
pub trait ClaimPublisher: Send + Sync {
    /// Called whenever a claim's phase or bound device changes
    async fn publish_claim_phase(&self, claim: &ClaimRequest) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DevicePublisherRef = Arc<dyn DevicePublisher>;
pub type ClaimPublisherRef = Arc<dyn ClaimPublisher>;
