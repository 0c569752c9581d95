//! Claim Domain Types
//!
//! A claim asks for one device on a given host with a minimum capacity and
//! an optional drive type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::device::{DeviceIdentity, DeviceRecord};
use super::ports::DriveType;

// =============================================================================
// Claim Key
// =============================================================================

/// Key of a claim object (`namespace/name`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClaimKey(pub String);

impl ClaimKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self(format!("{}/{}", namespace, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClaimKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Claim Phase
// =============================================================================

/// Lifecycle phase of a claim
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimPhase {
    /// Just created, not yet observed by the reconciler
    #[default]
    Empty,
    /// Searching for a matching device
    Pending,
    /// Bound to exactly one device
    Bound,
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimPhase::Empty => write!(f, ""),
            ClaimPhase::Pending => write!(f, "Pending"),
            ClaimPhase::Bound => write!(f, "Bound"),
        }
    }
}

// =============================================================================
// Claim Request
// =============================================================================

/// A request to bind one device on a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub key: ClaimKey,
    /// Minimum capacity in bytes
    pub requested_capacity: u64,
    pub drive_type: Option<DriveType>,
    pub target_host: String,
    pub phase: ClaimPhase,
    /// Set only while `phase == Bound`
    pub bound_device: Option<DeviceIdentity>,
    /// When the claim last entered `Pending`
    pub pending_since: Option<DateTime<Utc>>,
}

impl ClaimRequest {
    pub fn new(
        key: impl Into<ClaimKey>,
        requested_capacity: u64,
        drive_type: Option<DriveType>,
        target_host: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            requested_capacity,
            drive_type,
            target_host: target_host.into(),
            phase: ClaimPhase::Empty,
            bound_device: None,
            pending_since: None,
        }
    }

    /// Whether a device satisfies this claim's constraints (ignoring
    /// availability)
    pub fn constraints_match(&self, device: &DeviceRecord) -> bool {
        if device.host != self.target_host {
            return false;
        }
        if device.capacity_bytes < self.requested_capacity {
            return false;
        }
        match self.drive_type {
            Some(required) => device.drive_type == required,
            None => true,
        }
    }

    /// Same constraints as another request
    pub fn same_spec(&self, other: &ClaimRequest) -> bool {
        self.requested_capacity == other.requested_capacity
            && self.drive_type == other.drive_type
            && self.target_host == other.target_host
    }

    pub fn mark_pending(&mut self) {
        self.phase = ClaimPhase::Pending;
        self.bound_device = None;
        self.pending_since = Some(Utc::now());
    }

    pub fn mark_bound(&mut self, device: DeviceIdentity) {
        self.phase = ClaimPhase::Bound;
        self.bound_device = Some(device);
        self.pending_since = None;
    }
}

impl From<String> for ClaimKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_phase_display() {
        assert_eq!(ClaimPhase::Empty.to_string(), "");
        assert_eq!(ClaimPhase::Pending.to_string(), "Pending");
        assert_eq!(ClaimPhase::Bound.to_string(), "Bound");
    }

    #[test]
    fn test_phase_transitions_keep_binding_consistent() {
        let mut claim = ClaimRequest::new("default/c1", 100, None, "node-1");
        assert_eq!(claim.phase, ClaimPhase::Empty);

        claim.mark_pending();
        assert_eq!(claim.phase, ClaimPhase::Pending);
        assert!(claim.bound_device.is_none());
        assert!(claim.pending_since.is_some());

        claim.mark_bound(DeviceIdentity::new("blockdevice-1"));
        assert_eq!(claim.phase, ClaimPhase::Bound);
        assert!(claim.pending_since.is_none());

        claim.mark_pending();
        assert!(claim.bound_device.is_none());
    }

    #[test]
    fn test_namespaced_key() {
        assert_eq!(ClaimKey::namespaced("openebs", "c1").as_str(), "openebs/c1");
    }
}
