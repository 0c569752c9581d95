//! Inventory Events
//!
//! Events emitted by the device inventory for the claim reconciler and
//! other consumers to react to device lifecycle changes.

use crate::domain::{ClaimKey, DeviceIdentity, DeviceRecord};
use serde::{Deserialize, Serialize};

/// Events emitted by the device inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    /// A device was seen for the first time
    Added {
        identity: DeviceIdentity,
        available: bool,
    },

    /// A known device changed (attributes, visibility or binding)
    Updated {
        identity: DeviceIdentity,
        available: bool,
    },

    /// A device entry was deleted
    Removed { identity: DeviceIdentity },

    /// A claimed device disappeared from the host
    Stale {
        identity: DeviceIdentity,
        claim: ClaimKey,
    },
}

impl InventoryEvent {
    /// Get the device identity associated with this event
    pub fn identity(&self) -> &DeviceIdentity {
        match self {
            InventoryEvent::Added { identity, .. } => identity,
            InventoryEvent::Updated { identity, .. } => identity,
            InventoryEvent::Removed { identity } => identity,
            InventoryEvent::Stale { identity, .. } => identity,
        }
    }

    /// Whether the device may now satisfy a pending claim
    pub fn offers_capacity(&self) -> bool {
        matches!(
            self,
            InventoryEvent::Added {
                available: true,
                ..
            } | InventoryEvent::Updated {
                available: true,
                ..
            }
        )
    }
}

/// Result of an inventory write, used by callers to decide what to publish
#[derive(Debug, Clone, PartialEq)]
pub enum InventoryDelta {
    /// New entry
    Created(DeviceRecord),
    /// Existing entry replaced
    Updated {
        previous: DeviceRecord,
        current: DeviceRecord,
    },
    /// Write carried no semantic change
    Unchanged(DeviceRecord),
    /// Entry deleted
    Removed(DeviceRecord),
    /// Claimed entry kept but flagged as gone from the host
    MarkedStale(DeviceRecord),
    /// No entry for the identity
    NotFound,
}

/// Outward action implied by a delta
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Publication<'a> {
    Publish(&'a DeviceRecord),
    Retract(&'a DeviceIdentity),
    Nothing,
}

impl InventoryDelta {
    /// Record after the write, if the entry still exists
    pub fn current(&self) -> Option<&DeviceRecord> {
        match self {
            InventoryDelta::Created(r)
            | InventoryDelta::Unchanged(r)
            | InventoryDelta::MarkedStale(r) => Some(r),
            InventoryDelta::Updated { current, .. } => Some(current),
            InventoryDelta::Removed(_) | InventoryDelta::NotFound => None,
        }
    }

    /// Visible records are published; records that stopped being visible
    /// or were deleted are retracted
    pub fn publication(&self) -> Publication<'_> {
        match self {
            InventoryDelta::Created(r) if r.visible => Publication::Publish(r),
            InventoryDelta::Updated { current, .. } if current.visible => {
                Publication::Publish(current)
            }
            InventoryDelta::Updated { previous, current } if previous.visible => {
                Publication::Retract(&current.identity)
            }
            InventoryDelta::Removed(r) | InventoryDelta::MarkedStale(r) => {
                Publication::Retract(&r.identity)
            }
            _ => Publication::Nothing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_identity() {
        let event = InventoryEvent::Stale {
            identity: DeviceIdentity::new("blockdevice-1"),
            claim: ClaimKey::new("default/c1"),
        };
        assert_eq!(event.identity().as_str(), "blockdevice-1");
        assert!(!event.offers_capacity());
    }

    #[test]
    fn test_offers_capacity() {
        let event = InventoryEvent::Added {
            identity: DeviceIdentity::new("blockdevice-1"),
            available: true,
        };
        assert!(event.offers_capacity());

        let event = InventoryEvent::Updated {
            identity: DeviceIdentity::new("blockdevice-1"),
            available: false,
        };
        assert!(!event.offers_capacity());
    }
}
