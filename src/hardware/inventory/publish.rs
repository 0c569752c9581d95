//! Device publication
//!
//! Several tasks write the same identity (discovery workers on probe
//! results, the reconciler on bind and release). Publishing the record as
//! it stands in the inventory at publish time, rather than the snapshot a
//! task happened to write, keeps the outward copy from regressing.

use super::DeviceInventory;
use crate::domain::{DeviceIdentity, DevicePublisher};
use crate::error::Result;

/// Push the current state of `identity`: publish if visible, otherwise
/// retract
pub async fn sync_device(
    inventory: &DeviceInventory,
    publisher: &dyn DevicePublisher,
    identity: &DeviceIdentity,
) -> Result<()> {
    match inventory.get(identity) {
        Some(record) if record.visible => publisher.publish_device(&record).await,
        _ => publisher.retract_device(identity).await,
    }
}
