//! Device Inventory
//!
//! Sharded, identity-keyed store of device records plus the events it
//! broadcasts on every write.

pub mod device_inventory;
pub mod events;
pub mod publish;

pub use device_inventory::*;
pub use events::*;
pub use publish::sync_device;
