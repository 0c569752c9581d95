//! Custom Resource Definitions
//!
//! - BlockDevice: a visible device discovered on a node
//! - DeviceClaim: a request for one device on a node

pub mod block_device;
pub mod device_claim;

pub use block_device::*;
pub use device_claim::*;
