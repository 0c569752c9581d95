//! Domain Module
//!
//! Core domain types and port traits shared by the pipeline, the inventory
//! and the claim reconciler.

pub mod claim;
pub mod device;
pub mod ports;

pub use claim::*;
pub use device::*;
pub use ports::*;
