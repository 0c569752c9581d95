//! Hardware Module
//!
//! Device discovery, attribute probing, filtering, the device inventory and
//! claim binding for the local node.

pub mod claim;
pub mod discovery;
pub mod filter;
pub mod inventory;
pub mod probe;

pub use claim::*;
pub use discovery::*;
pub use filter::*;
pub use inventory::*;
pub use probe::*;
