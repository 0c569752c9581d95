//! Claim Module
//!
//! Best-fit selection and the reconciler that binds claims to devices.

pub mod reconciler;
pub mod selection;

pub use reconciler::*;
pub use selection::*;
