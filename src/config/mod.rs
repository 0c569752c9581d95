//! Configuration Module
//!
//! Probe, filter and feature gate configuration loaded from the Node Disk
//! Manager config file.

pub mod feature_gates;
pub mod ndm_config;

pub use feature_gates::*;
pub use ndm_config::*;
