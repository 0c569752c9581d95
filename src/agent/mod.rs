//! Agent Module
//!
//! Runtime wiring of the node agent: channels, workers, the claim actor and
//! shutdown.

pub mod node_agent;

pub use node_agent::*;
