//! Node Disk Agent
//!
//! A per-node agent that discovers local block devices, derives a stable
//! identity and attribute set for each one, and binds cluster claims to
//! matching devices.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            Node Agent                                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐              │
//! │  │   Device     │──►│    Probe     │──►│   Filter     │              │
//! │  │   Watcher    │   │   Pipeline   │   │   Chain      │              │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘              │
//! │                                               │                      │
//! │                                   ┌───────────┴───────────┐          │
//! │                                   │   Device Inventory    │          │
//! │                                   │   (64-way sharded)    │          │
//! │                                   └───────────┬───────────┘          │
//! │                                               │ events               │
//! │  ┌──────────────┐                 ┌───────────┴───────────┐          │
//! │  │ DeviceClaim  │────────────────►│   Claim Reconciler    │          │
//! │  │   watch      │                 │   (best fit, bind)    │          │
//! │  └──────────────┘                 └───────────────────────┘          │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │            Publishers: BlockDevice / DeviceClaim status              │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`hardware`]: Probes, pipeline, filters, inventory and claim binding
//! - [`agent`]: Task wiring and shutdown
//! - [`adapters`]: Publisher implementations and the claim watch
//! - [`config`]: Probe/filter config file and feature gates
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core domain types and ports
//! - [`metrics`]: Prometheus collectors
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod agent;
pub mod config;
pub mod crd;
pub mod domain;
pub mod error;
pub mod hardware;
pub mod metrics;

// Re-export commonly used types
pub use agent::{load_config_or_default, AgentConfig, NodeAgent};

pub use config::{
    Feature, FeatureGates, FilterConfig, NodeDiskManagerConfig, ProbeConfig,
    DEFAULT_CONFIG_FILE_PATH,
};

pub use crd::{BlockDevice, DeviceClaim};

pub use domain::{
    ClaimEvent, ClaimKey, ClaimPhase, ClaimRequest, ClaimState, DeviceIdentity,
    DeviceObservation, DeviceRecord, DriveType, ObservationKind,
};

pub use error::{Error, ErrorAction, Result};

pub use hardware::{
    ClaimReconciler, DeviceInventory, DeviceScanner, DeviceWatcher, FilterChain, Probe,
    ProbeContext, ProbePipeline, ScannerConfig,
};

pub use metrics::AgentMetrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
