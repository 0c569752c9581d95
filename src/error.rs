//! Error types for the Node Disk Agent
//!
//! Provides structured error types for the probe pipeline, device
//! inventory, claim reconciler, configuration loading and adapters.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration file {path}: {reason}")]
    ConfigInvalid { path: String, reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    // =========================================================================
    // Probe Errors
    // =========================================================================
    #[error("Probe {probe} unavailable for {device}: {reason}")]
    ProbeUnavailable {
        probe: String,
        device: String,
        reason: String,
    },

    #[error("Probe {probe} failed for {device}: {reason}")]
    ProbeError {
        probe: String,
        device: String,
        reason: String,
    },

    #[error("Unable to resolve a stable identity for {device}")]
    IdentityUnresolved { device: String },

    // =========================================================================
    // Inventory Errors
    // =========================================================================
    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("Device {device} is not eligible for binding: {reason}")]
    DeviceNotEligible { device: String, reason: String },

    // =========================================================================
    // Claim Errors
    // =========================================================================
    #[error("Claim not found: {claim}")]
    ClaimNotFound { claim: String },

    #[error("No eligible device for claim {claim}")]
    MatchNotFound { claim: String },

    #[error("Exclusivity violation: device {device} already bound to {holder}, rejected bind for {claim}")]
    ExclusivityViolation {
        device: String,
        holder: String,
        claim: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action a collaborator should take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::ProbeError { .. } | Error::Io(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Waiting for capacity is the steady state of a pending claim
            Error::MatchNotFound { .. } | Error::DeviceNotEligible { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // A concurrency bug was caught; retry once things settle
            Error::ExclusivityViolation { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(5))
            }

            // Nothing will change until new input arrives
            Error::ProbeUnavailable { .. }
            | Error::IdentityUnresolved { .. }
            | Error::Configuration(_)
            | Error::ConfigInvalid { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_)
            | Error::DeviceNotFound { .. }
            | Error::ClaimNotFound { .. } => ErrorAction::NoRequeue,

            Error::Metrics(_) => ErrorAction::NoRequeue,

            Error::Internal(_) | Error::ChannelClosed(_) => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::ProbeError { .. } | Error::Io(_)
        )
    }

    /// Internal invariant breaches that indicate a bug rather than an
    /// environmental condition
    pub fn is_internal_fault(&self) -> bool {
        matches!(self, Error::ExclusivityViolation { .. } | Error::Internal(_))
    }
}

/// Result type alias for the agent
pub type Result<T> = std::result::Result<T, Error>;
