//! Probe Pipeline
//!
//! Turns a raw observation into a canonical `DeviceRecord`: run the enabled
//! probes, merge their contributions in priority order and resolve the
//! device identity. The pipeline never touches the inventory.

use super::{resolve_identity, DeviceAttributes, DeviceHandle, Probe, ProbeContext, ProbeFailure};
use crate::config::FeatureGates;
use crate::domain::{ClaimState, DeviceObservation, DeviceRecord, ObservationKind};
use crate::metrics::AgentMetrics;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Why an observation produced no record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    IdentityUnresolved,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::IdentityUnresolved => write!(f, "identity unresolved"),
        }
    }
}

/// Result of running the pipeline on one observation
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// A fully probed record, not yet filtered
    Record(Box<DeviceRecord>),
    /// The device at `path` went away
    Removal { path: String },
    /// The device was probed but cannot be tracked
    Rejected { path: String, reason: RejectReason },
}

/// Probe pipeline for one node
pub struct ProbePipeline {
    probes: Vec<Probe>,
    context: ProbeContext,
    gates: Arc<FeatureGates>,
    host: String,
    metrics: Arc<AgentMetrics>,
}

impl ProbePipeline {
    pub fn new(
        probes: Vec<Probe>,
        context: ProbeContext,
        gates: Arc<FeatureGates>,
        host: impl Into<String>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            probes,
            context,
            gates,
            host: host.into(),
            metrics,
        }
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn context(&self) -> &ProbeContext {
        &self.context
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Process one observation
    #[instrument(skip(self), fields(path = %observation.path, kind = %observation.kind))]
    pub async fn run(&self, observation: &DeviceObservation) -> PipelineOutcome {
        if observation.kind == ObservationKind::Removed {
            return PipelineOutcome::Removal {
                path: observation.path.clone(),
            };
        }

        let handle = DeviceHandle::resolve(
            &observation.path,
            observation.sysfs_path.as_deref(),
            &self.context,
        );

        let attrs = self.collect(&handle).await;

        let Some(identity) =
            resolve_identity(&attrs, &self.host, &observation.path, &self.gates)
        else {
            warn!(path = %observation.path, "Unable to resolve device identity, ignoring device");
            self.metrics.identity_unresolved.inc();
            return PipelineOutcome::Rejected {
                path: observation.path.clone(),
                reason: RejectReason::IdentityUnresolved,
            };
        };

        debug!(path = %observation.path, identity = %identity, "Device probed");

        PipelineOutcome::Record(Box::new(DeviceRecord {
            identity,
            host: self.host.clone(),
            path: observation.path.clone(),
            sysfs_path: Some(handle.sysfs_path.to_string_lossy().to_string()),
            capacity_bytes: attrs.capacity_bytes.unwrap_or(0),
            logical_block_size: attrs.logical_block_size,
            physical_block_size: attrs.physical_block_size,
            drive_type: attrs.drive_type.unwrap_or_default(),
            details: attrs.details(),
            partition: attrs.partition_info(),
            filesystem: attrs.filesystem_info(),
            health: attrs.health.clone(),
            visible: false,
            claim_state: ClaimState::Unclaimed,
            stale: false,
            generation: 0,
            updated_at: Utc::now(),
        }))
    }

    /// Run every probe concurrently and merge in declared order
    async fn collect(&self, handle: &DeviceHandle) -> DeviceAttributes {
        let runs = self.probes.iter().map(|probe| async move {
            let result = match tokio::time::timeout(
                self.context.timeout,
                probe.run(handle, &self.context),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProbeFailure::Error(format!(
                    "timed out after {:?}",
                    self.context.timeout
                ))),
            };
            (*probe, result)
        });

        let results = join_all(runs).await;

        let mut contributions = Vec::with_capacity(results.len());
        for (probe, result) in results {
            match result {
                Ok(attrs) => contributions.push(attrs),
                Err(ProbeFailure::Unavailable(reason)) => {
                    debug!(probe = %probe, device = %handle.dev_path, %reason, "Probe unavailable");
                }
                Err(ProbeFailure::Error(reason)) => {
                    warn!(probe = %probe, device = %handle.dev_path, %reason, "Probe failed");
                    self.metrics
                        .probe_failures
                        .with_label_values(&[probe.key()])
                        .inc();
                }
            }
        }

        DeviceAttributes::merge_all(contributions)
    }
}
