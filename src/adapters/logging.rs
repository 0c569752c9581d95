//! Logging Publisher Adapter
//!
//! Implements both publisher ports by writing to the tracing system. Used
//! when the agent runs standalone.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::{ClaimPublisher, ClaimRequest, DeviceIdentity, DevicePublisher, DeviceRecord};
use crate::error::Result;

/// Logging-based device and claim publisher.
#[derive(Debug, Clone, Default)]
pub struct LoggingPublisher {
    /// Log full records as JSON at debug level
    verbose: bool,
}

impl LoggingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose() -> Self {
        Self { verbose: true }
    }
}

#[async_trait]
impl DevicePublisher for LoggingPublisher {
    async fn publish_device(&self, record: &DeviceRecord) -> Result<()> {
        info!(
            identity = %record.identity,
            path = %record.path,
            capacity = record.capacity_bytes,
            drive_type = %record.drive_type,
            claimed = record.claim_state.is_claimed(),
            "Device published"
        );
        if self.verbose {
            let json = serde_json::to_string(record).unwrap_or_else(|_| format!("{:?}", record));
            debug!(record = %json, "Device record");
        }
        Ok(())
    }

    async fn retract_device(&self, identity: &DeviceIdentity) -> Result<()> {
        info!(identity = %identity, "Device retracted");
        Ok(())
    }
}

#[async_trait]
impl ClaimPublisher for LoggingPublisher {
    async fn publish_claim_phase(&self, claim: &ClaimRequest) -> Result<()> {
        info!(
            claim = %claim.key,
            phase = %claim.phase,
            device = ?claim.bound_device.as_ref().map(|d| d.as_str()),
            "Claim phase"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_publisher_never_fails() {
        let publisher = LoggingPublisher::verbose();
        let claim = ClaimRequest::new("default/c1", 1, None, "node-1");
        assert!(publisher.publish_claim_phase(&claim).await.is_ok());
        assert!(publisher
            .retract_device(&DeviceIdentity::new("blockdevice-1"))
            .await
            .is_ok());
    }
}
