//! Channel Publisher Adapter
//!
//! Records every publication in memory and re-broadcasts it, so tests can
//! inspect or await what the agent pushed outward.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::domain::{
    ClaimPhase, ClaimPublisher, ClaimRequest, DeviceIdentity, DevicePublisher, DeviceRecord,
};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 1024;

/// One outward publication
#[derive(Debug, Clone, PartialEq)]
pub enum Published {
    Device(DeviceRecord),
    Retracted(DeviceIdentity),
    Claim(ClaimRequest),
}

#[derive(Debug)]
struct Inner {
    log: RwLock<Vec<Published>>,
    tx: broadcast::Sender<Published>,
    fail_claims: AtomicBool,
}

/// In-memory publisher for tests
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    inner: Arc<Inner>,
}

impl Default for ChannelPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                log: RwLock::new(Vec::new()),
                tx,
                fail_claims: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.inner.tx.subscribe()
    }

    /// Everything published so far, in order
    pub fn events(&self) -> Vec<Published> {
        self.inner.log.read().clone()
    }

    /// Make claim publications fail until reset
    pub fn set_fail_claims(&self, fail: bool) {
        self.inner.fail_claims.store(fail, Ordering::SeqCst);
    }

    /// Latest outward state of a device: `None` if never published or
    /// retracted since
    pub fn published_device(&self, identity: &DeviceIdentity) -> Option<DeviceRecord> {
        self.inner
            .log
            .read()
            .iter()
            .rev()
            .find_map(|event| match event {
                Published::Device(r) if &r.identity == identity => Some(Some(r.clone())),
                Published::Retracted(id) if id == identity => Some(None),
                _ => None,
            })
            .flatten()
    }

    /// Phases published for a claim, in order
    pub fn claim_phases(&self, key: &str) -> Vec<ClaimPhase> {
        self.inner
            .log
            .read()
            .iter()
            .filter_map(|event| match event {
                Published::Claim(c) if c.key.as_str() == key => Some(c.phase),
                _ => None,
            })
            .collect()
    }

    /// Last published state of a claim
    pub fn last_claim(&self, key: &str) -> Option<ClaimRequest> {
        self.inner
            .log
            .read()
            .iter()
            .rev()
            .find_map(|event| match event {
                Published::Claim(c) if c.key.as_str() == key => Some(c.clone()),
                _ => None,
            })
    }

    fn record(&self, event: Published) {
        self.inner.log.write().push(event.clone());
        // No subscribers is fine
        let _ = self.inner.tx.send(event);
    }
}

#[async_trait]
impl DevicePublisher for ChannelPublisher {
    async fn publish_device(&self, record: &DeviceRecord) -> Result<()> {
        self.record(Published::Device(record.clone()));
        Ok(())
    }

    async fn retract_device(&self, identity: &DeviceIdentity) -> Result<()> {
        self.record(Published::Retracted(identity.clone()));
        Ok(())
    }
}

#[async_trait]
impl ClaimPublisher for ChannelPublisher {
    async fn publish_claim_phase(&self, claim: &ClaimRequest) -> Result<()> {
        if self.inner.fail_claims.load(Ordering::SeqCst) {
            return Err(Error::Internal("claim publication disabled".to_string()));
        }
        self.record(Published::Claim(claim.clone()));
        Ok(())
    }
}
