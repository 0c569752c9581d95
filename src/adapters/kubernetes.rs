//! Kubernetes Adapter
//!
//! Publishes devices as BlockDevice objects, writes DeviceClaim status and
//! feeds DeviceClaim changes into the agent.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::crd::{BlockDevice, DeviceClaim, DeviceClaimStatus};
use crate::domain::{
    ClaimEvent, ClaimKey, ClaimPublisher, ClaimRequest, DeviceIdentity, DevicePublisher,
    DeviceRecord,
};
use crate::error::{Error, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "node-disk-agent";

// =============================================================================
// Publisher
// =============================================================================

/// Kubernetes-backed device and claim publisher.
#[derive(Clone)]
pub struct KubePublisher {
    client: Client,
}

impl KubePublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn devices_api(&self) -> Api<BlockDevice> {
        Api::all(self.client.clone())
    }

    fn claims_api(&self, namespace: &str) -> Api<DeviceClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl std::fmt::Debug for KubePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePublisher").finish()
    }
}

#[async_trait]
impl DevicePublisher for KubePublisher {
    #[instrument(skip(self, record), fields(identity = %record.identity))]
    async fn publish_device(&self, record: &DeviceRecord) -> Result<()> {
        let api = self.devices_api();
        let device = BlockDevice::from_record(record);
        let name = record.identity.as_str();

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &params, &Patch::Apply(&device)).await?;

        let status = serde_json::json!({ "status": device.status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status))
            .await?;

        debug!(path = %record.path, "Applied BlockDevice");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn retract_device(&self, identity: &DeviceIdentity) -> Result<()> {
        match self
            .devices_api()
            .delete(identity.as_str(), &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!("Deleted BlockDevice");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(Error::Kube(e)),
        }
    }
}

#[async_trait]
impl ClaimPublisher for KubePublisher {
    #[instrument(skip(self, claim), fields(claim = %claim.key, phase = %claim.phase))]
    async fn publish_claim_phase(&self, claim: &ClaimRequest) -> Result<()> {
        let (namespace, name) = split_key(&claim.key)?;
        let patch = serde_json::json!({ "status": DeviceClaimStatus::from_request(claim) });

        self.claims_api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn split_key(key: &ClaimKey) -> Result<(&str, &str)> {
    key.as_str()
        .split_once('/')
        .ok_or_else(|| Error::Internal(format!("claim key without namespace: {}", key)))
}

// =============================================================================
// Claim Watcher
// =============================================================================

/// Stream DeviceClaim changes into `tx` until cancelled. Claims that
/// vanish while the watch restarts are reported as deleted.
pub async fn watch_claims(
    client: Client,
    tx: mpsc::Sender<ClaimEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    let api: Api<DeviceClaim> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    let mut known: HashSet<ClaimKey> = HashSet::new();

    info!("Watching DeviceClaims");
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.try_next() => event,
        };

        let events = match event {
            Ok(Some(watcher::Event::Applied(claim))) => {
                let request = claim.to_request();
                known.insert(request.key.clone());
                vec![ClaimEvent::Upserted(request)]
            }
            Ok(Some(watcher::Event::Deleted(claim))) => {
                let key = claim.key();
                known.remove(&key);
                vec![ClaimEvent::Deleted(key)]
            }
            Ok(Some(watcher::Event::Restarted(claims))) => {
                let requests: Vec<ClaimRequest> = claims.iter().map(|c| c.to_request()).collect();
                let current: HashSet<ClaimKey> = requests.iter().map(|r| r.key.clone()).collect();
                let mut events: Vec<ClaimEvent> = known
                    .difference(&current)
                    .cloned()
                    .map(ClaimEvent::Deleted)
                    .collect();
                events.extend(requests.into_iter().map(ClaimEvent::Upserted));
                known = current;
                events
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "DeviceClaim watch error");
                continue;
            }
        };

        for event in events {
            if tx.send(event).await.is_err() {
                return Err(Error::ChannelClosed("claim events".to_string()));
            }
        }
    }

    info!("DeviceClaim watch stopped");
    Ok(())
}
