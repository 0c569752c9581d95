//! Node Agent
//!
//! Wires the probe pipeline, filter chain, inventory and claim reconciler
//! together:
//!
//! ```text
//! observations ──► dispatcher ──► worker[path hash] ──► pipeline ──► filters ──► inventory
//!                                                                                   │ events
//! claim events ──────────────────────────────────────────► claim actor ◄────────────┘
//!                                                              ▲
//!                                                        rescan tick
//! ```

use crate::config::{FeatureGates, NodeDiskManagerConfig};
use crate::domain::{ClaimEvent, ClaimPublisherRef, DeviceObservation, DevicePublisherRef};
use crate::error::{Error, ErrorAction, Result};
use crate::hardware::{
    sync_device, ClaimReconciler, ClaimReconcilerConfig, DeviceInventory, DeviceWatcher,
    FilterChain, InventoryDelta, PipelineOutcome, Probe, ProbeContext, ProbePipeline, Publication,
};
use crate::metrics::{AgentMetrics, DiskStatsSource};
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Runtime settings for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node name
    pub host: String,
    /// Capacity of the observation channel
    pub observation_capacity: usize,
    /// Capacity of the claim event channel
    pub claim_capacity: usize,
    /// Observation workers (each owns a slice of device paths)
    pub workers: usize,
    /// Period of the reconciler's full pass
    pub rescan_interval: Duration,
    /// Warn once about claims pending longer than this
    pub pending_warn_after: Duration,
    /// Per-device I/O statistics exported with the metrics
    pub diskstats_path: PathBuf,
    pub probe_context: ProbeContext,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            observation_capacity: 256,
            claim_capacity: 256,
            workers: 4,
            rescan_interval: Duration::from_secs(30),
            pending_warn_after: Duration::from_secs(300),
            diskstats_path: PathBuf::from("/proc/diskstats"),
            probe_context: ProbeContext::default(),
        }
    }
}

// =============================================================================
// Node Agent
// =============================================================================

/// Running agent for one node
pub struct NodeAgent {
    config: AgentConfig,
    gates: Arc<FeatureGates>,
    inventory: Arc<DeviceInventory>,
    reconciler: Arc<ClaimReconciler>,
    metrics: Arc<AgentMetrics>,
    observation_tx: mpsc::Sender<DeviceObservation>,
    flush_tx: mpsc::Sender<oneshot::Sender<()>>,
    claim_tx: mpsc::Sender<ClaimEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeAgent {
    /// Build the components and spawn the worker, dispatcher and claim
    /// actor tasks. Must be called inside a tokio runtime.
    pub fn start(
        config: AgentConfig,
        ndm_config: &NodeDiskManagerConfig,
        device_publisher: DevicePublisherRef,
        claim_publisher: ClaimPublisherRef,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let gates = Arc::new(FeatureGates::from_config(&ndm_config.feature_gates));
        let probes = Probe::from_configs(&ndm_config.probe_configs);
        let chain = Arc::new(FilterChain::from_config(
            &ndm_config.filter_configs,
            &gates,
            metrics.clone(),
        ));
        let pipeline = Arc::new(ProbePipeline::new(
            probes,
            config.probe_context.clone(),
            gates.clone(),
            config.host.clone(),
            metrics.clone(),
        ));

        info!(
            host = %config.host,
            probes = ?pipeline.probes().iter().map(|p| p.key()).collect::<Vec<_>>(),
            filters = ?chain.filters().iter().map(|f| f.key()).collect::<Vec<_>>(),
            gates = ?gates.enabled(),
            "Starting node agent"
        );

        let inventory = DeviceInventory::new();
        let visible = inventory.clone();
        metrics.attach_disk_stats(DiskStatsSource::new(
            config.diskstats_path.clone(),
            move || {
                visible
                    .snapshot()
                    .into_iter()
                    .filter(|record| record.visible)
                    .filter_map(|record| record.path.rsplit('/').next().map(str::to_string))
                    .collect()
            },
        ));

        let reconciler = Arc::new(ClaimReconciler::new(
            ClaimReconcilerConfig {
                host: config.host.clone(),
                pending_warn_after: config.pending_warn_after,
            },
            inventory.clone(),
            claim_publisher,
            device_publisher.clone(),
            metrics.clone(),
        ));

        let shutdown = CancellationToken::new();
        let (observation_tx, observation_rx) = mpsc::channel(config.observation_capacity);
        let (flush_tx, flush_rx) = mpsc::channel(4);
        let (claim_tx, claim_rx) = mpsc::channel(config.claim_capacity);
        let mut tasks = Vec::new();

        // Workers
        let mut worker_txs = Vec::new();
        for index in 0..config.workers.max(1) {
            let (tx, rx) = mpsc::channel(config.observation_capacity);
            worker_txs.push(tx);
            let worker = ObservationWorker {
                index,
                pipeline: pipeline.clone(),
                chain: chain.clone(),
                inventory: inventory.clone(),
                publisher: device_publisher.clone(),
                metrics: metrics.clone(),
            };
            tasks.push(tokio::spawn(worker.run(rx, shutdown.clone())));
        }
        tasks.push(tokio::spawn(dispatch(
            observation_rx,
            flush_rx,
            worker_txs,
            shutdown.clone(),
        )));

        // Subscribe before anything can write to the inventory
        let inventory_rx = inventory.subscribe();
        tasks.push(tokio::spawn(claim_actor(
            reconciler.clone(),
            claim_rx,
            inventory_rx,
            config.rescan_interval,
            shutdown.clone(),
        )));

        Self {
            config,
            gates,
            inventory,
            reconciler,
            metrics,
            observation_tx,
            flush_tx,
            claim_tx,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    /// Inbound channel for hardware observations
    pub fn observation_sender(&self) -> mpsc::Sender<DeviceObservation> {
        self.observation_tx.clone()
    }

    /// Inbound channel for claim notifications
    pub fn claim_sender(&self) -> mpsc::Sender<ClaimEvent> {
        self.claim_tx.clone()
    }

    pub fn inventory(&self) -> &Arc<DeviceInventory> {
        &self.inventory
    }

    pub fn reconciler(&self) -> &Arc<ClaimReconciler> {
        &self.reconciler
    }

    pub fn metrics(&self) -> &Arc<AgentMetrics> {
        &self.metrics
    }

    pub fn gates(&self) -> &Arc<FeatureGates> {
        &self.gates
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Token cancelled on shutdown, for tasks that feed the agent
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait until every observation sent before this call has been applied
    /// to the inventory
    pub async fn flush_observations(&self) -> Result<()> {
        flush(&self.flush_tx).await
    }

    /// Poll `watcher` every `interval` and feed its observations in. Once
    /// the first scan is in the inventory the reconciler is told so and
    /// runs a full pass. The task stops with the agent.
    pub fn spawn_watcher(&self, mut watcher: DeviceWatcher, interval: Duration) {
        let tx = self.observation_sender();
        let flush_tx = self.flush_tx.clone();
        let reconciler = self.reconciler.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut initial = true;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let observations = match watcher.poll() {
                    Ok(observations) => observations,
                    Err(e) => {
                        warn!(error = %e, "Device scan failed");
                        continue;
                    }
                };
                for observation in observations {
                    if tx.send(observation).await.is_err() {
                        return;
                    }
                }

                if initial {
                    initial = false;
                    if let Err(e) = flush(&flush_tx).await {
                        debug!(error = %e, "Initial scan not flushed");
                        return;
                    }
                    reconciler.mark_inventory_complete();
                    if let Err(e) = reconciler.rescan().await {
                        log_reconcile_error(&e);
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Cancel all tasks, wait up to `grace` for them to finish, then abort
    /// the rest
    pub async fn shutdown(&self, grace: Duration) {
        info!(grace_secs = grace.as_secs(), "Shutting down node agent");
        self.shutdown.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            warn!(aborted, "Tasks aborted after shutdown grace period");
        }
        info!("Node agent stopped");
    }
}

// =============================================================================
// Observation Handling
// =============================================================================

/// Work handed to one observation worker
enum WorkItem {
    Observation(DeviceObservation),
    /// Answered once everything queued before it has been handled
    Flush(oneshot::Sender<()>),
}

async fn flush(flush_tx: &mpsc::Sender<oneshot::Sender<()>>) -> Result<()> {
    let (done_tx, done_rx) = oneshot::channel();
    flush_tx
        .send(done_tx)
        .await
        .map_err(|_| Error::ChannelClosed("observation dispatcher".to_string()))?;
    done_rx
        .await
        .map_err(|_| Error::ChannelClosed("observation workers".to_string()))
}

/// Route observations to workers by path so one device is handled by one
/// worker. Queued observations are always dispatched ahead of a flush.
async fn dispatch(
    mut rx: mpsc::Receiver<DeviceObservation>,
    mut flushes: mpsc::Receiver<oneshot::Sender<()>>,
    workers: Vec<mpsc::Sender<WorkItem>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            observation = rx.recv() => {
                let Some(observation) = observation else { break };
                let index = worker_index(&observation.path, workers.len());
                if workers[index].send(WorkItem::Observation(observation)).await.is_err() {
                    error!(worker = index, "Observation worker stopped");
                    break;
                }
            }
            Some(done) = flushes.recv() => {
                let mut acks = Vec::with_capacity(workers.len());
                for worker in &workers {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    if worker.send(WorkItem::Flush(ack_tx)).await.is_ok() {
                        acks.push(ack_rx);
                    }
                }
                if acks.len() < workers.len() {
                    error!("Observation worker stopped");
                    break;
                }
                tokio::spawn(async move {
                    if futures::future::try_join_all(acks).await.is_ok() {
                        let _ = done.send(());
                    }
                });
            }
        }
    }
    debug!("Observation dispatcher stopped");
}

fn worker_index(path: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() as usize) % workers
}

struct ObservationWorker {
    index: usize,
    pipeline: Arc<ProbePipeline>,
    chain: Arc<FilterChain>,
    inventory: Arc<DeviceInventory>,
    publisher: DevicePublisherRef,
    metrics: Arc<AgentMetrics>,
}

impl ObservationWorker {
    async fn run(self, mut rx: mpsc::Receiver<WorkItem>, shutdown: CancellationToken) {
        loop {
            let item = tokio::select! {
                _ = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            match item {
                WorkItem::Observation(observation) => self.handle(observation).await,
                WorkItem::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!(worker = self.index, "Observation worker stopped");
    }

    async fn handle(&self, observation: DeviceObservation) {
        match self.pipeline.run(&observation).await {
            PipelineOutcome::Record(record) => {
                let mut record = *record;
                let verdict = self.chain.evaluate(&record);
                record.visible = verdict.visible;

                // A different device now sits at this path
                if let Some(previous) = self.inventory.identity_for_path(&record.path) {
                    if previous != record.identity {
                        info!(path = %record.path, old = %previous, new = %record.identity, "Device replaced");
                        let delta = self.inventory.remove(&previous);
                        self.publish(&delta).await;
                    }
                }

                let delta = self.inventory.upsert(record);
                self.publish(&delta).await;
            }
            PipelineOutcome::Removal { path } => match self.inventory.identity_for_path(&path) {
                Some(identity) => {
                    let delta = self.inventory.remove(&identity);
                    self.publish(&delta).await;
                }
                None => debug!(path = %path, "Removal of unknown device"),
            },
            PipelineOutcome::Rejected { path, reason } => {
                debug!(path = %path, reason = %reason, "Observation rejected");
            }
        }
        self.metrics.inventory_devices.set(self.inventory.len() as i64);
    }

    async fn publish(&self, delta: &InventoryDelta) {
        let identity = match delta.publication() {
            Publication::Publish(record) => &record.identity,
            Publication::Retract(identity) => identity,
            Publication::Nothing => return,
        };
        if let Err(e) = sync_device(&self.inventory, self.publisher.as_ref(), identity).await {
            warn!(identity = %identity, error = %e, "Failed to publish device");
        }
    }
}

// =============================================================================
// Claim Actor
// =============================================================================

async fn claim_actor(
    reconciler: Arc<ClaimReconciler>,
    mut claims: mpsc::Receiver<ClaimEvent>,
    mut inventory_events: broadcast::Receiver<crate::hardware::InventoryEvent>,
    rescan_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(rescan_interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(event) = claims.recv() => match event {
                ClaimEvent::Upserted(request) => reconciler.on_claim_upserted(request).await,
                ClaimEvent::Deleted(key) => reconciler.on_claim_deleted(&key).await,
            },
            event = inventory_events.recv() => match event {
                Ok(event) => reconciler.on_inventory_event(&event).await,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Inventory events lagged, rescanning");
                    reconciler.rescan().await
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = ticker.tick() => reconciler.rescan().await,
        };

        if let Err(e) = result {
            log_reconcile_error(&e);
        }
    }
    debug!("Claim actor stopped");
}

fn log_reconcile_error(e: &Error) {
    match e.action() {
        ErrorAction::NoRequeue => debug!(error = %e, "Claim notification ignored"),
        _ if e.is_internal_fault() => error!(error = %e, "Reconcile failed"),
        _ => warn!(error = %e, "Reconcile failed"),
    }
}

/// Convenience for callers that only hold a config path: load it or fall
/// back to the built-in defaults when the file does not exist
pub fn load_config_or_default(path: &std::path::Path) -> Result<NodeDiskManagerConfig> {
    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return Ok(NodeDiskManagerConfig::default());
    }
    NodeDiskManagerConfig::load(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ChannelPublisher, Published};
    use crate::domain::{ClaimKey, ClaimPhase, ClaimRequest, ObservationKind};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const GB_SECTORS: u64 = 1_000_000_000 / 512;

    fn add_disk(root: &Path, name: &str, serial: &str, gb: u64) {
        let dir = root.join("class/block").join(name);
        fs::create_dir_all(dir.join("device")).unwrap();
        fs::create_dir_all(dir.join("queue")).unwrap();
        fs::write(dir.join("size"), format!("{}\n", gb * GB_SECTORS)).unwrap();
        fs::write(dir.join("device/serial"), format!("{}\n", serial)).unwrap();
        fs::write(dir.join("device/model"), "TestDisk\n").unwrap();
        fs::write(dir.join("device/vendor"), "ACME\n").unwrap();
        fs::write(dir.join("queue/rotational"), "0\n").unwrap();
    }

    fn sysfs_only_config() -> NodeDiskManagerConfig {
        let mut config = NodeDiskManagerConfig::default();
        config
            .probe_configs
            .retain(|p| p.key == "sysfs-probe" || p.key == "capacity-probe");
        config
    }

    fn start(root: &Path, publisher: &ChannelPublisher) -> NodeAgent {
        let config = AgentConfig {
            host: "node-1".into(),
            diskstats_path: root.join("diskstats"),
            probe_context: ProbeContext {
                sysfs_root: root.to_path_buf(),
                mountinfo_path: root.join("mountinfo"),
                ..Default::default()
            },
            ..Default::default()
        };
        NodeAgent::start(
            config,
            &sysfs_only_config(),
            Arc::new(publisher.clone()),
            Arc::new(publisher.clone()),
            Arc::new(AgentMetrics::new().unwrap()),
        )
    }

    async fn next_claim(rx: &mut broadcast::Receiver<Published>, phase: ClaimPhase) -> ClaimRequest {
        loop {
            if let Published::Claim(claim) = rx.recv().await.unwrap() {
                if claim.phase == phase {
                    return claim;
                }
            }
        }
    }

    #[test]
    fn test_worker_index_is_stable() {
        assert_eq!(worker_index("/dev/sda", 4), worker_index("/dev/sda", 4));
        assert!(worker_index("/dev/sdb", 4) < 4);
    }

    #[tokio::test]
    async fn test_observation_to_binding() {
        let dir = TempDir::new().unwrap();
        add_disk(dir.path(), "sdb", "SER-B", 100);

        let publisher = ChannelPublisher::new();
        let mut rx = publisher.subscribe();
        let agent = start(dir.path(), &publisher);

        let sysfs = dir.path().join("class/block/sdb");
        agent
            .observation_sender()
            .send(DeviceObservation::new(
                "/dev/sdb",
                Some(sysfs.to_string_lossy().to_string()),
                ObservationKind::Added,
            ))
            .await
            .unwrap();

        let record = loop {
            if let Published::Device(record) = rx.recv().await.unwrap() {
                break record;
            }
        };
        assert!(record.visible);
        assert_eq!(record.capacity_bytes, 100 * GB_SECTORS * 512);

        // I/O statistics are exported for inventoried devices only
        fs::write(
            dir.path().join("diskstats"),
            "   8  16 sdb 42 0 84 7 0 0 0 0 0 7 7\n   8  32 sdc 5 0 10 1 0 0 0 0 0 1 1\n",
        )
        .unwrap();
        let text = agent.metrics().gather_text().unwrap();
        assert!(text.contains("ndm_disk_reads_completed_total{device=\"sdb\"} 42"));
        assert!(!text.contains("device=\"sdc\""));

        agent
            .claim_sender()
            .send(ClaimEvent::Upserted(ClaimRequest::new(
                "default/c1",
                50_000_000_000,
                None,
                "node-1",
            )))
            .await
            .unwrap();

        let bound = next_claim(&mut rx, ClaimPhase::Bound).await;
        assert_eq!(bound.bound_device, Some(record.identity.clone()));
        assert_eq!(
            agent.reconciler().claim(&ClaimKey::new("default/c1")).unwrap().phase,
            ClaimPhase::Bound
        );

        agent.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_filtered_device_is_not_published() {
        let dir = TempDir::new().unwrap();
        add_disk(dir.path(), "loop0", "SER-L", 10);

        let publisher = ChannelPublisher::new();
        let agent = start(dir.path(), &publisher);
        let mut inventory_rx = agent.inventory().subscribe();

        agent
            .observation_sender()
            .send(DeviceObservation::new("/dev/loop0", None, ObservationKind::Added))
            .await
            .unwrap();

        inventory_rx.recv().await.unwrap();
        let record = agent.inventory().snapshot().pop().unwrap();
        assert!(!record.visible);
        assert!(publisher.published_device(&record.identity).is_none());

        agent.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_flush_waits_for_queued_observations() {
        let dir = TempDir::new().unwrap();
        for (name, serial) in [("sdb", "SER-B"), ("sdc", "SER-C"), ("sdd", "SER-D")] {
            add_disk(dir.path(), name, serial, 10);
        }

        let publisher = ChannelPublisher::new();
        let agent = start(dir.path(), &publisher);
        for name in ["sdb", "sdc", "sdd"] {
            let sysfs = dir.path().join("class/block").join(name);
            agent
                .observation_sender()
                .send(DeviceObservation::new(
                    format!("/dev/{}", name),
                    Some(sysfs.to_string_lossy().to_string()),
                    ObservationKind::Added,
                ))
                .await
                .unwrap();
        }

        agent.flush_observations().await.unwrap();
        assert_eq!(agent.inventory().len(), 3);

        agent.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_initial_scan_releases_binding_to_absent_device() {
        let dir = TempDir::new().unwrap();
        add_disk(dir.path(), "sdb", "SER-B", 100);

        let publisher = ChannelPublisher::new();
        let mut rx = publisher.subscribe();
        let agent = start(dir.path(), &publisher);

        // Bound before a restart to a disk that is no longer there
        let mut adopted = ClaimRequest::new("default/c1", 50_000_000_000, None, "node-1");
        adopted.mark_bound(crate::domain::DeviceIdentity::new("blockdevice-unplugged"));
        agent
            .claim_sender()
            .send(ClaimEvent::Upserted(adopted))
            .await
            .unwrap();

        let watcher = DeviceWatcher::new(
            crate::hardware::DeviceScanner::new(crate::hardware::ScannerConfig {
                sysfs_root: dir.path().to_path_buf(),
                ..Default::default()
            }),
            agent.gates().clone(),
        );
        agent.spawn_watcher(watcher, Duration::from_secs(3600));

        let pending = next_claim(&mut rx, ClaimPhase::Pending).await;
        assert_eq!(pending.key.as_str(), "default/c1");
        let bound = next_claim(&mut rx, ClaimPhase::Bound).await;
        let record = agent.inventory().get(bound.bound_device.as_ref().unwrap()).unwrap();
        assert_eq!(record.path, "/dev/sdb");
        assert!(agent.reconciler().inventory_complete());

        agent.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_load_config_missing_file() {
        let dir = TempDir::new().unwrap();
        let config = load_config_or_default(&dir.path().join("absent.config")).unwrap();
        assert_eq!(config, NodeDiskManagerConfig::default());
    }
}
