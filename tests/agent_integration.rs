//! End-to-end tests: a fake sysfs tree, the device watcher and the agent
//! wired to an in-memory publisher.

use node_disk_agent::adapters::{ChannelPublisher, Published};
use node_disk_agent::{
    AgentConfig, AgentMetrics, ClaimEvent, ClaimKey, ClaimPhase, ClaimRequest, DeviceIdentity,
    DeviceRecord, DeviceScanner, DeviceWatcher, NodeAgent, NodeDiskManagerConfig,
    ProbeContext, ScannerConfig,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

const GB: u64 = 1_000_000_000;
const WAIT: Duration = Duration::from_secs(5);

fn add_disk(root: &Path, name: &str, serial: &str, gb: u64) -> PathBuf {
    let dir = root.join("class/block").join(name);
    fs::create_dir_all(dir.join("device")).unwrap();
    fs::create_dir_all(dir.join("queue")).unwrap();
    fs::write(dir.join("size"), format!("{}\n", gb * GB / 512)).unwrap();
    fs::write(dir.join("device/serial"), format!("{}\n", serial)).unwrap();
    fs::write(dir.join("device/model"), "TestDisk\n").unwrap();
    fs::write(dir.join("device/vendor"), "ACME\n").unwrap();
    fs::write(dir.join("queue/rotational"), "0\n").unwrap();
    let minor = (name.as_bytes()[2] - b'a') as u32 * 16;
    fs::write(dir.join("dev"), format!("8:{}\n", minor)).unwrap();
    dir
}

/// Default config without the probes that shell out
fn config() -> NodeDiskManagerConfig {
    let mut config = NodeDiskManagerConfig::default();
    config
        .probe_configs
        .retain(|p| matches!(p.key.as_str(), "sysfs-probe" | "capacity-probe" | "mount-probe"));
    config
}

struct Harness {
    _dir: TempDir,
    root: PathBuf,
    agent: NodeAgent,
    watcher: DeviceWatcher,
    publisher: ChannelPublisher,
    rx: broadcast::Receiver<Published>,
}

impl Harness {
    fn new() -> Self {
        Self::with_resync(0)
    }

    /// Harness whose watcher re-probes known devices every `polls` polls
    fn with_resync(polls: u32) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        fs::write(root.join("mountinfo"), "").unwrap();

        let ndm = config();
        let publisher = ChannelPublisher::new();
        let rx = publisher.subscribe();
        let agent = NodeAgent::start(
            AgentConfig {
                host: "node-1".into(),
                rescan_interval: Duration::from_secs(3600),
                probe_context: ProbeContext {
                    sysfs_root: root.clone(),
                    mountinfo_path: root.join("mountinfo"),
                    ..Default::default()
                },
                ..Default::default()
            },
            &ndm,
            Arc::new(publisher.clone()),
            Arc::new(publisher.clone()),
            Arc::new(AgentMetrics::new().unwrap()),
        );
        let watcher = DeviceWatcher::new(
            DeviceScanner::new(ScannerConfig {
                sysfs_root: root.clone(),
                ..Default::default()
            }),
            agent.gates().clone(),
        )
        .with_resync_every(polls);

        Self {
            _dir: dir,
            root,
            agent,
            watcher,
            publisher,
            rx,
        }
    }

    async fn poll(&mut self) {
        for observation in self.watcher.poll().unwrap() {
            self.agent.observation_sender().send(observation).await.unwrap();
        }
    }

    async fn claim(&self, name: &str, gb: u64) {
        self.agent
            .claim_sender()
            .send(ClaimEvent::Upserted(ClaimRequest::new(
                format!("default/{}", name),
                gb * GB,
                None,
                "node-1",
            )))
            .await
            .unwrap();
    }

    async fn next_device(&mut self) -> DeviceRecord {
        timeout(WAIT, async {
            loop {
                if let Published::Device(record) = self.rx.recv().await.unwrap() {
                    return record;
                }
            }
        })
        .await
        .expect("device publication")
    }

    async fn next_retraction(&mut self) -> DeviceIdentity {
        timeout(WAIT, async {
            loop {
                if let Published::Retracted(identity) = self.rx.recv().await.unwrap() {
                    return identity;
                }
            }
        })
        .await
        .expect("device retraction")
    }

    async fn next_claim(&mut self, key: &str, phase: ClaimPhase) -> ClaimRequest {
        timeout(WAIT, async {
            loop {
                if let Published::Claim(claim) = self.rx.recv().await.unwrap() {
                    if claim.key.as_str() == key && claim.phase == phase {
                        return claim;
                    }
                }
            }
        })
        .await
        .expect("claim publication")
    }
}

#[tokio::test]
async fn test_claim_binds_best_fit_device() {
    let mut h = Harness::new();
    add_disk(&h.root, "sdb", "SER-B", 100);
    add_disk(&h.root, "sdc", "SER-C", 150);
    add_disk(&h.root, "sdd", "SER-D", 200);
    h.poll().await;

    let mut published = Vec::new();
    for _ in 0..3 {
        published.push(h.next_device().await);
    }
    let sdc = published.iter().find(|r| r.path.ends_with("sdc")).unwrap().identity.clone();

    h.claim("c1", 120).await;
    let bound = h.next_claim("default/c1", ClaimPhase::Bound).await;
    assert_eq!(bound.bound_device, Some(sdc));

    h.agent.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_pending_claim_binds_when_device_arrives() {
    let mut h = Harness::new();
    h.poll().await;

    h.claim("c1", 50).await;
    h.next_claim("default/c1", ClaimPhase::Pending).await;

    add_disk(&h.root, "sdb", "SER-B", 100);
    h.poll().await;

    let bound = h.next_claim("default/c1", ClaimPhase::Bound).await;
    let record = h.agent.inventory().get(bound.bound_device.as_ref().unwrap()).unwrap();
    assert_eq!(record.path, "/dev/sdb");
    assert_eq!(record.claim_state.holder(), Some(&ClaimKey::new("default/c1")));

    h.agent.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unplugged_bound_device_returns_claim_to_pending() {
    let mut h = Harness::new();
    let sdb = add_disk(&h.root, "sdb", "SER-B", 100);
    h.poll().await;
    let device = h.next_device().await;

    h.claim("c1", 50).await;
    h.next_claim("default/c1", ClaimPhase::Bound).await;

    fs::remove_dir_all(sdb).unwrap();
    h.poll().await;

    let pending = h.next_claim("default/c1", ClaimPhase::Pending).await;
    assert!(pending.bound_device.is_none());

    // The stale entry is gone once the claim lets go
    timeout(WAIT, async {
        while h.agent.inventory().get(&device.identity).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stale entry removed");

    h.agent.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_os_disk_is_hidden() {
    let mut h = Harness::new();
    add_disk(&h.root, "sda", "SER-A", 100);
    fs::write(
        h.root.join("mountinfo"),
        "25 1 8:0 / / rw,relatime shared:1 - ext4 /dev/sda rw\n",
    )
    .unwrap();
    add_disk(&h.root, "sdb", "SER-B", 100);
    h.poll().await;

    // Only sdb is published; sda is excluded by the OS disk filter
    let record = h.next_device().await;
    assert_eq!(record.path, "/dev/sdb");

    timeout(WAIT, async {
        while h.agent.inventory().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both devices inventoried");

    let sda = h
        .agent
        .inventory()
        .snapshot()
        .into_iter()
        .find(|r| r.path == "/dev/sda")
        .unwrap();
    assert!(!sda.visible);
    assert_eq!(sda.mount_points(), ["/".to_string()]);
    assert!(h.publisher.published_device(&sda.identity).is_none());

    h.agent.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_removed_unclaimed_device_is_retracted() {
    let mut h = Harness::new();
    let sdb = add_disk(&h.root, "sdb", "SER-B", 100);
    h.poll().await;
    let device = h.next_device().await;

    fs::remove_dir_all(sdb).unwrap();
    h.poll().await;

    assert_eq!(h.next_retraction().await, device.identity);
    assert!(h.agent.inventory().is_empty());

    h.agent.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_mounting_root_hides_discovered_device() {
    let mut h = Harness::with_resync(1);
    add_disk(&h.root, "sdb", "SER-B", 100);
    h.poll().await;
    let device = h.next_device().await;
    assert!(device.visible);

    // sdb becomes the root filesystem after discovery
    fs::write(
        h.root.join("mountinfo"),
        "22 1 8:16 / / rw,relatime - ext4 /dev/sdb rw\n",
    )
    .unwrap();
    h.poll().await;

    assert_eq!(h.next_retraction().await, device.identity);
    let record = h.agent.inventory().get(&device.identity).unwrap();
    assert!(!record.visible);
    assert_eq!(record.mount_points(), ["/".to_string()]);

    // No longer offered to claims
    h.claim("c1", 50).await;
    h.next_claim("default/c1", ClaimPhase::Pending).await;
    assert!(!h.agent.inventory().get(&device.identity).unwrap().is_available());

    h.agent.shutdown(Duration::from_secs(1)).await;
}
