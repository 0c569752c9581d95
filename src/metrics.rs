//! Agent Metrics
//!
//! Prometheus collectors for the probe pipeline, filter chain, inventory
//! and claim reconciler, plus per-device I/O statistics read from
//! `/proc/diskstats` at scrape time. Each agent owns its own `Registry` so
//! tests and multiple agents in one process never collide on registration.

use crate::error::Result;
use parking_lot::RwLock;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

/// Sector size used by `/proc/diskstats`, independent of the device
const DISKSTATS_SECTOR_SIZE: u64 = 512;

/// Label value of the diskstats collector in `ndm_collector_uptime_seconds`
pub const DISKSTATS_COLLECTOR: &str = "diskstats";

// =============================================================================
// Disk Statistics
// =============================================================================

/// One line of `/proc/diskstats`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub name: String,
    pub reads_completed: u64,
    pub sectors_read: u64,
    pub read_time_ms: u64,
    pub writes_completed: u64,
    pub sectors_written: u64,
    pub write_time_ms: u64,
}

impl DiskStats {
    pub fn read_bytes(&self) -> u64 {
        self.sectors_read * DISKSTATS_SECTOR_SIZE
    }

    pub fn write_bytes(&self) -> u64 {
        self.sectors_written * DISKSTATS_SECTOR_SIZE
    }
}

/// Parse `/proc/diskstats`, skipping malformed lines
pub fn parse_diskstats(input: &str) -> Vec<DiskStats> {
    input
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 11 {
                return None;
            }
            let num = |i: usize| fields[i].parse::<u64>().ok();
            Some(DiskStats {
                name: fields[2].to_string(),
                reads_completed: num(3)?,
                sectors_read: num(5)?,
                read_time_ms: num(6)?,
                writes_completed: num(7)?,
                sectors_written: num(9)?,
                write_time_ms: num(10)?,
            })
        })
        .collect()
}

fn ratio(total: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total as f64 / count as f64
    }
}

/// Where per-device statistics come from: the stats file and the kernel
/// names of the devices to report
pub struct DiskStatsSource {
    path: PathBuf,
    devices: Box<dyn Fn() -> Vec<String> + Send + Sync>,
    attached_at: Instant,
}

impl DiskStatsSource {
    pub fn new(
        path: impl Into<PathBuf>,
        devices: impl Fn() -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            devices: Box::new(devices),
            attached_at: Instant::now(),
        }
    }
}

/// Collectors fed from `/proc/diskstats`
struct DiskCollectors {
    reads_completed: IntCounterVec,
    read_bytes: IntCounterVec,
    writes_completed: IntCounterVec,
    write_bytes: IntCounterVec,
    read_bytes_average: GaugeVec,
    write_bytes_average: GaugeVec,
    read_latency: GaugeVec,
    write_latency: GaugeVec,
}

impl DiskCollectors {
    fn new(registry: &Registry) -> Result<Self> {
        let counter = |name: &str, help: &str| -> Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(name, help), &["device"])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };
        let gauge = |name: &str, help: &str| -> Result<GaugeVec> {
            let vec = GaugeVec::new(Opts::new(name, help), &["device"])?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        Ok(Self {
            reads_completed: counter(
                "ndm_disk_reads_completed_total",
                "Total number of reads completed successfully.",
            )?,
            read_bytes: counter(
                "ndm_disk_read_bytes_total",
                "Total number of bytes read successfully.",
            )?,
            writes_completed: counter(
                "ndm_disk_writes_completed_total",
                "Total number of writes completed successfully.",
            )?,
            write_bytes: counter(
                "ndm_disk_write_bytes_total",
                "Total number of bytes written successfully.",
            )?,
            read_bytes_average: gauge(
                "ndm_disk_read_bytes_average",
                "Average number of bytes per completed read.",
            )?,
            write_bytes_average: gauge(
                "ndm_disk_write_bytes_average",
                "Average number of bytes per completed write.",
            )?,
            read_latency: gauge(
                "ndm_disk_read_latency",
                "Average time per completed read in milliseconds.",
            )?,
            write_latency: gauge(
                "ndm_disk_write_latency",
                "Average time per completed write in milliseconds.",
            )?,
        })
    }

    /// Replace every series with the values of `stats`; devices that are
    /// gone disappear from the exposition
    fn update(&self, stats: &[DiskStats]) {
        self.reset();
        for disk in stats {
            let labels = [disk.name.as_str()];
            self.reads_completed
                .with_label_values(&labels)
                .inc_by(disk.reads_completed);
            self.read_bytes
                .with_label_values(&labels)
                .inc_by(disk.read_bytes());
            self.writes_completed
                .with_label_values(&labels)
                .inc_by(disk.writes_completed);
            self.write_bytes
                .with_label_values(&labels)
                .inc_by(disk.write_bytes());
            self.read_bytes_average
                .with_label_values(&labels)
                .set(ratio(disk.read_bytes(), disk.reads_completed));
            self.write_bytes_average
                .with_label_values(&labels)
                .set(ratio(disk.write_bytes(), disk.writes_completed));
            self.read_latency
                .with_label_values(&labels)
                .set(ratio(disk.read_time_ms, disk.reads_completed));
            self.write_latency
                .with_label_values(&labels)
                .set(ratio(disk.write_time_ms, disk.writes_completed));
        }
    }

    fn reset(&self) {
        self.reads_completed.reset();
        self.read_bytes.reset();
        self.writes_completed.reset();
        self.write_bytes.reset();
        self.read_bytes_average.reset();
        self.write_bytes_average.reset();
        self.read_latency.reset();
        self.write_latency.reset();
    }
}

// =============================================================================
// Agent Metrics
// =============================================================================

/// Collectors exported by the agent
pub struct AgentMetrics {
    registry: Registry,
    started_at: Instant,
    disks: DiskCollectors,
    disk_source: RwLock<Option<DiskStatsSource>>,

    pub uptime_seconds: Gauge,
    pub collector_uptime_seconds: GaugeVec,
    pub probe_failures: IntCounterVec,
    pub filter_exclusions: IntCounterVec,
    pub identity_unresolved: IntCounter,
    pub claim_match_attempts: IntCounter,
    pub claim_match_success: IntCounter,
    pub claim_match_failures: IntCounter,
    pub claim_exclusivity_violations: IntCounter,
    pub inventory_devices: IntGauge,
    pub claims_pending: IntGauge,
    pub claims_bound: IntGauge,
}

impl AgentMetrics {
    /// Create and register all collectors
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let uptime_seconds = Gauge::with_opts(Opts::new(
            "ndm_uptime_seconds",
            "Uptime of node disk manager.",
        ))?;
        let collector_uptime_seconds = GaugeVec::new(
            Opts::new("ndm_collector_uptime_seconds", "Uptime of collector."),
            &["collector"],
        )?;
        collector_uptime_seconds
            .with_label_values(&[DISKSTATS_COLLECTOR])
            .set(0.0);
        let probe_failures = IntCounterVec::new(
            Opts::new("ndm_probe_failures_total", "Probe runs that failed transiently."),
            &["probe"],
        )?;
        let filter_exclusions = IntCounterVec::new(
            Opts::new(
                "ndm_filter_exclusions_total",
                "Devices hidden by a filter.",
            ),
            &["filter"],
        )?;
        let identity_unresolved = IntCounter::new(
            "ndm_identity_unresolved_total",
            "Devices rejected because no stable identity could be derived.",
        )?;
        let claim_match_attempts = IntCounter::new(
            "ndm_claim_match_attempts_total",
            "Attempts to match a pending claim.",
        )?;
        let claim_match_success = IntCounter::new(
            "ndm_claim_match_success_total",
            "Claims bound to a device.",
        )?;
        let claim_match_failures = IntCounter::new(
            "ndm_claim_match_failures_total",
            "Match attempts that found no eligible device.",
        )?;
        let claim_exclusivity_violations = IntCounter::new(
            "ndm_claim_exclusivity_violations_total",
            "Bind attempts rejected because the device was already bound.",
        )?;
        let inventory_devices =
            IntGauge::new("ndm_inventory_devices", "Devices held in the inventory.")?;
        let claims_pending = IntGauge::new("ndm_claims_pending", "Claims in Pending phase.")?;
        let claims_bound = IntGauge::new("ndm_claims_bound", "Claims in Bound phase.")?;

        registry.register(Box::new(uptime_seconds.clone()))?;
        registry.register(Box::new(collector_uptime_seconds.clone()))?;
        registry.register(Box::new(probe_failures.clone()))?;
        registry.register(Box::new(filter_exclusions.clone()))?;
        registry.register(Box::new(identity_unresolved.clone()))?;
        registry.register(Box::new(claim_match_attempts.clone()))?;
        registry.register(Box::new(claim_match_success.clone()))?;
        registry.register(Box::new(claim_match_failures.clone()))?;
        registry.register(Box::new(claim_exclusivity_violations.clone()))?;
        registry.register(Box::new(inventory_devices.clone()))?;
        registry.register(Box::new(claims_pending.clone()))?;
        registry.register(Box::new(claims_bound.clone()))?;

        let disks = DiskCollectors::new(&registry)?;

        Ok(Self {
            registry,
            started_at: Instant::now(),
            disks,
            disk_source: RwLock::new(None),
            uptime_seconds,
            collector_uptime_seconds,
            probe_failures,
            filter_exclusions,
            identity_unresolved,
            claim_match_attempts,
            claim_match_success,
            claim_match_failures,
            claim_exclusivity_violations,
            inventory_devices,
            claims_pending,
            claims_bound,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Report I/O statistics for the devices `source` names. Replaces any
    /// previous source.
    pub fn attach_disk_stats(&self, source: DiskStatsSource) {
        *self.disk_source.write() = Some(source);
    }

    /// Re-read the diskstats file for the current device set
    pub fn refresh_disk_stats(&self) {
        let source = self.disk_source.read();
        let Some(source) = source.as_ref() else {
            return;
        };
        self.collector_uptime_seconds
            .with_label_values(&[DISKSTATS_COLLECTOR])
            .set(source.attached_at.elapsed().as_secs_f64());

        let content = match std::fs::read_to_string(&source.path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %source.path.display(), error = %e, "Disk statistics unavailable");
                self.disks.reset();
                return;
            }
        };
        let devices = (source.devices)();
        let stats: Vec<DiskStats> = parse_diskstats(&content)
            .into_iter()
            .filter(|disk| devices.contains(&disk.name))
            .collect();
        self.disks.update(&stats);
    }

    /// Text exposition of every collector, with uptime and disk statistics
    /// refreshed
    pub fn gather_text(&self) -> Result<String> {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs_f64());
        self.refresh_disk_stats();

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl std::fmt::Debug for AgentMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentMetrics")
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
