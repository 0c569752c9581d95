//! Node Disk Agent
//!
//! Runs on every node: discovers block devices, publishes them as
//! BlockDevice objects and binds DeviceClaims to them.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_disk_agent::adapters::{watch_claims, KubePublisher, LoggingPublisher};
use node_disk_agent::domain::{ClaimPublisherRef, DevicePublisherRef};
use node_disk_agent::{
    AgentConfig, AgentMetrics, DeviceScanner, DeviceWatcher, Error, NodeAgent,
    NodeDiskManagerConfig, ProbeContext, Result, ScannerConfig, DEFAULT_CONFIG_FILE_PATH,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node Disk Agent - block device discovery and claim binding
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Probe/filter config file
    #[arg(long, env = "NDM_CONFIG", default_value = DEFAULT_CONFIG_FILE_PATH)]
    config: PathBuf,

    /// Name of the node this agent runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// sysfs mount point
    #[arg(long, env = "SYSFS_ROOT", default_value = "/sys")]
    sysfs_root: PathBuf,

    /// Mount table used by the mount probe
    #[arg(long, env = "MOUNTINFO_PATH", default_value = "/proc/self/mountinfo")]
    mountinfo_path: PathBuf,

    /// Per-device I/O statistics exported as metrics
    #[arg(long, env = "DISKSTATS_PATH", default_value = "/proc/diskstats")]
    diskstats_path: PathBuf,

    /// Device scan interval in seconds
    #[arg(long, env = "SCAN_INTERVAL", default_value = "10")]
    scan_interval_secs: u64,

    /// Re-probe every known device each this many scans (0 disables)
    #[arg(long, env = "RESYNC_EVERY", default_value = "6")]
    resync_every: u32,

    /// Claim rescan interval in seconds
    #[arg(long, env = "RESCAN_INTERVAL", default_value = "30")]
    rescan_interval_secs: u64,

    /// Upper bound for one probe run in seconds
    #[arg(long, env = "PROBE_TIMEOUT", default_value = "10")]
    probe_timeout_secs: u64,

    /// Observation workers
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Grace period for shutdown in seconds
    #[arg(long, env = "SHUTDOWN_GRACE", default_value = "10")]
    shutdown_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes, publish to logs)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Node Disk Agent");
    info!("  Version: {}", node_disk_agent::VERSION);
    info!("  Node: {}", args.node_name);
    info!("  Config: {}", args.config.display());
    info!("  Standalone mode: {}", args.standalone);

    let ndm_config = if args.config.exists() {
        NodeDiskManagerConfig::load(&args.config)?
    } else {
        info!("Config file not found, using defaults");
        NodeDiskManagerConfig::default()
    };

    let metrics = Arc::new(AgentMetrics::new()?);

    let (device_publisher, claim_publisher, client): (DevicePublisherRef, ClaimPublisherRef, _) =
        if args.standalone {
            let publisher = Arc::new(LoggingPublisher::new());
            let device: DevicePublisherRef = publisher.clone();
            let claim: ClaimPublisherRef = publisher;
            (device, claim, None)
        } else {
            let client = kube::Client::try_default().await?;
            let publisher = Arc::new(KubePublisher::new(client.clone()));
            let device: DevicePublisherRef = publisher.clone();
            let claim: ClaimPublisherRef = publisher;
            (device, claim, Some(client))
        };

    let agent_config = AgentConfig {
        host: args.node_name.clone(),
        workers: args.workers,
        rescan_interval: Duration::from_secs(args.rescan_interval_secs),
        diskstats_path: args.diskstats_path.clone(),
        probe_context: ProbeContext {
            sysfs_root: args.sysfs_root.clone(),
            mountinfo_path: args.mountinfo_path.clone(),
            timeout: Duration::from_secs(args.probe_timeout_secs),
            ..Default::default()
        },
        ..Default::default()
    };

    let agent = NodeAgent::start(
        agent_config,
        &ndm_config,
        device_publisher,
        claim_publisher,
        metrics.clone(),
    );

    // Device discovery
    let scanner = DeviceScanner::new(ScannerConfig {
        sysfs_root: args.sysfs_root.clone(),
        ..Default::default()
    });
    let watcher = DeviceWatcher::new(scanner, agent.gates().clone())
        .with_resync_every(args.resync_every);
    agent.spawn_watcher(watcher, Duration::from_secs(args.scan_interval_secs));

    // Claim watch
    if let Some(client) = client {
        let tx = agent.claim_sender();
        let shutdown = agent.shutdown_token();
        tokio::spawn(async move {
            if let Err(e) = watch_claims(client, tx, shutdown).await {
                error!("Claim watch error: {}", e);
            }
        });
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let server_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, server_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    agent
        .shutdown(Duration::from_secs(args.shutdown_grace_secs))
        .await;

    info!("Agent shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let (status, body) = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => (StatusCode::OK, "ok"),
                _ => (StatusCode::NOT_FOUND, "not found"),
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<AgentMetrics>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    if req.uri().path() != "/metrics" {
                        let mut response = Response::new(Body::from("not found"));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        return Ok::<_, std::convert::Infallible>(response);
                    }

                    let response = match metrics.gather_text() {
                        Ok(text) => {
                            let mut response = Response::new(Body::from(text));
                            response.headers_mut().insert(
                                CONTENT_TYPE,
                                HeaderValue::from_static("text/plain; version=0.0.4"),
                            );
                            response
                        }
                        Err(e) => {
                            error!("Failed to encode metrics: {}", e);
                            let mut response = Response::new(Body::from("encoding failed"));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
