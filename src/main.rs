//! SensorHub CLI - control plane simulation
//!
//! Runs a connection manager and a fleet of simulated sensors over the
//! in-memory transport.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use sensorhub_control::{
    AllowAll, Cluster, ConnectionManager, InMemoryClusterManager, InboundHandler, ManagerConfig,
    ManagerError, RequestContext, StaticSyncSource, UpgradeProgress, UpgradeStage,
};
use sensorhub_proto::{Compression, EventAction, SensorEvent};
use sensorhub_sensor::{InMemorySensorState, MemoryClusterIdCache, Sensor, SensorConfig, SensorHandle};
use sensorhub_transport::memory;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// SensorHub - one stream per cluster sensor
#[derive(Parser, Debug)]
#[command(name = "sensorhub")]
#[command(about = "SensorHub - manage sensor connections for monitored clusters")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a connection manager against simulated sensors
    #[command(long_about = r#"
Start a connection manager and one simulated sensor per cluster, all
talking over an in-process transport. Each sensor is forced to reconnect
a number of times to exercise connection replacement.

EXAMPLES:
  # Three clusters, each reconnecting twice
  sensorhub simulate --clusters 3 --reconnects 2

  # With upgrade coordination, created for every cluster at startup
  sensorhub simulate --enable-upgrades --eager-upgrade-handles

ENVIRONMENT VARIABLES:
  SENSORHUB_UPGRADES_ENABLED  Enable sensor upgrade coordination
    "#)]
    Simulate {
        /// Number of simulated clusters
        #[arg(long, default_value = "3")]
        clusters: usize,

        /// Forced reconnects per sensor
        #[arg(long, default_value = "2")]
        reconnects: usize,

        /// Coordinate sensor upgrades
        #[arg(long, env = "SENSORHUB_UPGRADES_ENABLED")]
        enable_upgrades: bool,

        /// Create upgrade coordinators for all clusters at startup
        #[arg(long)]
        eager_upgrade_handles: bool,

        /// Only accept uncompressed streams, forcing the sensor fallback
        #[arg(long)]
        no_gzip: bool,

        /// Contact time reporting interval in seconds
        #[arg(long, default_value = "30")]
        contact_interval: u64,

        /// How long to run, in seconds
        #[arg(long, default_value = "10")]
        duration: u64,
    },
}

/// `RUST_LOG` takes precedence over the verbose flag
fn log_filter(verbose: bool) -> EnvFilter {
    let log_level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(log_filter(verbose))
        .init();
}

/// Logs sensor events as they arrive
struct EventLogger;

#[async_trait]
impl InboundHandler for EventLogger {
    async fn on_event(&self, cluster_id: &str, event: &SensorEvent) {
        debug!(
            cluster_id = %cluster_id,
            event_id = %event.event_id,
            "{:?} {}",
            event.action,
            event.resource
        );
    }
}

struct SimulatedSensor {
    handle: SensorHandle,
    task: JoinHandle<()>,
}

/// Accept streams for one cluster and hand each to the manager
fn serve_cluster(
    manager: Arc<ConnectionManager>,
    mut listener: memory::MemoryListener,
    cluster_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(incoming) = listener.accept().await {
            let manager = manager.clone();
            let cluster_id = cluster_id.clone();
            tokio::spawn(async move {
                match manager.handle_connection(&cluster_id, incoming).await {
                    Ok(()) => debug!(cluster_id = %cluster_id, "Connection closed"),
                    Err(ManagerError::Connection { source, .. }) => {
                        info!(cluster_id = %cluster_id, "Connection ended: {}", source)
                    }
                    Err(e) => warn!(cluster_id = %cluster_id, "Connection failed: {}", e),
                }
            });
        }
    })
}

fn spawn_sensor(cluster_id: &str, dialer: memory::MemoryDialer) -> SimulatedSensor {
    let (sensor, handle) = Sensor::new(
        SensorConfig::new(cluster_id),
        Arc::new(dialer),
        Arc::new(InMemorySensorState::new()),
        Arc::new(MemoryClusterIdCache::new()),
    );

    let cluster_id = cluster_id.to_string();
    let task = tokio::spawn(async move {
        if let Err(e) = sensor.run().await {
            error!(cluster_id = %cluster_id, "Sensor stopped: {}", e);
        }
    });
    SimulatedSensor { handle, task }
}

/// Emit events and force reconnects until cancelled
async fn drive_sensor(handle: SensorHandle, index: usize, reconnects: usize, stop: CancellationToken) {
    let mut ticks = tokio::time::interval(Duration::from_millis(500));
    let mut remaining = reconnects;
    let mut sequence = 0u64;

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticks.tick() => {
                sequence += 1;
                let event = SensorEvent {
                    event_id: format!("sensor-{}-event-{}", index, sequence),
                    resource: format!("deployment/app-{}", sequence % 5),
                    action: EventAction::Update,
                    payload: Default::default(),
                };
                if !handle.send_event(event).await {
                    break;
                }
                if remaining > 0 && sequence % 4 == 0 {
                    remaining -= 1;
                    info!("Forcing sensor {} to reconnect ({} left)", index, remaining);
                    handle.reconnect();
                }
            }
        }
    }
}

async fn exercise_upgrades(manager: &ConnectionManager, cluster_id: &str) {
    let ctx = RequestContext::new("simulator");
    let process_id = match manager.trigger_upgrade(&ctx, cluster_id).await {
        Ok(process_id) => process_id,
        Err(e) => {
            warn!("Could not trigger upgrade of {}: {}", cluster_id, e);
            return;
        }
    };

    for stage in [UpgradeStage::Preflight, UpgradeStage::Executing, UpgradeStage::Complete] {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Err(e) = manager
            .record_upgrade_progress(cluster_id, &process_id, UpgradeProgress::new(stage, ""))
            .await
        {
            warn!("Failed to record upgrade progress: {}", e);
            return;
        }
    }
}

async fn simulate(
    clusters: usize,
    reconnects: usize,
    enable_upgrades: bool,
    eager_upgrade_handles: bool,
    no_gzip: bool,
    contact_interval: Duration,
    duration: Duration,
) -> Result<()> {
    let cluster_ids: Vec<String> = (0..clusters).map(|i| format!("cluster-{}", i)).collect();
    let store = Arc::new(InMemoryClusterManager::with_clusters(
        cluster_ids
            .iter()
            .map(|id| Cluster::new(id.clone(), format!("{} (simulated)", id))),
    ));

    let config = ManagerConfig::default()
        .with_upgrades(enable_upgrades)
        .with_eager_upgrade_handles(eager_upgrade_handles)
        .with_contact_interval(contact_interval);
    let manager = Arc::new(
        ConnectionManager::new(
            config,
            store.clone(),
            Arc::new(AllowAll),
            Arc::new(StaticSyncSource::new()),
        )
        .with_inbound_handler(Arc::new(EventLogger)),
    );
    manager
        .start()
        .await
        .context("Failed to start connection manager")?;

    let supported = if no_gzip {
        vec![Compression::None]
    } else {
        vec![Compression::Gzip, Compression::None]
    };

    let stop = CancellationToken::new();
    let mut sensors = Vec::new();
    let mut drivers = Vec::new();
    for (index, cluster_id) in cluster_ids.iter().enumerate() {
        let (dialer, listener) = memory::listener(supported.clone());
        serve_cluster(manager.clone(), listener, cluster_id.clone());
        let sensor = spawn_sensor(cluster_id, dialer);
        drivers.push(tokio::spawn(drive_sensor(
            sensor.handle.clone(),
            index,
            reconnects,
            stop.child_token(),
        )));
        sensors.push(sensor);
    }

    if enable_upgrades {
        if let Some(first) = cluster_ids.first() {
            tokio::time::sleep(Duration::from_secs(1)).await;
            exercise_upgrades(&manager, first).await;
        }
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    tokio::select! {
        _ = &mut ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = tokio::time::sleep(duration) => info!("Simulation finished"),
    }

    let active = manager.get_active_connections().await;
    info!("{} of {} clusters connected", active.len(), clusters);
    for conn in &active {
        let connected_for = chrono::Utc::now() - conn.connected_at();
        let last_reported = store
            .contact_time(conn.cluster_id())
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        info!(
            cluster_id = %conn.cluster_id(),
            connection_id = %conn.id(),
            "Connected for {}s, contact last reported {}",
            connected_for.num_seconds(),
            last_reported
        );
    }

    stop.cancel();
    for sensor in &sensors {
        sensor.handle.shutdown();
    }
    for driver in drivers {
        let _ = driver.await;
    }
    for sensor in sensors {
        if let Err(e) = sensor.task.await {
            error!("Sensor task panicked: {}", e);
        }
    }
    manager.shutdown().await;

    info!("SensorHub stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Simulate {
            clusters,
            reconnects,
            enable_upgrades,
            eager_upgrade_handles,
            no_gzip,
            contact_interval,
            duration,
        } => {
            info!(
                "SensorHub simulation starting ({} clusters, {} reconnects each)",
                clusters, reconnects
            );
            if eager_upgrade_handles && !enable_upgrades {
                warn!("--eager-upgrade-handles has no effect without --enable-upgrades");
            }

            simulate(
                clusters,
                reconnects,
                enable_upgrades,
                eager_upgrade_handles,
                no_gzip,
                Duration::from_secs(contact_interval.max(1)),
                Duration::from_secs(duration),
            )
            .await
        }
    }
}
