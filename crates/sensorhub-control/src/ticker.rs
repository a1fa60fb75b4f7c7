//! Periodic contact time reporting for connected clusters

use crate::cluster::ClusterManager;
use crate::manager::ConnectionManager;
use chrono::Utc;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Reports every connected cluster to the cluster store once per interval.
///
/// Store failures are logged and never stop the ticker. A report that takes
/// longer than the interval is abandoned so ticks do not pile up.
pub struct LivenessTicker {
    manager: Weak<ConnectionManager>,
    cluster_manager: Arc<dyn ClusterManager>,
    period: Duration,
    shutdown: CancellationToken,
}

impl LivenessTicker {
    pub fn new(
        manager: Weak<ConnectionManager>,
        cluster_manager: Arc<dyn ClusterManager>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            manager,
            cluster_manager,
            period,
            shutdown,
        }
    }

    pub async fn run(self) {
        let mut ticks = interval(self.period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticks.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    let Some(manager) = self.manager.upgrade() else { break };
                    self.report(&manager).await;
                }
            }
        }
        debug!("Liveness ticker stopped");
    }

    /// Report the current set of connected clusters once
    pub async fn report(&self, manager: &ConnectionManager) {
        let cluster_ids: Vec<String> = manager
            .get_active_connections()
            .await
            .iter()
            .map(|conn| conn.cluster_id().to_string())
            .collect();

        let update = self
            .cluster_manager
            .update_cluster_contact_times(Utc::now(), &cluster_ids);
        match timeout(self.period, update).await {
            Ok(Ok(())) => debug!("Reported contact for {} clusters", cluster_ids.len()),
            Ok(Err(e)) => warn!("Failed to update cluster contact times: {}", e),
            Err(_) => warn!(
                "Updating cluster contact times took longer than {:?}",
                self.period
            ),
        }
    }
}
