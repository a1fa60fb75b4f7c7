//! Registry of live sensor connections, one per cluster

use crate::auth::{RequestContext, WriteAuthorizer};
use crate::cluster::ClusterManager;
use crate::config::ManagerConfig;
use crate::connection::{InboundHandler, SensorConnection};
use crate::error::{ConnectionError, ManagerError};
use crate::handshake;
use crate::sync_source::SyncSource;
use crate::task_tracker::TaskTracker;
use crate::ticker::LivenessTicker;
use crate::upgrade::{
    next_error, BasicUpgradeCoordinatorFactory, UpgradeCoordinator, UpgradeCoordinatorFactory,
    UpgradeProgress,
};
use sensorhub_proto::{CapabilitySet, HubMessage};
use sensorhub_transport::IncomingStream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TICKER_TASK: &str = "liveness-ticker";

#[derive(Default)]
struct ClusterEntry {
    connection: Option<Arc<SensorConnection>>,
    upgrade: Option<Arc<dyn UpgradeCoordinator>>,
}

/// Tracks the live connection and upgrade coordinator of every cluster.
///
/// The registry lock is never held while talking to a sensor or to the
/// cluster store. Handing a connection to its upgrade coordinator happens
/// under the lock so the coordinator always ends up with the registered
/// connection.
pub struct ConnectionManager {
    config: ManagerConfig,
    capabilities: CapabilitySet,
    cluster_manager: Arc<dyn ClusterManager>,
    authorizer: Arc<dyn WriteAuthorizer>,
    sync_source: Arc<dyn SyncSource>,
    upgrade_factory: Arc<dyn UpgradeCoordinatorFactory>,
    inbound_handler: Option<Arc<dyn InboundHandler>>,
    clusters: RwLock<HashMap<String, ClusterEntry>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ManagerConfig,
        cluster_manager: Arc<dyn ClusterManager>,
        authorizer: Arc<dyn WriteAuthorizer>,
        sync_source: Arc<dyn SyncSource>,
    ) -> Self {
        let upgrade_factory = Arc::new(BasicUpgradeCoordinatorFactory::new(
            config.upgrade_target_version.clone(),
        ));
        Self {
            config,
            capabilities: CapabilitySet::all(),
            cluster_manager,
            authorizer,
            sync_source,
            upgrade_factory,
            inbound_handler: None,
            clusters: RwLock::new(HashMap::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_upgrade_factory(mut self, factory: Arc<dyn UpgradeCoordinatorFactory>) -> Self {
        self.upgrade_factory = factory;
        self
    }

    pub fn with_inbound_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.inbound_handler = Some(handler);
        self
    }

    /// Capabilities central announces to sensors
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Create eager upgrade coordinators if configured and start the
    /// liveness ticker
    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }

        if self.config.upgrades_enabled && self.config.eager_upgrade_handles {
            let clusters = self.cluster_manager.get_clusters().await?;
            let mut map = self.clusters.write().await;
            for cluster in &clusters {
                let entry = map.entry(cluster.id.clone()).or_default();
                if entry.upgrade.is_none() {
                    entry.upgrade = Some(self.upgrade_factory.create(&cluster.id));
                }
            }
            info!("Created upgrade coordinators for {} clusters", clusters.len());
        }

        let ticker = LivenessTicker::new(
            Arc::downgrade(self),
            self.cluster_manager.clone(),
            self.config.contact_interval,
            self.shutdown.child_token(),
        );
        self.tasks.register(TICKER_TASK, tokio::spawn(ticker.run()));
        info!(
            upgrades_enabled = self.config.upgrades_enabled,
            contact_interval = ?self.config.contact_interval,
            "Connection manager started"
        );
        Ok(())
    }

    pub async fn get_connection(&self, cluster_id: &str) -> Option<Arc<SensorConnection>> {
        self.clusters
            .read()
            .await
            .get(cluster_id)
            .and_then(|entry| entry.connection.clone())
    }

    /// Snapshot of every registered connection
    pub async fn get_active_connections(&self) -> Vec<Arc<SensorConnection>> {
        self.clusters
            .read()
            .await
            .values()
            .filter_map(|entry| entry.connection.clone())
            .collect()
    }

    /// Install `connection` as the cluster's connection and return the one it
    /// displaced. The displaced connection is not terminated here.
    pub async fn replace_connection(
        &self,
        cluster_id: &str,
        connection: Arc<SensorConnection>,
    ) -> Result<Option<Arc<SensorConnection>>, ManagerError> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }

        let mut clusters = self.clusters.write().await;
        let entry = clusters.entry(cluster_id.to_string()).or_default();
        let old = entry.connection.replace(Arc::clone(&connection));

        if self.config.upgrades_enabled && entry.upgrade.is_none() {
            let upgrade = self.upgrade_factory.create(cluster_id);
            self.watch_upgrade_errors(cluster_id, upgrade.as_ref(), &connection);
            entry.upgrade = Some(upgrade);
        }

        let replaced = old.as_ref().map(|conn| conn.id());
        debug!(
            cluster_id = %cluster_id,
            connection_id = %connection.id(),
            replaced = ?replaced,
            "Registered connection"
        );
        Ok(old)
    }

    /// Run the handshake on `incoming`, register the resulting connection and
    /// serve it until it terminates
    pub async fn handle_connection(
        &self,
        cluster_id: &str,
        incoming: IncomingStream,
    ) -> Result<(), ManagerError> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::ShuttingDown);
        }

        let (stream, summary) = handshake::respond(
            incoming,
            cluster_id,
            &self.capabilities,
            self.config.accept_managed_config,
            self.sync_source.as_ref(),
        )
        .await
        .map_err(|source| ManagerError::Handshake {
            cluster_id: cluster_id.to_string(),
            source,
        })?;

        let connection = Arc::new(SensorConnection::new(
            cluster_id,
            stream,
            summary.capabilities,
            self.config.outbound_queue_capacity,
            self.inbound_handler.clone(),
        ));

        if let Some(old) = self.replace_connection(cluster_id, connection.clone()).await? {
            info!(
                cluster_id = %cluster_id,
                old_connection = %old.id(),
                new_connection = %connection.id(),
                "Sensor reconnected, replacing previous connection"
            );
            old.terminate(ConnectionError::Replaced);
        }

        self.register_for_upgrades(cluster_id, &connection).await;

        let reason = connection.run().await;
        self.clear_connection(cluster_id, &connection).await;

        if reason.is_graceful() {
            Ok(())
        } else {
            Err(ManagerError::Connection {
                cluster_id: cluster_id.to_string(),
                source: reason,
            })
        }
    }

    /// Start an upgrade of a cluster's sensor on behalf of `ctx`.
    ///
    /// Authorization is checked before the cluster is looked up.
    pub async fn trigger_upgrade(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<String, ManagerError> {
        if !self.authorizer.write_allowed(ctx, cluster_id).await? {
            warn!(
                principal = %ctx.principal,
                cluster_id = %cluster_id,
                "Upgrade trigger denied"
            );
            return Err(ManagerError::PermissionDenied(cluster_id.to_string()));
        }

        let upgrade = self
            .upgrade_coordinator(cluster_id)
            .await
            .ok_or_else(|| ManagerError::UnknownCluster(cluster_id.to_string()))?;
        Ok(upgrade.trigger().await?)
    }

    /// Forward an upgrader's progress report to the cluster's coordinator,
    /// creating the coordinator if this is the first time it is needed
    pub async fn record_upgrade_progress(
        &self,
        cluster_id: &str,
        process_id: &str,
        progress: UpgradeProgress,
    ) -> Result<(), ManagerError> {
        if !self.config.upgrades_enabled {
            return Err(ManagerError::UpgradesDisabled);
        }

        let upgrade = {
            let mut clusters = self.clusters.write().await;
            let entry = clusters.entry(cluster_id.to_string()).or_default();
            match entry.upgrade.clone() {
                Some(upgrade) => upgrade,
                None => {
                    let upgrade = self.upgrade_factory.create(cluster_id);
                    if let Some(connection) = &entry.connection {
                        upgrade.register_connection(Arc::clone(connection)).await;
                        self.watch_upgrade_errors(cluster_id, upgrade.as_ref(), connection);
                    }
                    entry.upgrade = Some(Arc::clone(&upgrade));
                    upgrade
                }
            }
        };

        upgrade.record_upgrade_progress(process_id, progress)?;
        Ok(())
    }

    /// Queue a message on the cluster's live connection
    pub async fn send_to_cluster(
        &self,
        cluster_id: &str,
        message: HubMessage,
    ) -> Result<(), ManagerError> {
        let connection = self
            .get_connection(cluster_id)
            .await
            .ok_or_else(|| ManagerError::UnknownCluster(cluster_id.to_string()))?;
        connection
            .send(message)
            .await
            .map_err(|source| ManagerError::Connection {
                cluster_id: cluster_id.to_string(),
                source,
            })
    }

    /// Forget a cluster entirely, terminating its connection
    pub async fn remove_cluster(&self, cluster_id: &str) -> bool {
        let removed = self.clusters.write().await.remove(cluster_id);
        self.tasks.unregister(&observer_key(cluster_id));

        match removed {
            Some(entry) => {
                if let Some(connection) = entry.connection {
                    connection.terminate(ConnectionError::ClusterRemoved);
                }
                info!(cluster_id = %cluster_id, "Removed cluster");
                true
            }
            None => false,
        }
    }

    /// Stop the ticker and terminate every connection
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let connections = self.get_active_connections().await;
        info!("Shutting down connection manager ({} connections)", connections.len());
        for connection in &connections {
            connection.terminate(ConnectionError::Shutdown);
        }
        self.tasks.abort_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn upgrade_coordinator(&self, cluster_id: &str) -> Option<Arc<dyn UpgradeCoordinator>> {
        self.clusters
            .read()
            .await
            .get(cluster_id)
            .and_then(|entry| entry.upgrade.clone())
    }

    /// Background tasks still running (ticker and upgrade observers)
    pub fn background_tasks(&self) -> usize {
        self.tasks.running()
    }

    // Only clears the entry if it still points at `connection`; a newer
    // connection may already have taken its place.
    async fn clear_connection(&self, cluster_id: &str, connection: &Arc<SensorConnection>) {
        let mut clusters = self.clusters.write().await;
        let Some(entry) = clusters.get_mut(cluster_id) else {
            return;
        };

        match &entry.connection {
            Some(current) if Arc::ptr_eq(current, connection) => {
                entry.connection = None;
                debug!(
                    cluster_id = %cluster_id,
                    connection_id = %connection.id(),
                    "Cleared connection"
                );
            }
            _ => debug!(
                cluster_id = %cluster_id,
                connection_id = %connection.id(),
                "Connection already replaced, leaving entry alone"
            ),
        }
    }

    // Holds the read lock across registration so a replacement cannot slip
    // in between the check and the call; a superseded connection never
    // overwrites its successor in the coordinator.
    async fn register_for_upgrades(&self, cluster_id: &str, connection: &Arc<SensorConnection>) {
        let clusters = self.clusters.read().await;
        let Some(entry) = clusters.get(cluster_id) else {
            return;
        };
        let Some(upgrade) = &entry.upgrade else {
            return;
        };

        match &entry.connection {
            Some(current) if Arc::ptr_eq(current, connection) => {
                upgrade.register_connection(Arc::clone(connection)).await;
            }
            _ => debug!(
                cluster_id = %cluster_id,
                connection_id = %connection.id(),
                "Connection superseded before upgrade registration, skipping"
            ),
        }
    }

    // The observer only ever terminates the connection it was given, and
    // exits once that connection is stopping.
    fn watch_upgrade_errors(
        &self,
        cluster_id: &str,
        upgrade: &dyn UpgradeCoordinator,
        connection: &Arc<SensorConnection>,
    ) {
        let mut signal = upgrade.error_signal();
        let connection = Arc::clone(connection);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = connection.wait_stop_requested() => {}
                error = next_error(&mut signal) => {
                    if let Some(error) = error {
                        connection.terminate(ConnectionError::UpgradeFailed(error));
                    }
                }
            }
        });
        self.tasks.register(observer_key(cluster_id), handle);
    }
}

fn observer_key(cluster_id: &str) -> String {
    format!("upgrade-observer/{}", cluster_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AllowAll, StaticAuthorizer};
    use crate::cluster::{Cluster, InMemoryClusterManager};
    use crate::sync_source::StaticSyncSource;
    use crate::upgrade::UpgradeStage;
    use sensorhub_proto::{Compression, StreamMetadata};
    use sensorhub_transport::{memory, HubStream};

    fn manager(config: ManagerConfig) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(
            config,
            Arc::new(InMemoryClusterManager::with_clusters([
                Cluster::new("c1", "prod"),
                Cluster::new("c2", "staging"),
            ])),
            Arc::new(AllowAll),
            Arc::new(StaticSyncSource::new()),
        ))
    }

    fn connection(cluster_id: &str) -> (Arc<SensorConnection>, HubStream) {
        let (sensor, central) =
            memory::duplex(StreamMetadata::new(), StreamMetadata::new(), Compression::Gzip);
        let conn = SensorConnection::new(cluster_id, central, CapabilitySet::all(), 8, None);
        (Arc::new(conn), sensor)
    }

    #[tokio::test]
    async fn test_replace_returns_previous() {
        let manager = manager(ManagerConfig::default());
        let (first, _s1) = connection("c1");
        let (second, _s2) = connection("c1");

        let old = manager.replace_connection("c1", first.clone()).await.unwrap();
        assert!(old.is_none());

        let old = manager.replace_connection("c1", second.clone()).await.unwrap();
        assert!(Arc::ptr_eq(&old.unwrap(), &first));
        assert!(Arc::ptr_eq(
            &manager.get_connection("c1").await.unwrap(),
            &second
        ));
        assert!(!first.is_stop_requested());
    }

    #[tokio::test]
    async fn test_stale_clear_leaves_newer_connection() {
        let manager = manager(ManagerConfig::default());
        let (first, _s1) = connection("c1");
        let (second, _s2) = connection("c1");

        manager.replace_connection("c1", first.clone()).await.unwrap();
        manager.replace_connection("c1", second.clone()).await.unwrap();

        manager.clear_connection("c1", &first).await;
        assert!(Arc::ptr_eq(
            &manager.get_connection("c1").await.unwrap(),
            &second
        ));

        manager.clear_connection("c1", &second).await;
        assert!(manager.get_connection("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_active_connections_snapshot() {
        let manager = manager(ManagerConfig::default());
        let (a, _sa) = connection("c1");
        let (b, _sb) = connection("c2");
        manager.replace_connection("c1", a.clone()).await.unwrap();
        manager.replace_connection("c2", b.clone()).await.unwrap();

        let mut ids: Vec<_> = manager
            .get_active_connections()
            .await
            .iter()
            .map(|conn| conn.cluster_id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["c1", "c2"]);

        manager.clear_connection("c1", &a).await;
        let active = manager.get_active_connections().await;
        assert_eq!(active.len(), 1);
        assert!(Arc::ptr_eq(&active[0], &b));
    }

    #[tokio::test]
    async fn test_upgrade_coordinator_created_lazily() {
        let manager = manager(ManagerConfig::default().with_upgrades(true));
        assert!(manager.upgrade_coordinator("c1").await.is_none());

        let (conn, _sensor) = connection("c1");
        manager.replace_connection("c1", conn).await.unwrap();
        let first = manager.upgrade_coordinator("c1").await.unwrap();

        let (conn, _sensor) = connection("c1");
        manager.replace_connection("c1", conn).await.unwrap();
        let second = manager.upgrade_coordinator("c1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_no_coordinator_when_upgrades_disabled() {
        let manager = manager(ManagerConfig::default());
        let (conn, _sensor) = connection("c1");
        manager.replace_connection("c1", conn).await.unwrap();

        assert!(manager.upgrade_coordinator("c1").await.is_none());
        let err = manager
            .trigger_upgrade(&RequestContext::new("admin"), "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::UnknownCluster(_)));

        let err = manager
            .record_upgrade_progress("c1", "p1", UpgradeProgress::new(UpgradeStage::Executing, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::UpgradesDisabled));
    }

    #[tokio::test]
    async fn test_eager_coordinators_on_start() {
        let manager = manager(
            ManagerConfig::default()
                .with_upgrades(true)
                .with_eager_upgrade_handles(true),
        );
        manager.start().await.unwrap();

        assert!(manager.upgrade_coordinator("c1").await.is_some());
        assert!(manager.upgrade_coordinator("c2").await.is_some());
        assert!(manager.get_connection("c1").await.is_none());
        assert!(manager.get_active_connections().await.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_permission_checked_before_cluster_lookup() {
        let manager = Arc::new(ConnectionManager::new(
            ManagerConfig::default().with_upgrades(true),
            Arc::new(InMemoryClusterManager::new()),
            Arc::new(StaticAuthorizer::new().allow("alice", "c1")),
            Arc::new(StaticSyncSource::new()),
        ));

        let err = manager
            .trigger_upgrade(&RequestContext::new("bob"), "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::PermissionDenied(_)));

        let err = manager
            .trigger_upgrade(&RequestContext::new("alice"), "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::UnknownCluster(_)));
        assert!(manager.upgrade_coordinator("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_progress_creates_coordinator_on_demand() {
        let manager = manager(ManagerConfig::default().with_upgrades(true));

        let err = manager
            .record_upgrade_progress("c1", "p1", UpgradeProgress::new(UpgradeStage::Executing, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Upgrade(_)));
        assert!(manager.upgrade_coordinator("c1").await.is_some());
    }

    #[tokio::test]
    async fn test_send_to_cluster() {
        let manager = manager(ManagerConfig::default());
        let err = manager
            .send_to_cluster("c1", HubMessage::Ping { timestamp: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::UnknownCluster(_)));

        let (conn, mut sensor) = connection("c1");
        manager.replace_connection("c1", conn.clone()).await.unwrap();
        let task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.run().await }
        });

        manager
            .send_to_cluster("c1", HubMessage::Ping { timestamp: 2 })
            .await
            .unwrap();
        assert_eq!(
            sensor.recv_message().await.unwrap(),
            Some(HubMessage::Ping { timestamp: 2 })
        );

        conn.terminate(ConnectionError::Shutdown);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_cluster_terminates_connection() {
        let manager = manager(ManagerConfig::default().with_upgrades(true));
        let (conn, _sensor) = connection("c1");
        manager.replace_connection("c1", conn.clone()).await.unwrap();

        assert!(manager.remove_cluster("c1").await);
        assert!(!manager.remove_cluster("c1").await);
        assert_eq!(conn.stop_reason(), Some(&ConnectionError::ClusterRemoved));
        assert!(manager.get_connection("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_connections() {
        let manager = manager(ManagerConfig::default());
        let (first, _s1) = connection("c1");
        manager.replace_connection("c1", first.clone()).await.unwrap();

        manager.shutdown().await;
        assert_eq!(first.stop_reason(), Some(&ConnectionError::Shutdown));

        let (second, _s2) = connection("c1");
        let err = manager.replace_connection("c1", second).await.unwrap_err();
        assert!(matches!(err, ManagerError::ShuttingDown));
    }
}
