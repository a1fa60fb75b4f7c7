//! Per-cluster sensor upgrade coordination
//!
//! A coordinator is created once per cluster and outlives individual
//! connections. The manager hands it each new connection through
//! [`UpgradeCoordinator::register_connection`]. Fatal upgrade failures are
//! published on [`UpgradeCoordinator::error_signal`].

use crate::connection::SensorConnection;
use crate::error::ConnectionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sensorhub_proto::{Capability, HubMessage};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("No live connection to cluster {0}")]
    NoConnection(String),

    #[error("Sensor of cluster {0} does not support upgrades")]
    Unsupported(String),

    #[error("Upgrade {0} is still in progress")]
    InProgress(String),

    #[error("Unknown upgrade process {0}")]
    UnknownProcess(String),

    #[error("Failed to send upgrade trigger: {0}")]
    Send(#[source] ConnectionError),

    #[error("Coordinator state unavailable")]
    StatePoisoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeStage {
    Triggered,
    Preflight,
    Executing,
    Complete,
    Failed,
}

impl UpgradeStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UpgradeStage::Complete | UpgradeStage::Failed)
    }
}

/// Progress report from an upgrader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeProgress {
    pub stage: UpgradeStage,
    #[serde(default)]
    pub detail: String,
}

impl UpgradeProgress {
    pub fn new(stage: UpgradeStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}

/// One upgrade attempt for a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeProcess {
    pub process_id: String,
    pub target_version: String,
    pub started_at: DateTime<Utc>,
    pub progress: UpgradeProgress,
}

#[async_trait]
pub trait UpgradeCoordinator: Send + Sync + Debug {
    fn cluster_id(&self) -> &str;

    /// Make `connection` the target of future upgrade triggers
    async fn register_connection(&self, connection: Arc<SensorConnection>);

    /// Start an upgrade of the cluster's sensor
    async fn trigger(&self) -> Result<String, UpgradeError>;

    fn record_upgrade_progress(
        &self,
        process_id: &str,
        progress: UpgradeProgress,
    ) -> Result<(), UpgradeError>;

    /// Carries `Some(reason)` once an upgrade has failed fatally
    fn error_signal(&self) -> watch::Receiver<Option<String>>;
}

pub trait UpgradeCoordinatorFactory: Send + Sync + Debug {
    fn create(&self, cluster_id: &str) -> Arc<dyn UpgradeCoordinator>;
}

#[derive(Default)]
struct CoordinatorState {
    connection: Option<Arc<SensorConnection>>,
    active: Option<UpgradeProcess>,
    history: Vec<UpgradeProcess>,
}

/// Sends upgrade triggers over the registered connection and tracks progress
pub struct BasicUpgradeCoordinator {
    cluster_id: String,
    target_version: String,
    state: Mutex<CoordinatorState>,
    error_tx: watch::Sender<Option<String>>,
}

impl BasicUpgradeCoordinator {
    pub fn new(cluster_id: impl Into<String>, target_version: impl Into<String>) -> Self {
        let (error_tx, _) = watch::channel(None);
        Self {
            cluster_id: cluster_id.into(),
            target_version: target_version.into(),
            state: Mutex::new(CoordinatorState::default()),
            error_tx,
        }
    }

    pub fn active_process(&self) -> Option<UpgradeProcess> {
        self.state.lock().ok().and_then(|state| state.active.clone())
    }

    /// Finished upgrade attempts, oldest first
    pub fn history(&self) -> Vec<UpgradeProcess> {
        self.state
            .lock()
            .map(|state| state.history.clone())
            .unwrap_or_default()
    }

    pub fn registered_connection(&self) -> Option<Arc<SensorConnection>> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.connection.clone())
    }
}

#[async_trait]
impl UpgradeCoordinator for BasicUpgradeCoordinator {
    fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    async fn register_connection(&self, connection: Arc<SensorConnection>) {
        if let Ok(mut state) = self.state.lock() {
            state.connection = Some(connection);
        }
    }

    async fn trigger(&self) -> Result<String, UpgradeError> {
        let (connection, process) = {
            let mut state = self.state.lock().map_err(|_| UpgradeError::StatePoisoned)?;

            let connection = state
                .connection
                .clone()
                .filter(|conn| !conn.is_stop_requested())
                .ok_or_else(|| UpgradeError::NoConnection(self.cluster_id.clone()))?;
            if !connection.has_capability(Capability::SensorUpgrades) {
                return Err(UpgradeError::Unsupported(self.cluster_id.clone()));
            }
            if let Some(active) = &state.active {
                if !active.progress.stage.is_terminal() {
                    return Err(UpgradeError::InProgress(active.process_id.clone()));
                }
            }

            let process = UpgradeProcess {
                process_id: Uuid::new_v4().to_string(),
                target_version: self.target_version.clone(),
                started_at: Utc::now(),
                progress: UpgradeProgress::new(UpgradeStage::Triggered, ""),
            };
            if let Some(previous) = state.active.replace(process.clone()) {
                state.history.push(previous);
            }
            (connection, process)
        };

        connection
            .send(HubMessage::UpgradeTrigger {
                process_id: process.process_id.clone(),
                target_version: process.target_version.clone(),
            })
            .await
            .map_err(UpgradeError::Send)?;

        info!(
            cluster_id = %self.cluster_id,
            process_id = %process.process_id,
            target_version = %process.target_version,
            "Triggered sensor upgrade"
        );
        Ok(process.process_id)
    }

    fn record_upgrade_progress(
        &self,
        process_id: &str,
        progress: UpgradeProgress,
    ) -> Result<(), UpgradeError> {
        let mut state = self.state.lock().map_err(|_| UpgradeError::StatePoisoned)?;
        let active = state
            .active
            .as_mut()
            .filter(|active| active.process_id == process_id)
            .ok_or_else(|| UpgradeError::UnknownProcess(process_id.to_string()))?;

        info!(
            cluster_id = %self.cluster_id,
            process_id = %process_id,
            stage = ?progress.stage,
            "Upgrade progress: {}",
            progress.detail
        );

        let failure = (progress.stage == UpgradeStage::Failed).then(|| progress.detail.clone());
        active.progress = progress;
        drop(state);

        if let Some(detail) = failure {
            warn!(cluster_id = %self.cluster_id, "Sensor upgrade failed: {}", detail);
            self.error_tx.send_replace(Some(detail));
        }
        Ok(())
    }

    fn error_signal(&self) -> watch::Receiver<Option<String>> {
        self.error_tx.subscribe()
    }
}

impl Debug for BasicUpgradeCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicUpgradeCoordinator")
            .field("cluster_id", &self.cluster_id)
            .field("target_version", &self.target_version)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BasicUpgradeCoordinatorFactory {
    target_version: String,
}

impl BasicUpgradeCoordinatorFactory {
    pub fn new(target_version: impl Into<String>) -> Self {
        Self {
            target_version: target_version.into(),
        }
    }
}

impl UpgradeCoordinatorFactory for BasicUpgradeCoordinatorFactory {
    fn create(&self, cluster_id: &str) -> Arc<dyn UpgradeCoordinator> {
        Arc::new(BasicUpgradeCoordinator::new(
            cluster_id,
            self.target_version.clone(),
        ))
    }
}

/// Resolve once the signal carries an error. Returns `None` if the
/// coordinator went away without reporting one.
pub(crate) async fn next_error(signal: &mut watch::Receiver<Option<String>>) -> Option<String> {
    loop {
        if let Some(error) = signal.borrow_and_update().clone() {
            return Some(error);
        }
        if signal.changed().await.is_err() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorhub_proto::{CapabilitySet, Compression, StreamMetadata};
    use sensorhub_transport::{memory, HubStream};

    fn connection(capabilities: CapabilitySet) -> (Arc<SensorConnection>, HubStream) {
        let (sensor, central) =
            memory::duplex(StreamMetadata::new(), StreamMetadata::new(), Compression::Gzip);
        let conn = SensorConnection::new("c1", central, capabilities, 8, None);
        (Arc::new(conn), sensor)
    }

    #[tokio::test]
    async fn test_trigger_requires_connection() {
        let coordinator = BasicUpgradeCoordinator::new("c1", "2.0.0");
        let err = coordinator.trigger().await.unwrap_err();
        assert!(matches!(err, UpgradeError::NoConnection(_)));
    }

    #[tokio::test]
    async fn test_trigger_requires_capability() {
        let coordinator = BasicUpgradeCoordinator::new("c1", "2.0.0");
        let (conn, _sensor) = connection(CapabilitySet::new());
        coordinator.register_connection(conn).await;

        let err = coordinator.trigger().await.unwrap_err();
        assert!(matches!(err, UpgradeError::Unsupported(_)));
        assert!(coordinator.active_process().is_none());
    }

    #[tokio::test]
    async fn test_trigger_sends_upgrade_message() {
        let coordinator = BasicUpgradeCoordinator::new("c1", "2.0.0");
        let (conn, mut sensor) = connection(CapabilitySet::all());
        coordinator.register_connection(conn.clone()).await;
        let task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.run().await }
        });

        let process_id = coordinator.trigger().await.unwrap();
        match sensor.recv_message().await.unwrap() {
            Some(HubMessage::UpgradeTrigger {
                process_id: sent,
                target_version,
            }) => {
                assert_eq!(sent, process_id);
                assert_eq!(target_version, "2.0.0");
            }
            other => panic!("Expected UpgradeTrigger, got {:?}", other),
        }

        let err = coordinator.trigger().await.unwrap_err();
        assert!(matches!(err, UpgradeError::InProgress(_)));

        conn.terminate(ConnectionError::Shutdown);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_progress_raises_error_signal() {
        let coordinator = BasicUpgradeCoordinator::new("c1", "2.0.0");
        let (conn, _sensor) = connection(CapabilitySet::all());
        coordinator.register_connection(conn).await;
        let mut signal = coordinator.error_signal();

        let process_id = coordinator.trigger().await.unwrap();
        coordinator
            .record_upgrade_progress(&process_id, UpgradeProgress::new(UpgradeStage::Preflight, ""))
            .unwrap();
        assert!(signal.borrow().is_none());

        coordinator
            .record_upgrade_progress(
                &process_id,
                UpgradeProgress::new(UpgradeStage::Failed, "image pull failed"),
            )
            .unwrap();
        assert_eq!(next_error(&mut signal).await.as_deref(), Some("image pull failed"));

        let retry = coordinator.trigger().await.unwrap();
        assert_ne!(retry, process_id);
        assert_eq!(coordinator.history().len(), 1);
    }

    #[tokio::test]
    async fn test_progress_for_unknown_process() {
        let coordinator = BasicUpgradeCoordinator::new("c1", "2.0.0");
        let err = coordinator
            .record_upgrade_progress("nope", UpgradeProgress::new(UpgradeStage::Executing, ""))
            .unwrap_err();
        assert!(matches!(err, UpgradeError::UnknownProcess(_)));
    }

    #[tokio::test]
    async fn test_next_error_ends_when_coordinator_dropped() {
        let coordinator = BasicUpgradeCoordinator::new("c1", "2.0.0");
        let mut signal = coordinator.error_signal();
        drop(coordinator);
        assert_eq!(next_error(&mut signal).await, None);
    }
}
