//! Local state a sensor applies the handshake payloads to

use async_trait::async_trait;
use sensorhub_proto::{ClusterConfig, NetworkBaselineSync, PolicySync};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives the payloads delivered by central
#[async_trait]
pub trait SensorState: Send + Sync {
    async fn apply_cluster_config(&self, config: &ClusterConfig) -> Result<(), StateError>;

    async fn apply_policies(&self, sync: &PolicySync) -> Result<(), StateError>;

    async fn apply_baselines(&self, sync: &NetworkBaselineSync) -> Result<(), StateError>;

    /// Start an upgrade requested by central
    async fn start_upgrade(&self, process_id: &str, target_version: &str)
        -> Result<(), StateError>;
}

/// Snapshot of everything a sensor has been told
#[derive(Debug, Clone, Default)]
pub struct AppliedState {
    pub cluster_config: Option<ClusterConfig>,
    pub policies: Option<PolicySync>,
    pub baselines: Option<NetworkBaselineSync>,
    /// (process id, target version) of every upgrade trigger received
    pub upgrades: Vec<(String, String)>,
    /// Number of completed config applications (one per handshake)
    pub config_applications: usize,
}

/// Sensor state kept in memory
#[derive(Debug, Default)]
pub struct InMemorySensorState {
    applied: Mutex<AppliedState>,
}

impl InMemorySensorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> AppliedState {
        self.applied
            .lock()
            .map(|applied| applied.clone())
            .unwrap_or_default()
    }

    fn update(&self, f: impl FnOnce(&mut AppliedState)) -> Result<(), StateError> {
        let mut applied = self
            .applied
            .lock()
            .map_err(|_| StateError::Rejected("sensor state lock poisoned".to_string()))?;
        f(&mut applied);
        Ok(())
    }
}

#[async_trait]
impl SensorState for InMemorySensorState {
    async fn apply_cluster_config(&self, config: &ClusterConfig) -> Result<(), StateError> {
        if config.cluster_id.is_empty() {
            return Err(StateError::Rejected(
                "cluster config without cluster id".to_string(),
            ));
        }
        self.update(|applied| {
            applied.cluster_config = Some(config.clone());
            applied.config_applications += 1;
        })
    }

    async fn apply_policies(&self, sync: &PolicySync) -> Result<(), StateError> {
        self.update(|applied| applied.policies = Some(sync.clone()))
    }

    async fn apply_baselines(&self, sync: &NetworkBaselineSync) -> Result<(), StateError> {
        self.update(|applied| applied.baselines = Some(sync.clone()))
    }

    async fn start_upgrade(
        &self,
        process_id: &str,
        target_version: &str,
    ) -> Result<(), StateError> {
        self.update(|applied| {
            applied
                .upgrades
                .push((process_id.to_string(), target_version.to_string()))
        })
    }
}
