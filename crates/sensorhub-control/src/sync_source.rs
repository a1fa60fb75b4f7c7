//! Source of the state pushed to a sensor during the handshake

use async_trait::async_trait;
use sensorhub_proto::{
    ClusterConfig, ClusterSettings, ManagedConfigInit, ManagerType, NetworkBaseline,
    NetworkBaselineSync, Policy, PolicySync,
};
use std::collections::HashMap;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Managed config claims cluster id {claimed}, but the stream belongs to {actual}")]
    ClusterIdMismatch { claimed: String, actual: String },

    #[error("Sync source unavailable: {0}")]
    Unavailable(String),
}

/// Supplies cluster config, policies and baselines for one cluster
#[async_trait]
pub trait SyncSource: Send + Sync + Debug {
    /// Effective config for the cluster. `managed` is the configuration the
    /// sensor pushed, if any.
    async fn cluster_config(
        &self,
        cluster_id: &str,
        managed: Option<&ManagedConfigInit>,
    ) -> Result<ClusterConfig, SyncError>;

    async fn policies(&self, cluster_id: &str) -> Result<PolicySync, SyncError>;

    async fn baselines(&self, cluster_id: &str) -> Result<NetworkBaselineSync, SyncError>;
}

/// Serves the same settings and policies to every cluster
#[derive(Debug, Clone, Default)]
pub struct StaticSyncSource {
    settings: ClusterSettings,
    policies: Vec<Policy>,
    baselines: HashMap<String, Vec<NetworkBaseline>>,
}

impl StaticSyncSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(mut self, settings: ClusterSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn with_baseline(mut self, cluster_id: impl Into<String>, baseline: NetworkBaseline) -> Self {
        self.baselines
            .entry(cluster_id.into())
            .or_default()
            .push(baseline);
        self
    }
}

#[async_trait]
impl SyncSource for StaticSyncSource {
    async fn cluster_config(
        &self,
        cluster_id: &str,
        managed: Option<&ManagedConfigInit>,
    ) -> Result<ClusterConfig, SyncError> {
        match managed {
            Some(init) => {
                if let Some(claimed) = init.cluster_id.as_deref() {
                    if claimed != cluster_id {
                        return Err(SyncError::ClusterIdMismatch {
                            claimed: claimed.to_string(),
                            actual: cluster_id.to_string(),
                        });
                    }
                }
                Ok(ClusterConfig {
                    cluster_id: cluster_id.to_string(),
                    cluster_name: init.cluster_name.clone(),
                    managed_by: init.managed_by,
                    settings: init.settings.clone(),
                })
            }
            None => Ok(ClusterConfig {
                cluster_id: cluster_id.to_string(),
                cluster_name: cluster_id.to_string(),
                managed_by: ManagerType::Manual,
                settings: self.settings.clone(),
            }),
        }
    }

    async fn policies(&self, _cluster_id: &str) -> Result<PolicySync, SyncError> {
        Ok(PolicySync {
            policies: self.policies.clone(),
        })
    }

    async fn baselines(&self, cluster_id: &str) -> Result<NetworkBaselineSync, SyncError> {
        Ok(NetworkBaselineSync {
            baselines: self.baselines.get(cluster_id).cloned().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sensorhub_proto::CollectionMethod;

    #[tokio::test]
    async fn test_managed_config_wins() {
        let source = StaticSyncSource::new();
        let init = ManagedConfigInit {
            cluster_name: "edge".to_string(),
            cluster_id: Some("c1".to_string()),
            managed_by: ManagerType::Helm,
            settings: ClusterSettings {
                collection_method: CollectionMethod::KernelModule,
                ..Default::default()
            },
        };

        let config = source.cluster_config("c1", Some(&init)).await.unwrap();
        assert_eq!(config.cluster_name, "edge");
        assert_eq!(config.managed_by, ManagerType::Helm);
        assert_eq!(config.settings.collection_method, CollectionMethod::KernelModule);
    }

    #[tokio::test]
    async fn test_managed_config_for_other_cluster_rejected() {
        let source = StaticSyncSource::new();
        let init = ManagedConfigInit {
            cluster_name: "edge".to_string(),
            cluster_id: Some("c2".to_string()),
            ..Default::default()
        };

        let err = source.cluster_config("c1", Some(&init)).await.unwrap_err();
        assert!(matches!(err, SyncError::ClusterIdMismatch { .. }));
    }

    #[tokio::test]
    async fn test_baselines_are_per_cluster() {
        let source = StaticSyncSource::new().with_baseline(
            "c1",
            NetworkBaseline {
                deployment_id: "web".to_string(),
                peers: vec!["db".to_string()],
                locked: true,
            },
        );

        assert_eq!(source.baselines("c1").await.unwrap().baselines.len(), 1);
        assert!(source.baselines("c2").await.unwrap().baselines.is_empty());
    }
}
