//! Cluster metadata store contract

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClusterStoreError {
    #[error("Cluster store unavailable: {0}")]
    Unavailable(String),

    #[error("Cluster {0} not found")]
    NotFound(String),
}

/// A monitored cluster known to the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub id: String,
    pub name: String,
}

impl Cluster {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Persistent store backing cluster metadata
#[async_trait]
pub trait ClusterManager: Send + Sync + Debug {
    async fn get_clusters(&self) -> Result<Vec<Cluster>, ClusterStoreError>;

    /// Record that the given clusters were in contact at `time`
    async fn update_cluster_contact_times(
        &self,
        time: DateTime<Utc>,
        cluster_ids: &[String],
    ) -> Result<(), ClusterStoreError>;
}

/// Cluster store held in memory
#[derive(Debug, Default)]
pub struct InMemoryClusterManager {
    clusters: RwLock<HashMap<String, Cluster>>,
    contact_times: RwLock<HashMap<String, DateTime<Utc>>>,
    updates: AtomicUsize,
    unavailable: AtomicBool,
}

impl InMemoryClusterManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clusters(clusters: impl IntoIterator<Item = Cluster>) -> Self {
        let manager = Self::new();
        for cluster in clusters {
            manager.add_cluster(cluster);
        }
        manager
    }

    pub fn add_cluster(&self, cluster: Cluster) {
        if let Ok(mut clusters) = self.clusters.write() {
            clusters.insert(cluster.id.clone(), cluster);
        }
    }

    pub fn contact_time(&self, cluster_id: &str) -> Option<DateTime<Utc>> {
        self.contact_times
            .read()
            .ok()
            .and_then(|times| times.get(cluster_id).copied())
    }

    /// Number of contact time updates received, failed ones included
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Make every call fail, as if the backing database were down
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), ClusterStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ClusterStoreError::Unavailable(
                "store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterManager for InMemoryClusterManager {
    async fn get_clusters(&self) -> Result<Vec<Cluster>, ClusterStoreError> {
        self.check_available()?;
        let clusters = self
            .clusters
            .read()
            .map_err(|_| ClusterStoreError::Unavailable("lock poisoned".to_string()))?;
        Ok(clusters.values().cloned().collect())
    }

    async fn update_cluster_contact_times(
        &self,
        time: DateTime<Utc>,
        cluster_ids: &[String],
    ) -> Result<(), ClusterStoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let mut times = self
            .contact_times
            .write()
            .map_err(|_| ClusterStoreError::Unavailable("lock poisoned".to_string()))?;
        for id in cluster_ids {
            times.insert(id.clone(), time);
        }
        debug!("Updated contact time for {} clusters", cluster_ids.len());
        Ok(())
    }
}
