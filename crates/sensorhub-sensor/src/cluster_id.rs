//! Persistence of the cluster identifier assigned by central
//!
//! A managed sensor may be reinstalled with a configuration that does not
//! carry the cluster id. The cached value lets it keep its identity.

use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

pub trait ClusterIdCache: Send + Sync + Debug {
    /// Previously stored cluster id, if any
    fn load(&self) -> io::Result<Option<String>>;

    fn store(&self, cluster_id: &str) -> io::Result<()>;
}

/// Cluster id stored in a single file
#[derive(Debug, Clone)]
pub struct FileClusterIdCache {
    path: PathBuf,
}

impl FileClusterIdCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ClusterIdCache for FileClusterIdCache {
    fn load(&self) -> io::Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                let id = contents.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn store(&self, cluster_id: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write-then-rename so a crash never leaves a truncated id behind
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, cluster_id)?;
        std::fs::rename(&tmp, &self.path)?;

        debug!("Cached cluster id {} at {}", cluster_id, self.path.display());
        Ok(())
    }
}

/// Cluster id kept in memory (tests, ephemeral sensors)
#[derive(Debug, Default)]
pub struct MemoryClusterIdCache {
    id: Mutex<Option<String>>,
    stores: Mutex<usize>,
}

impl MemoryClusterIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(cluster_id: impl Into<String>) -> Self {
        Self {
            id: Mutex::new(Some(cluster_id.into())),
            stores: Mutex::new(0),
        }
    }

    /// How many times `store` was called
    pub fn store_count(&self) -> usize {
        self.stores.lock().map(|count| *count).unwrap_or_default()
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "cluster id cache lock poisoned")
}

impl ClusterIdCache for MemoryClusterIdCache {
    fn load(&self) -> io::Result<Option<String>> {
        self.id.lock().map(|id| id.clone()).map_err(|_| poisoned())
    }

    fn store(&self, cluster_id: &str) -> io::Result<()> {
        *self.id.lock().map_err(|_| poisoned())? = Some(cluster_id.to_string());
        *self.stores.lock().map_err(|_| poisoned())? += 1;
        Ok(())
    }
}
