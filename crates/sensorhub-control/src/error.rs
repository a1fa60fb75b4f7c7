//! Error types of the control plane

use crate::auth::AuthorizationError;
use crate::cluster::ClusterStoreError;
use crate::handshake::HandshakeError;
use crate::upgrade::UpgradeError;
use thiserror::Error;

/// Why a connection stopped. Set once per connection; later reasons are ignored.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("replaced by a newer connection from the same cluster")]
    Replaced,

    #[error("upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("sensor disconnected: {0}")]
    PeerDisconnected(String),

    #[error("stream ended by sensor")]
    StreamEnded,

    #[error("cluster removed")]
    ClusterRemoved,

    #[error("control plane shutting down")]
    Shutdown,
}

impl ConnectionError {
    /// Endings that are not failures from the control plane's point of view
    pub fn is_graceful(&self) -> bool {
        matches!(
            self,
            ConnectionError::PeerDisconnected(_) | ConnectionError::Shutdown
        )
    }

    /// Whether the sensor should be told why its stream is closing
    pub(crate) fn notify_peer(&self) -> bool {
        !matches!(
            self,
            ConnectionError::PeerDisconnected(_)
                | ConnectionError::StreamEnded
                | ConnectionError::Transport(_)
        )
    }
}

/// Errors returned by [`crate::ConnectionManager`] operations
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Permission denied: not allowed to modify cluster {0}")]
    PermissionDenied(String),

    #[error("Unknown cluster {0}: it has never connected or upgrades are disabled")]
    UnknownCluster(String),

    #[error("Sensor upgrades are disabled")]
    UpgradesDisabled,

    #[error("Authorization check failed: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("Handshake with cluster {cluster_id} failed: {source}")]
    Handshake {
        cluster_id: String,
        #[source]
        source: HandshakeError,
    },

    #[error("Connection for cluster {cluster_id} ended: {source}")]
    Connection {
        cluster_id: String,
        #[source]
        source: ConnectionError,
    },

    #[error("Upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),

    #[error("Cluster store error: {0}")]
    ClusterStore(#[from] ClusterStoreError),

    #[error("Connection manager is shutting down")]
    ShuttingDown,
}
