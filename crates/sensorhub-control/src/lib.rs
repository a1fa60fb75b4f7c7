//! Control plane for sensor connections
//!
//! [`ConnectionManager`] keeps at most one live [`SensorConnection`] per
//! cluster, replaces it when the sensor reconnects, and owns the per-cluster
//! upgrade coordinators that outlive individual connections.
pub mod auth;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod manager;
pub mod sync_source;
pub mod task_tracker;
pub mod ticker;
pub mod upgrade;

pub use auth::{AllowAll, AuthorizationError, RequestContext, StaticAuthorizer, WriteAuthorizer};
pub use cluster::{Cluster, ClusterManager, ClusterStoreError, InMemoryClusterManager};
pub use config::ManagerConfig;
pub use connection::{InboundHandler, SensorConnection};
pub use error::{ConnectionError, ManagerError};
pub use handshake::{HandshakeError, HandshakeSummary};
pub use manager::ConnectionManager;
pub use sync_source::{StaticSyncSource, SyncError, SyncSource};
pub use task_tracker::TaskTracker;
pub use ticker::LivenessTicker;
pub use upgrade::{
    BasicUpgradeCoordinator, BasicUpgradeCoordinatorFactory, UpgradeCoordinator,
    UpgradeCoordinatorFactory, UpgradeError, UpgradeProgress, UpgradeStage,
};
