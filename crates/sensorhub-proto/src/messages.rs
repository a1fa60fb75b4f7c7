//! Protocol message types

use serde::{Deserialize, Serialize};
use std::fmt;

/// Main sensor hub message enum
///
/// The same envelope travels in both directions. The first messages on every
/// stream form the handshake (`HelmManagedConfigInit`, `ClusterConfig`,
/// `PolicySync`, `NetworkBaselineSync`); everything else is operational
/// traffic that only flows once the handshake has completed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum HubMessage {
    // Handshake messages
    /// Sensor pushes its declaratively managed configuration (optional first message)
    HelmManagedConfigInit(ManagedConfigInit),
    /// Central answers with the effective cluster configuration
    ClusterConfig(ClusterConfig),
    /// Central pushes the full policy set
    PolicySync(PolicySync),
    /// Central pushes network baselines for the cluster
    NetworkBaselineSync(NetworkBaselineSync),

    // Operational messages
    Ping {
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    SensorEvent(SensorEvent),
    EventAck {
        event_id: String,
    },
    /// Central asks the sensor to start an upgrade process
    UpgradeTrigger {
        process_id: String,
        target_version: String,
    },
    Disconnect {
        reason: String,
    },
}

impl HubMessage {
    /// Short, stable name of the message type for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::HelmManagedConfigInit(_) => "HelmManagedConfigInit",
            HubMessage::ClusterConfig(_) => "ClusterConfig",
            HubMessage::PolicySync(_) => "PolicySync",
            HubMessage::NetworkBaselineSync(_) => "NetworkBaselineSync",
            HubMessage::Ping { .. } => "Ping",
            HubMessage::Pong { .. } => "Pong",
            HubMessage::SensorEvent(_) => "SensorEvent",
            HubMessage::EventAck { .. } => "EventAck",
            HubMessage::UpgradeTrigger { .. } => "UpgradeTrigger",
            HubMessage::Disconnect { .. } => "Disconnect",
        }
    }

    /// Whether this message belongs to the handshake sequence
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            HubMessage::HelmManagedConfigInit(_)
                | HubMessage::ClusterConfig(_)
                | HubMessage::PolicySync(_)
                | HubMessage::NetworkBaselineSync(_)
        )
    }
}

/// The three ordered phases of the stream handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakePhase {
    ConfigSync,
    PolicySync,
    BaselineSync,
}

impl HandshakePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakePhase::ConfigSync => "config sync",
            HandshakePhase::PolicySync => "policy sync",
            HandshakePhase::BaselineSync => "baseline sync",
        }
    }
}

impl fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who manages the sensor's configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ManagerType {
    #[default]
    Manual,
    Helm,
    Operator,
}

/// Configuration pushed by a declaratively managed sensor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ManagedConfigInit {
    pub cluster_name: String,
    /// Cluster identifier the sensor believes it has (may be unknown on first install)
    #[serde(default)]
    pub cluster_id: Option<String>,
    pub managed_by: ManagerType,
    pub settings: ClusterSettings,
}

/// Effective configuration of a cluster as decided by central
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ClusterConfig {
    pub cluster_id: String,
    pub cluster_name: String,
    pub managed_by: ManagerType,
    pub settings: ClusterSettings,
}

/// Runtime settings of a cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSettings {
    pub admission_controller: bool,
    pub collection_method: CollectionMethod,
    pub audit_logs: bool,
    /// Labels attached to the cluster, sorted by key
    #[serde(default)]
    pub labels: Vec<(String, String)>,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            admission_controller: false,
            collection_method: CollectionMethod::CoreBpf,
            audit_logs: true,
            labels: Vec::new(),
        }
    }
}

/// How runtime data is collected on the cluster nodes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CollectionMethod {
    None,
    KernelModule,
    CoreBpf,
}

/// Full policy set pushed to a sensor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PolicySync {
    pub policies: Vec<Policy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Network baselines for the deployments of a cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NetworkBaselineSync {
    pub baselines: Vec<NetworkBaseline>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkBaseline {
    pub deployment_id: String,
    /// Peer deployment ids observed while the baseline was learned
    pub peers: Vec<String>,
    pub locked: bool,
}

/// An observation reported by a sensor after the handshake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorEvent {
    pub event_id: String,
    pub resource: String,
    pub action: EventAction,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventAction {
    Create,
    Update,
    Remove,
    Sync,
}
