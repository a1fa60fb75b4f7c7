//! Sensor configuration

use crate::reconnect::ReconnectConfig;
use sensorhub_proto::{
    Capability, CapabilitySet, Compression, ManagedConfigInit, StreamMetadata,
    MANAGED_CONFIG_SUPPORT_KEY, SENSOR_VERSION_KEY,
};
use sensorhub_transport::StreamRequest;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration of one sensor process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub cluster_name: String,

    #[serde(default = "default_sensor_version")]
    pub sensor_version: String,

    /// Compression requested first; falls back to none once if unsupported
    #[serde(default)]
    pub preferred_compression: Compression,

    /// Present when the sensor is installed declaratively (Helm, operator)
    #[serde(default)]
    pub managed_config: Option<ManagedConfigInit>,

    /// Capabilities announced to central
    #[serde(default = "CapabilitySet::all")]
    pub capabilities: CapabilitySet,

    /// Where the assigned cluster id is persisted between runs
    #[serde(default)]
    pub cluster_id_cache: Option<PathBuf>,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Capacity of the queue of events waiting for a live stream
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_sensor_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_event_queue_capacity() -> usize {
    1024
}

impl SensorConfig {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            sensor_version: default_sensor_version(),
            preferred_compression: Compression::default(),
            managed_config: None,
            capabilities: CapabilitySet::all(),
            cluster_id_cache: None,
            reconnect: ReconnectConfig::default(),
            event_queue_capacity: default_event_queue_capacity(),
        }
    }

    pub fn with_managed_config(mut self, managed_config: ManagedConfigInit) -> Self {
        self.managed_config = Some(managed_config);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.preferred_compression = compression;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_cluster_id_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.cluster_id_cache = Some(path.into());
        self
    }

    pub fn is_managed(&self) -> bool {
        self.managed_config.is_some()
    }

    /// Capabilities actually announced; managed config is only claimed when configured
    pub fn announced_capabilities(&self) -> CapabilitySet {
        self.capabilities
            .iter()
            .filter(|c| *c != Capability::ManagedConfig || self.is_managed())
            .collect()
    }

    /// Metadata attached to every stream request
    pub fn stream_metadata(&self) -> StreamMetadata {
        let mut metadata = StreamMetadata::new();
        metadata.set_capabilities(&self.announced_capabilities());
        metadata.set_bool(MANAGED_CONFIG_SUPPORT_KEY, self.is_managed());
        metadata.insert(SENSOR_VERSION_KEY, self.sensor_version.clone());
        metadata
    }

    pub fn stream_request(&self) -> StreamRequest {
        StreamRequest::new(self.stream_metadata(), self.preferred_compression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmanaged_metadata() {
        let config = SensorConfig::new("edge");
        let metadata = config.stream_metadata();

        assert!(!metadata.managed_config_support().unwrap());
        assert!(!metadata.capabilities().contains(Capability::ManagedConfig));
        assert!(metadata.capabilities().contains(Capability::SensorUpgrades));
    }

    #[test]
    fn test_managed_metadata() {
        let config = SensorConfig::new("edge").with_managed_config(ManagedConfigInit {
            cluster_name: "edge".to_string(),
            ..Default::default()
        });
        let metadata = config.stream_metadata();

        assert!(metadata.managed_config_support().unwrap());
        assert!(metadata.capabilities().contains(Capability::ManagedConfig));
    }

    #[test]
    fn test_config_from_json_defaults() {
        let config: SensorConfig = serde_json::from_str(r#"{"cluster_name":"lab"}"#).unwrap();
        assert_eq!(config.cluster_name, "lab");
        assert_eq!(config.preferred_compression, Compression::Gzip);
        assert_eq!(config.capabilities, CapabilitySet::all());
        assert_eq!(config.reconnect, ReconnectConfig::default());
        assert_eq!(config.stream_request().compression, Compression::Gzip);
    }
}
