//! Stream metadata and capability negotiation primitives

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Boolean metadata key: sensor manages its configuration declaratively (on
/// requests) or central accepts a managed-config push (on headers).
pub const MANAGED_CONFIG_SUPPORT_KEY: &str = "sensorhub-managed-config-support";

/// Comma separated list of [`Capability`] names
pub const CAPABILITIES_KEY: &str = "sensorhub-capabilities";

/// Informational sensor version
pub const SENSOR_VERSION_KEY: &str = "sensorhub-sensor-version";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
}

/// Optional protocol features a peer can declare support for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Capability {
    /// Sensor can push its managed configuration during the handshake
    ManagedConfig,
    /// Sensor understands upgrade triggers
    SensorUpgrades,
    /// Network baselines are delivered during the handshake
    NetworkBaselines,
    /// Sensor acknowledges individual events
    EventAcks,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::ManagedConfig,
        Capability::SensorUpgrades,
        Capability::NetworkBaselines,
        Capability::EventAcks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ManagedConfig => "managed-config",
            Capability::SensorUpgrades => "sensor-upgrades",
            Capability::NetworkBaselines => "network-baselines",
            Capability::EventAcks => "event-acks",
        }
    }
}

impl FromStr for Capability {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| MetadataError::UnknownCapability(s.to_string()))
    }
}

/// Set of capabilities declared by one side of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Capability::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Capabilities supported by both sides
    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(self.0.intersection(&other.0).copied().collect())
    }

    /// Parse the wire representation, skipping names this build does not know.
    ///
    /// Newer peers may announce capabilities we have never heard of; those are
    /// simply not part of the negotiated set.
    pub fn parse_lenient(value: &str) -> Self {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        CapabilitySet(iter.into_iter().collect())
    }
}

impl FromStr for CapabilitySet {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Capability::from_str)
            .collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Capability::as_str).collect();
        write!(f, "{}", names.join(","))
    }
}

/// Compression requested for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Compression {
    #[default]
    Gzip,
    /// Identity encoding
    None,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::None => "identity",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key/value metadata attached to stream requests and response headers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata(HashMap<String, String>);

impl StreamMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Read a boolean flag; an absent key reads as `false`
    pub fn get_bool(&self, key: &str) -> Result<bool, MetadataError> {
        match self.get(key) {
            None => Ok(false),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(MetadataError::InvalidBool {
                    key: key.to_string(),
                    value: value.to_string(),
                }),
            },
        }
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.insert(key, if value { "true" } else { "false" });
    }

    /// Capabilities announced in this metadata
    pub fn capabilities(&self) -> CapabilitySet {
        self.get(CAPABILITIES_KEY)
            .map(CapabilitySet::parse_lenient)
            .unwrap_or_default()
    }

    pub fn set_capabilities(&mut self, capabilities: &CapabilitySet) {
        self.insert(CAPABILITIES_KEY, capabilities.to_string());
    }

    /// Whether the managed-config flag is present and true
    pub fn managed_config_support(&self) -> Result<bool, MetadataError> {
        self.get_bool(MANAGED_CONFIG_SUPPORT_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_display_and_parse() {
        let set: CapabilitySet = [Capability::SensorUpgrades, Capability::ManagedConfig]
            .into_iter()
            .collect();
        let rendered = set.to_string();
        assert_eq!(rendered, "managed-config,sensor-upgrades");

        let parsed: CapabilitySet = rendered.parse().unwrap();
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_strict_parse_rejects_unknown() {
        let result = "managed-config,time-travel".parse::<CapabilitySet>();
        assert_eq!(
            result,
            Err(MetadataError::UnknownCapability("time-travel".to_string()))
        );
    }

    #[test]
    fn test_lenient_parse_skips_unknown() {
        let set = CapabilitySet::parse_lenient("managed-config, time-travel ,event-acks,");
        assert_eq!(set.len(), 2);
        assert!(set.contains(Capability::ManagedConfig));
        assert!(set.contains(Capability::EventAcks));
    }

    #[test]
    fn test_intersection() {
        let a = CapabilitySet::all();
        let b: CapabilitySet = [Capability::EventAcks].into_iter().collect();
        let both = a.intersection(&b);
        assert_eq!(both.len(), 1);
        assert!(both.contains(Capability::EventAcks));
    }

    #[test]
    fn test_metadata_bool() {
        let mut md = StreamMetadata::new();
        assert!(!md.managed_config_support().unwrap());

        md.set_bool(MANAGED_CONFIG_SUPPORT_KEY, true);
        assert!(md.managed_config_support().unwrap());

        md.insert(MANAGED_CONFIG_SUPPORT_KEY, "maybe");
        assert!(md.managed_config_support().is_err());
    }

    #[test]
    fn test_metadata_capabilities_missing() {
        let md = StreamMetadata::new().with(SENSOR_VERSION_KEY, "4.2.0");
        assert!(md.capabilities().is_empty());
        assert_eq!(md.get(SENSOR_VERSION_KEY), Some("4.2.0"));
    }
}
