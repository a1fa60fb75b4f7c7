//! Sensor Hub Protocol Definitions
//!
//! This crate defines the message envelope exchanged between a cluster sensor
//! and the central control plane, along with the stream metadata keys and
//! capability primitives used during stream negotiation.

pub mod messages;
pub mod metadata;

pub use messages::*;
pub use metadata::{
    Capability, CapabilitySet, Compression, MetadataError, StreamMetadata, CAPABILITIES_KEY,
    MANAGED_CONFIG_SUPPORT_KEY, SENSOR_VERSION_KEY,
};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;
