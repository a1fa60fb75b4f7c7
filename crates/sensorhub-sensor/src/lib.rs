//! Sensor side of the sensor hub protocol
//!
//! A sensor opens one stream to central ([`StreamNegotiator`]), runs the
//! ordered handshake ([`handshake::initiate`]) and then exchanges operational
//! traffic until the stream ends, after which it starts over from
//! negotiation ([`Sensor::run`]).

pub mod cluster_id;
pub mod config;
pub mod handshake;
pub mod negotiator;
pub mod reconnect;
pub mod sensor;
pub mod state;

pub use cluster_id::{ClusterIdCache, FileClusterIdCache, MemoryClusterIdCache};
pub use config::SensorConfig;
pub use handshake::{HandshakeError, HandshakeOutcome};
pub use negotiator::{NegotiateError, StreamNegotiator};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use sensor::{Sensor, SensorError, SensorHandle};
pub use state::{InMemorySensorState, SensorState, StateError};
