//! Central side of the three phase handshake
//!
//! Answers the sensor's stream request with a header advertising central's
//! capabilities, optionally receives the sensor's managed configuration, and
//! then sends `ClusterConfig`, `PolicySync` and `NetworkBaselineSync` in
//! that order. Nothing is registered until this completes.

use crate::sync_source::{SyncError, SyncSource};
use sensorhub_proto::{
    CapabilitySet, ClusterConfig, HandshakePhase, HubMessage, ManagedConfigInit, MetadataError,
    StreamMetadata, MANAGED_CONFIG_SUPPORT_KEY,
};
use sensorhub_transport::{HubStream, IncomingStream, TransportError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Failed to accept stream: {0}")]
    Accept(#[source] TransportError),

    #[error("Transport error during {phase}: {source}")]
    Transport {
        phase: HandshakePhase,
        #[source]
        source: TransportError,
    },

    #[error("Stream closed by sensor during {phase}")]
    StreamClosed { phase: HandshakePhase },

    #[error("Unexpected {received} message during {phase}, expected {expected}")]
    UnexpectedMessage {
        phase: HandshakePhase,
        expected: &'static str,
        received: &'static str,
    },

    #[error("Failed to load {phase} payload: {source}")]
    Sync {
        phase: HandshakePhase,
        #[source]
        source: SyncError,
    },

    #[error("Invalid request metadata from sensor: {0}")]
    Metadata(#[from] MetadataError),
}

/// What the handshake established about the sensor
#[derive(Debug, Clone)]
pub struct HandshakeSummary {
    pub cluster_config: ClusterConfig,
    /// Capabilities both sides declared
    pub capabilities: CapabilitySet,
    pub managed_config: Option<ManagedConfigInit>,
}

/// Accept `incoming` and run the handshake for `cluster_id`
pub async fn respond(
    incoming: IncomingStream,
    cluster_id: &str,
    capabilities: &CapabilitySet,
    accept_managed_config: bool,
    source: &dyn SyncSource,
) -> Result<(HubStream, HandshakeSummary), HandshakeError> {
    let request = incoming.request_metadata().clone();
    let sensor_pushes = request.managed_config_support()?;
    let shared = capabilities.intersection(&request.capabilities());

    let mut header = StreamMetadata::new();
    header.set_bool(MANAGED_CONFIG_SUPPORT_KEY, accept_managed_config);
    header.set_capabilities(capabilities);
    let mut stream = incoming.accept(header).map_err(HandshakeError::Accept)?;

    debug!(
        cluster_id = %cluster_id,
        stream_id = stream.stream_id(),
        compression = %stream.compression(),
        "Accepted sensor stream"
    );

    // Phase 1: config sync
    let phase = HandshakePhase::ConfigSync;
    let managed_config = if sensor_pushes && accept_managed_config {
        match next_message(&mut stream, phase).await? {
            HubMessage::HelmManagedConfigInit(init) => Some(init),
            other => {
                return Err(HandshakeError::UnexpectedMessage {
                    phase,
                    expected: "HelmManagedConfigInit",
                    received: other.kind(),
                })
            }
        }
    } else {
        None
    };

    let cluster_config = source
        .cluster_config(cluster_id, managed_config.as_ref())
        .await
        .map_err(|source| HandshakeError::Sync { phase, source })?;
    send(&mut stream, phase, HubMessage::ClusterConfig(cluster_config.clone())).await?;

    // Phase 2: policy sync
    let phase = HandshakePhase::PolicySync;
    let policies = source
        .policies(cluster_id)
        .await
        .map_err(|source| HandshakeError::Sync { phase, source })?;
    let policy_count = policies.policies.len();
    send(&mut stream, phase, HubMessage::PolicySync(policies)).await?;

    // Phase 3: baseline sync
    let phase = HandshakePhase::BaselineSync;
    let baselines = source
        .baselines(cluster_id)
        .await
        .map_err(|source| HandshakeError::Sync { phase, source })?;
    let baseline_count = baselines.baselines.len();
    send(&mut stream, phase, HubMessage::NetworkBaselineSync(baselines)).await?;

    info!(
        cluster_id = %cluster_id,
        managed = managed_config.is_some(),
        policies = policy_count,
        baselines = baseline_count,
        "Handshake with sensor complete"
    );

    Ok((
        stream,
        HandshakeSummary {
            cluster_config,
            capabilities: shared,
            managed_config,
        },
    ))
}

async fn send(
    stream: &mut HubStream,
    phase: HandshakePhase,
    message: HubMessage,
) -> Result<(), HandshakeError> {
    stream
        .send_message(&message)
        .await
        .map_err(|source| HandshakeError::Transport { phase, source })
}

async fn next_message(
    stream: &mut HubStream,
    phase: HandshakePhase,
) -> Result<HubMessage, HandshakeError> {
    match stream.recv_message().await {
        Ok(Some(message)) => Ok(message),
        Ok(None) => Err(HandshakeError::StreamClosed { phase }),
        Err(source) => Err(HandshakeError::Transport { phase, source }),
    }
}
