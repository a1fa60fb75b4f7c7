//! Sensor side of the three phase handshake
//!
//! 1. Config sync: optionally push `HelmManagedConfigInit`, then receive and
//!    apply `ClusterConfig`.
//! 2. Policy sync: the next message must be `PolicySync`.
//! 3. Baseline sync: the next message is applied as network baselines.
//!
//! Phases run strictly in order on the caller's task. Any failure abandons
//! the whole attempt; the caller starts over from stream negotiation.

use crate::cluster_id::ClusterIdCache;
use crate::state::{SensorState, StateError};
use sensorhub_proto::{
    CapabilitySet, ClusterConfig, HandshakePhase, HubMessage, ManagedConfigInit, MetadataError,
};
use sensorhub_transport::{HubStream, TransportError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Transport error during {phase}: {source}")]
    Transport {
        phase: HandshakePhase,
        #[source]
        source: TransportError,
    },

    #[error("Stream closed by central during {phase}")]
    StreamClosed { phase: HandshakePhase },

    #[error("Unexpected {received} message during {phase}, expected {expected}")]
    UnexpectedMessage {
        phase: HandshakePhase,
        expected: &'static str,
        received: &'static str,
    },

    #[error("Failed to apply {phase} payload: {source}")]
    Apply {
        phase: HandshakePhase,
        #[source]
        source: StateError,
    },

    #[error("Invalid header from central: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Cluster id cache error: {0}")]
    Cache(#[source] std::io::Error),
}

impl HandshakeError {
    pub fn phase(&self) -> Option<HandshakePhase> {
        match self {
            HandshakeError::Transport { phase, .. }
            | HandshakeError::StreamClosed { phase }
            | HandshakeError::UnexpectedMessage { phase, .. }
            | HandshakeError::Apply { phase, .. } => Some(*phase),
            HandshakeError::Metadata(_) | HandshakeError::Cache(_) => None,
        }
    }
}

/// Result of a completed handshake
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub cluster_config: ClusterConfig,
    /// Capabilities both sides declared
    pub capabilities: CapabilitySet,
    /// Whether the managed configuration was pushed in phase 1
    pub pushed_managed_config: bool,
    pub policy_count: usize,
    pub baseline_count: usize,
}

/// Run the handshake over a freshly negotiated stream
pub async fn initiate(
    stream: &mut HubStream,
    announced: &CapabilitySet,
    managed_config: Option<&ManagedConfigInit>,
    cache: &dyn ClusterIdCache,
    state: &dyn SensorState,
) -> Result<HandshakeOutcome, HandshakeError> {
    let header = stream.peer_metadata().clone();
    let capabilities = announced.intersection(&header.capabilities());

    // Phase 1: config sync
    let phase = HandshakePhase::ConfigSync;
    let central_accepts_push = header.managed_config_support()?;
    let mut pushed_managed_config = false;

    match managed_config {
        Some(init) if central_accepts_push => {
            let init = with_cached_cluster_id(init, cache)?;
            debug!(
                "Pushing managed config for cluster {} (cluster id: {:?})",
                init.cluster_name, init.cluster_id
            );
            stream
                .send_message(&HubMessage::HelmManagedConfigInit(init))
                .await
                .map_err(|source| HandshakeError::Transport { phase, source })?;
            pushed_managed_config = true;
        }
        Some(_) => {
            warn!("Central does not accept managed config push, relying on central-side config");
        }
        None => {}
    }

    let cluster_config = match next_message(stream, phase).await? {
        HubMessage::ClusterConfig(config) => config,
        other => return Err(unexpected(phase, "ClusterConfig", &other)),
    };

    state
        .apply_cluster_config(&cluster_config)
        .await
        .map_err(|source| HandshakeError::Apply { phase, source })?;

    if !cluster_config.cluster_id.is_empty() {
        cache
            .store(&cluster_config.cluster_id)
            .map_err(HandshakeError::Cache)?;
    }

    // Phase 2: policy sync
    let phase = HandshakePhase::PolicySync;
    let policies = match next_message(stream, phase).await? {
        HubMessage::PolicySync(sync) => sync,
        other => return Err(unexpected(phase, "PolicySync", &other)),
    };

    state
        .apply_policies(&policies)
        .await
        .map_err(|source| HandshakeError::Apply { phase, source })?;

    // Phase 3: baseline sync
    let phase = HandshakePhase::BaselineSync;
    let message = next_message(stream, phase).await?;
    let baseline_count = apply_baselines(state, message)
        .await
        .map_err(|source| HandshakeError::Apply { phase, source })?;

    info!(
        cluster_id = %cluster_config.cluster_id,
        policies = policies.policies.len(),
        baselines = baseline_count,
        "Handshake with central complete"
    );

    Ok(HandshakeOutcome {
        cluster_config,
        capabilities,
        pushed_managed_config,
        policy_count: policies.policies.len(),
        baseline_count,
    })
}

/// Fill in the cached cluster id when the managed config carries none
fn with_cached_cluster_id(
    init: &ManagedConfigInit,
    cache: &dyn ClusterIdCache,
) -> Result<ManagedConfigInit, HandshakeError> {
    let mut init = init.clone();
    if init.cluster_id.is_none() {
        let cached = cache.load().unwrap_or_else(|e| {
            warn!("Failed to read cached cluster id, pushing without it: {}", e);
            None
        });
        if let Some(cached) = cached {
            debug!("Using cached cluster id {}", cached);
            cache.store(&cached).map_err(HandshakeError::Cache)?;
            init.cluster_id = Some(cached);
        }
    }
    Ok(init)
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

fn unexpected(phase: HandshakePhase, expected: &'static str, got: &HubMessage) -> HandshakeError {
    HandshakeError::UnexpectedMessage {
        phase,
        expected,
        received: got.kind(),
    }
}

// Phase 3 does not validate the message type up front; anything that is not
// a baseline payload simply cannot be applied.
async fn apply_baselines(state: &dyn SensorState, message: HubMessage) -> Result<usize, StateError> {
    match message {
        HubMessage::NetworkBaselineSync(sync) => {
            state.apply_baselines(&sync).await?;
            Ok(sync.baselines.len())
        }
        other => Err(StateError::Rejected(format!(
            "{} is not a network baseline payload",
            other.kind()
        ))),
    }
}
