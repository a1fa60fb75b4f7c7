//! Sensor run loop: negotiate, handshake, operate, repeat

use crate::cluster_id::ClusterIdCache;
use crate::config::SensorConfig;
use crate::handshake::{self, HandshakeError};
use crate::negotiator::{NegotiateError, StreamNegotiator};
use crate::reconnect::{ReconnectError, ReconnectManager};
use crate::state::SensorState;
use sensorhub_proto::{HubMessage, SensorEvent};
use sensorhub_transport::{HubStream, StreamDialer, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Negotiation failed: {0}")]
    Negotiate(#[from] NegotiateError),

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Giving up: {0}")]
    Reconnect(#[from] ReconnectError),
}

/// How an established session ended
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    Shutdown,
    Disconnected(String),
}

/// Control handle of a running [`Sensor`]
#[derive(Debug, Clone)]
pub struct SensorHandle {
    events: mpsc::Sender<SensorEvent>,
    reconnect: Arc<Notify>,
    cancel: CancellationToken,
}

impl SensorHandle {
    /// Queue an event; it is delivered once a session is live
    pub async fn send_event(&self, event: SensorEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Drop the current stream and start over from negotiation
    pub fn reconnect(&self) {
        self.reconnect.notify_one();
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One sensor process talking to central
pub struct Sensor {
    config: SensorConfig,
    negotiator: StreamNegotiator,
    state: Arc<dyn SensorState>,
    cache: Arc<dyn ClusterIdCache>,
    events: mpsc::Receiver<SensorEvent>,
    reconnect: Arc<Notify>,
    cancel: CancellationToken,
    sessions: usize,
}

impl Sensor {
    pub fn new(
        config: SensorConfig,
        dialer: Arc<dyn StreamDialer>,
        state: Arc<dyn SensorState>,
        cache: Arc<dyn ClusterIdCache>,
    ) -> (Self, SensorHandle) {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let reconnect = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let negotiator = StreamNegotiator::new(dialer, config.stream_request());

        let handle = SensorHandle {
            events: events_tx,
            reconnect: reconnect.clone(),
            cancel: cancel.clone(),
        };

        let sensor = Self {
            config,
            negotiator,
            state,
            cache,
            events: events_rx,
            reconnect,
            cancel,
            sessions: 0,
        };

        (sensor, handle)
    }

    /// Number of sessions that completed the handshake
    pub fn sessions(&self) -> usize {
        self.sessions
    }

    /// Run until shut down or until reconnect attempts are exhausted
    pub async fn run(mut self) -> Result<(), SensorError> {
        info!(
            "Sensor for cluster {} starting (compression: {}, managed: {})",
            self.config.cluster_name,
            self.config.preferred_compression,
            self.config.is_managed()
        );

        let mut backoff = ReconnectManager::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect_once().await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected(reason)) => {
                    info!("Session with central ended: {}", reason);
                    backoff.reset();
                }
                Err(SensorError::Negotiate(NegotiateError::Cancelled)) => break,
                Err(e) => {
                    warn!("Connection attempt to central failed: {}", e);
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = backoff.wait() => {
                    if let Err(e) = result {
                        error!("Sensor for cluster {} giving up: {}", self.config.cluster_name, e);
                        return Err(e.into());
                    }
                }
            }
        }

        info!("Sensor for cluster {} stopped", self.config.cluster_name);
        Ok(())
    }

    async fn connect_once(&mut self) -> Result<SessionEnd, SensorError> {
        let mut stream = self.negotiator.negotiate(&self.cancel).await?;

        let outcome = handshake::initiate(
            &mut stream,
            &self.config.announced_capabilities(),
            self.config.managed_config.as_ref(),
            self.cache.as_ref(),
            self.state.as_ref(),
        )
        .await?;

        self.sessions += 1;
        debug!(
            cluster_id = %outcome.cluster_config.cluster_id,
            capabilities = %outcome.capabilities,
            "Session {} established",
            self.sessions
        );

        self.operate(stream).await
    }

    async fn operate(&mut self, mut stream: HubStream) -> Result<SessionEnd, SensorError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = stream
                        .send_message(&HubMessage::Disconnect {
                            reason: "sensor shutdown".to_string(),
                        })
                        .await;
                    let _ = stream.finish().await;
                    return Ok(SessionEnd::Shutdown);
                }
                _ = self.reconnect.notified() => {
                    let _ = stream.finish().await;
                    return Ok(SessionEnd::Disconnected("reconnect requested".to_string()));
                }
                Some(event) = self.events.recv() => {
                    stream.send_message(&HubMessage::SensorEvent(event)).await?;
                }
                result = stream.recv_message() => {
                    match result? {
                        Some(HubMessage::Ping { timestamp }) => {
                            stream.send_message(&HubMessage::Pong { timestamp }).await?;
                        }
                        Some(HubMessage::EventAck { event_id }) => {
                            debug!("Central acknowledged event {}", event_id);
                        }
                        Some(HubMessage::UpgradeTrigger { process_id, target_version }) => {
                            info!("Upgrade {} to {} requested by central", process_id, target_version);
                            if let Err(e) = self.state.start_upgrade(&process_id, &target_version).await {
                                error!("Failed to start upgrade {}: {}", process_id, e);
                            }
                        }
                        Some(HubMessage::Disconnect { reason }) => {
                            return Ok(SessionEnd::Disconnected(reason));
                        }
                        Some(other) => {
                            warn!("Unexpected {} message from central", other.kind());
                        }
                        None => {
                            return Ok(SessionEnd::Disconnected("stream closed by central".to_string()));
                        }
                    }
                }
            }
        }
    }
}
