//! A live, handshaken stream to one cluster's sensor
//!
//! Each connection runs an inbound loop and an outbound loop on separate
//! tasks. Both observe the same stop request; whichever side fails first
//! records the reason and asks the other to stop. Later reasons are ignored.
//! `stopped` fires only after both loops have exited.

use crate::error::ConnectionError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sensorhub_proto::{Capability, CapabilitySet, HubMessage, SensorEvent};
use sensorhub_transport::{HubStream, MessageSink, MessageSource};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives sensor events after the handshake
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn on_event(&self, cluster_id: &str, event: &SensorEvent);
}

struct LoopParts {
    sink: Box<dyn MessageSink>,
    source: Box<dyn MessageSource>,
    outbound_rx: mpsc::Receiver<HubMessage>,
}

pub struct SensorConnection {
    id: Uuid,
    cluster_id: String,
    capabilities: CapabilitySet,
    connected_at: DateTime<Utc>,
    last_contact: Mutex<DateTime<Utc>>,
    outbound_tx: mpsc::Sender<HubMessage>,
    parts: Mutex<Option<LoopParts>>,
    handler: Option<Arc<dyn InboundHandler>>,
    stop_reason: OnceLock<ConnectionError>,
    stop_requested: CancellationToken,
    stopped: CancellationToken,
}

impl SensorConnection {
    pub fn new(
        cluster_id: impl Into<String>,
        stream: HubStream,
        capabilities: CapabilitySet,
        queue_capacity: usize,
        handler: Option<Arc<dyn InboundHandler>>,
    ) -> Self {
        let (sink, source) = stream.into_parts();
        let (outbound_tx, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            cluster_id: cluster_id.into(),
            capabilities,
            connected_at: now,
            last_contact: Mutex::new(now),
            outbound_tx,
            parts: Mutex::new(Some(LoopParts {
                sink,
                source,
                outbound_rx,
            })),
            handler,
            stop_reason: OnceLock::new(),
            stop_requested: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Time the last message arrived from the sensor
    pub fn last_contact(&self) -> DateTime<Utc> {
        self.last_contact
            .lock()
            .map(|time| *time)
            .unwrap_or(self.connected_at)
    }

    /// Request termination. Returns true if this call set the reason.
    pub fn terminate(&self, reason: ConnectionError) -> bool {
        let description = reason.to_string();
        if self.stop_reason.set(reason).is_err() {
            debug!(
                cluster_id = %self.cluster_id,
                connection_id = %self.id,
                "Ignoring termination ({}), connection already stopping",
                description
            );
            return false;
        }

        info!(
            cluster_id = %self.cluster_id,
            connection_id = %self.id,
            "Terminating connection: {}",
            description
        );
        self.stop_requested.cancel();
        true
    }

    /// The reason recorded by the first call to [`Self::terminate`]
    pub fn stop_reason(&self) -> Option<&ConnectionError> {
        self.stop_reason.get()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.is_cancelled()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    pub async fn wait_stop_requested(&self) {
        self.stop_requested.cancelled().await
    }

    /// Wait until both loops have exited
    pub async fn wait_stopped(&self) {
        self.stopped.cancelled().await
    }

    /// Queue a message for the sensor.
    ///
    /// Waits while the queue is full; fails once the connection is stopping.
    pub async fn send(&self, message: HubMessage) -> Result<(), ConnectionError> {
        if let Some(reason) = self.stop_reason() {
            return Err(reason.clone());
        }

        tokio::select! {
            _ = self.stop_requested.cancelled() => Err(self.current_reason()),
            result = self.outbound_tx.send(message) => {
                result.map_err(|_| self.current_reason())
            }
        }
    }

    /// Run both loops until the connection terminates and return the reason.
    ///
    /// Calling this a second time waits for the first run to finish.
    pub async fn run(self: &Arc<Self>) -> ConnectionError {
        let parts = self.parts.lock().ok().and_then(|mut parts| parts.take());
        let Some(LoopParts {
            sink,
            source,
            outbound_rx,
        }) = parts
        else {
            warn!(connection_id = %self.id, "Connection loops already started");
            self.stopped.cancelled().await;
            return self.current_reason();
        };

        debug!(
            cluster_id = %self.cluster_id,
            connection_id = %self.id,
            "Starting connection loops"
        );

        let inbound = tokio::spawn(Arc::clone(self).inbound_loop(source));
        let outbound = tokio::spawn(Arc::clone(self).outbound_loop(sink, outbound_rx));

        let (inbound_result, outbound_result) = tokio::join!(inbound, outbound);
        for result in [inbound_result, outbound_result] {
            if let Err(e) = result {
                error!(connection_id = %self.id, "Connection loop task failed: {}", e);
                self.terminate(ConnectionError::Transport(format!("loop task failed: {}", e)));
            }
        }

        self.stopped.cancel();
        let reason = self.current_reason();
        info!(
            cluster_id = %self.cluster_id,
            connection_id = %self.id,
            "Connection stopped: {}",
            reason
        );
        reason
    }

    fn current_reason(&self) -> ConnectionError {
        self.stop_reason()
            .cloned()
            .unwrap_or(ConnectionError::StreamEnded)
    }

    fn touch(&self) {
        if let Ok(mut last) = self.last_contact.lock() {
            *last = Utc::now();
        }
    }

    async fn inbound_loop(self: Arc<Self>, mut source: Box<dyn MessageSource>) {
        loop {
            tokio::select! {
                _ = self.stop_requested.cancelled() => break,
                result = source.recv_message() => match result {
                    Ok(Some(message)) => {
                        self.touch();
                        if let Err(reason) = self.handle_inbound(message).await {
                            self.terminate(reason);
                            break;
                        }
                    }
                    Ok(None) => {
                        self.terminate(ConnectionError::StreamEnded);
                        break;
                    }
                    Err(e) => {
                        self.terminate(ConnectionError::Transport(e.to_string()));
                        break;
                    }
                }
            }
        }
        debug!(connection_id = %self.id, "Inbound loop exited");
    }

    async fn handle_inbound(&self, message: HubMessage) -> Result<(), ConnectionError> {
        match message {
            HubMessage::Ping { timestamp } => self.reply(HubMessage::Pong { timestamp }).await,
            HubMessage::Pong { .. } => Ok(()),
            HubMessage::SensorEvent(event) => {
                debug!(
                    cluster_id = %self.cluster_id,
                    event_id = %event.event_id,
                    resource = %event.resource,
                    "Received sensor event"
                );
                if let Some(handler) = &self.handler {
                    handler.on_event(&self.cluster_id, &event).await;
                }
                if self.has_capability(Capability::EventAcks) {
                    self.reply(HubMessage::EventAck {
                        event_id: event.event_id,
                    })
                    .await?;
                }
                Ok(())
            }
            HubMessage::Disconnect { reason } => Err(ConnectionError::PeerDisconnected(reason)),
            other if other.is_handshake() => Err(ConnectionError::Protocol(format!(
                "{} received after handshake",
                other.kind()
            ))),
            other => {
                warn!(
                    cluster_id = %self.cluster_id,
                    "Ignoring unexpected {} from sensor",
                    other.kind()
                );
                Ok(())
            }
        }
    }

    // Replies are dropped, not errors, once the connection is stopping.
    async fn reply(&self, message: HubMessage) -> Result<(), ConnectionError> {
        match self.send(message).await {
            Ok(()) => Ok(()),
            Err(_) if self.is_stop_requested() => Ok(()),
            Err(reason) => Err(reason),
        }
    }

    async fn outbound_loop(
        self: Arc<Self>,
        mut sink: Box<dyn MessageSink>,
        mut outbound_rx: mpsc::Receiver<HubMessage>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.stop_requested.cancelled() => break,
                message = outbound_rx.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = sink.send_message(&message).await {
                        self.terminate(ConnectionError::Transport(e.to_string()));
                        break;
                    }
                }
            }
        }

        if let Some(reason) = self.stop_reason() {
            if reason.notify_peer() {
                let goodbye = HubMessage::Disconnect {
                    reason: reason.to_string(),
                };
                if let Err(e) = sink.send_message(&goodbye).await {
                    debug!(connection_id = %self.id, "Could not notify sensor: {}", e);
                }
            }
        }
        if let Err(e) = sink.finish().await {
            debug!(connection_id = %self.id, "Error finishing stream: {}", e);
        }
        debug!(connection_id = %self.id, "Outbound loop exited");
    }
}

impl fmt::Debug for SensorConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorConnection")
            .field("id", &self.id)
            .field("cluster_id", &self.cluster_id)
            .field("capabilities", &self.capabilities)
            .field("connected_at", &self.connected_at)
            .field("stop_reason", &self.stop_reason.get())
            .finish()
    }
}
