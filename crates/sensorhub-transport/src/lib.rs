//! Transport abstraction layer for sensor streams
//!
//! The control plane never dials or terminates TLS itself. It works with the
//! traits in this crate, which model one long-lived bidirectional message
//! stream per sensor:
//!
//! ```text
//! sensor                                    central
//! ──────                                    ───────
//! StreamDialer::open_stream(request) ──────► IncomingStream (request metadata)
//! PendingStream::await_header()      ◄────── IncomingStream::accept(header)
//! HubStream (sink + source)          ◄─────► HubStream (sink + source)
//! ```
//!
//! A [`HubStream`] can be split into its sending and receiving halves so the
//! inbound and outbound loops of a connection can run concurrently.

pub mod memory;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sensorhub_proto::{Compression, HubMessage, StreamMetadata};
use std::fmt::{self, Debug};
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    /// The remote does not implement what was requested (gRPC `Unimplemented`)
    #[error("Unimplemented: {0}")]
    Unimplemented(String),
}

impl TransportError {
    /// Whether the remote reported the request as not implemented
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, TransportError::Unimplemented(_))
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Sending half of a stream
#[async_trait]
pub trait MessageSink: Send + Debug {
    /// Send a message on this stream
    async fn send_message(&mut self, message: &HubMessage) -> TransportResult<()>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;
}

/// Receiving half of a stream
#[async_trait]
pub trait MessageSource: Send + Debug {
    /// Receive the next message
    ///
    /// Returns `None` if the stream has been closed gracefully by the remote peer.
    async fn recv_message(&mut self) -> TransportResult<Option<HubMessage>>;
}

/// A usable bidirectional message stream
#[derive(Debug)]
pub struct HubStream {
    id: u64,
    peer_metadata: StreamMetadata,
    compression: Compression,
    sink: Box<dyn MessageSink>,
    source: Box<dyn MessageSource>,
}

impl HubStream {
    pub fn new(
        id: u64,
        peer_metadata: StreamMetadata,
        compression: Compression,
        sink: Box<dyn MessageSink>,
        source: Box<dyn MessageSource>,
    ) -> Self {
        Self {
            id,
            peer_metadata,
            compression,
            sink,
            source,
        }
    }

    /// Stream identifier (unique per transport)
    pub fn stream_id(&self) -> u64 {
        self.id
    }

    /// Metadata sent by the remote side (request metadata on the server,
    /// response header on the client)
    pub fn peer_metadata(&self) -> &StreamMetadata {
        &self.peer_metadata
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub async fn send_message(&mut self, message: &HubMessage) -> TransportResult<()> {
        self.sink.send_message(message).await
    }

    pub async fn recv_message(&mut self) -> TransportResult<Option<HubMessage>> {
        self.source.recv_message().await
    }

    pub async fn finish(&mut self) -> TransportResult<()> {
        self.sink.finish().await
    }

    /// Split into independently owned sending and receiving halves
    pub fn into_parts(self) -> (Box<dyn MessageSink>, Box<dyn MessageSource>) {
        (self.sink, self.source)
    }
}

/// Parameters of a stream open request
#[derive(Debug, Clone, Default)]
pub struct StreamRequest {
    /// Metadata announced to the remote (capabilities, managed-config flag)
    pub metadata: StreamMetadata,
    /// Requested compression
    pub compression: Compression,
}

impl StreamRequest {
    pub fn new(metadata: StreamMetadata, compression: Compression) -> Self {
        Self {
            metadata,
            compression,
        }
    }

    pub fn with_compression(&self, compression: Compression) -> Self {
        Self {
            metadata: self.metadata.clone(),
            compression,
        }
    }
}

/// A stream that was opened but whose response header has not arrived yet
pub struct PendingStream {
    id: u64,
    compression: Compression,
    sink: Box<dyn MessageSink>,
    source: Box<dyn MessageSource>,
    header: BoxFuture<'static, TransportResult<StreamMetadata>>,
}

impl PendingStream {
    pub fn new(
        id: u64,
        compression: Compression,
        sink: Box<dyn MessageSink>,
        source: Box<dyn MessageSource>,
        header: BoxFuture<'static, TransportResult<StreamMetadata>>,
    ) -> Self {
        Self {
            id,
            compression,
            sink,
            source,
            header,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.id
    }

    /// Wait for the remote header; the stream is only usable afterwards
    pub async fn await_header(self) -> TransportResult<HubStream> {
        let header = self.header.await?;
        Ok(HubStream::new(
            self.id,
            header,
            self.compression,
            self.sink,
            self.source,
        ))
    }
}

impl Debug for PendingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingStream")
            .field("id", &self.id)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

/// Client-side: opens streams to the control plane
#[async_trait]
pub trait StreamDialer: Send + Sync + Debug {
    /// Open a stream with the given request parameters
    async fn open_stream(&self, request: &StreamRequest) -> TransportResult<PendingStream>;
}

/// Sends the response header of an incoming stream
pub type HeaderSender = Box<dyn FnOnce(StreamMetadata) -> TransportResult<()> + Send>;

/// Server-side: a stream opened by a sensor, not yet answered
pub struct IncomingStream {
    id: u64,
    request: StreamRequest,
    send_header: HeaderSender,
    sink: Box<dyn MessageSink>,
    source: Box<dyn MessageSource>,
}

impl IncomingStream {
    pub fn new(
        id: u64,
        request: StreamRequest,
        send_header: HeaderSender,
        sink: Box<dyn MessageSink>,
        source: Box<dyn MessageSource>,
    ) -> Self {
        Self {
            id,
            request,
            send_header,
            sink,
            source,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.id
    }

    /// Metadata the sensor attached to its request
    pub fn request_metadata(&self) -> &StreamMetadata {
        &self.request.metadata
    }

    pub fn compression(&self) -> Compression {
        self.request.compression
    }

    /// Answer with a header and turn this into a usable stream
    pub fn accept(self, header: StreamMetadata) -> TransportResult<HubStream> {
        (self.send_header)(header)?;
        Ok(HubStream::new(
            self.id,
            self.request.metadata,
            self.request.compression,
            self.sink,
            self.source,
        ))
    }
}

impl Debug for IncomingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingStream")
            .field("id", &self.id)
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}
