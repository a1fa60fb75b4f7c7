//! In-process transport backed by tokio channels
//!
//! Used by tests and by the simulation binary in place of a network
//! transport. Compression support is configurable so callers can observe the
//! same `Unimplemented` failure a real server returns for an unknown codec.

use crate::{
    HeaderSender, HubStream, IncomingStream, MessageSink, MessageSource, PendingStream,
    StreamDialer, StreamRequest, TransportError, TransportResult,
};
use async_trait::async_trait;
use futures::FutureExt;
use sensorhub_proto::{Compression, HubMessage, StreamMetadata};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Messages buffered per direction before senders wait
const CHANNEL_CAPACITY: usize = 64;

/// Sending half backed by an mpsc channel
#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<HubMessage>>,
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send_message(&mut self, message: &HubMessage) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(message.clone())
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.tx.take();
        Ok(())
    }
}

/// Receiving half backed by an mpsc channel
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<HubMessage>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv_message(&mut self) -> TransportResult<Option<HubMessage>> {
        Ok(self.rx.recv().await)
    }
}

fn channel_halves() -> ((ChannelSink, ChannelSource), (ChannelSink, ChannelSource)) {
    let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        (ChannelSink { tx: Some(a_tx) }, ChannelSource { rx: a_rx }),
        (ChannelSink { tx: Some(b_tx) }, ChannelSource { rx: b_rx }),
    )
}

/// Create two already-connected streams.
///
/// The first stream sees `server_header` as its peer metadata, the second sees
/// `client_request`.
pub fn duplex(
    client_request: StreamMetadata,
    server_header: StreamMetadata,
    compression: Compression,
) -> (HubStream, HubStream) {
    let ((client_sink, client_source), (server_sink, server_source)) = channel_halves();
    let client = HubStream::new(
        0,
        server_header,
        compression,
        Box::new(client_sink),
        Box::new(client_source),
    );
    let server = HubStream::new(
        0,
        client_request,
        compression,
        Box::new(server_sink),
        Box::new(server_source),
    );
    (client, server)
}

/// Create a connected dialer/listener pair accepting the given compressions
pub fn listener(supported: impl IntoIterator<Item = Compression>) -> (MemoryDialer, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let dialer = MemoryDialer {
        accept_tx,
        supported: Arc::new(supported.into_iter().collect()),
        next_stream_id: Arc::new(AtomicU64::new(1)),
    };
    (dialer, MemoryListener { accept_rx })
}

/// Client end of the in-memory transport
#[derive(Debug, Clone)]
pub struct MemoryDialer {
    accept_tx: mpsc::Sender<IncomingStream>,
    supported: Arc<HashSet<Compression>>,
    next_stream_id: Arc<AtomicU64>,
}

#[async_trait]
impl StreamDialer for MemoryDialer {
    async fn open_stream(&self, request: &StreamRequest) -> TransportResult<PendingStream> {
        if !self.supported.contains(&request.compression) {
            return Err(TransportError::Unimplemented(format!(
                "compression {} is not supported by the server",
                request.compression
            )));
        }

        let id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let ((client_sink, client_source), (server_sink, server_source)) = channel_halves();
        let (header_tx, header_rx) = oneshot::channel::<StreamMetadata>();

        let send_header: HeaderSender = Box::new(move |header| {
            header_tx
                .send(header)
                .map_err(|_| TransportError::ConnectionError("client went away".to_string()))
        });

        let incoming = IncomingStream::new(
            id,
            request.clone(),
            send_header,
            Box::new(server_sink),
            Box::new(server_source),
        );

        self.accept_tx
            .send(incoming)
            .await
            .map_err(|_| TransportError::ConnectionError("listener closed".to_string()))?;

        debug!(stream_id = id, compression = %request.compression, "Opened in-memory stream");

        let header = async move {
            header_rx.await.map_err(|_| {
                TransportError::ConnectionError("stream dropped before headers".to_string())
            })
        }
        .boxed();

        Ok(PendingStream::new(
            id,
            request.compression,
            Box::new(client_sink),
            Box::new(client_source),
            header,
        ))
    }
}

/// Server end of the in-memory transport
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::Receiver<IncomingStream>,
}

impl MemoryListener {
    /// Accept the next incoming stream; `None` once every dialer is dropped
    pub async fn accept(&mut self) -> Option<IncomingStream> {
        self.accept_rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_send_receive() {
        let (mut client, mut server) =
            duplex(StreamMetadata::new(), StreamMetadata::new(), Compression::None);

        client
            .send_message(&HubMessage::Ping { timestamp: 7 })
            .await
            .unwrap();
        let received = server.recv_message().await.unwrap();
        assert_eq!(received, Some(HubMessage::Ping { timestamp: 7 }));

        server
            .send_message(&HubMessage::Pong { timestamp: 7 })
            .await
            .unwrap();
        let received = client.recv_message().await.unwrap();
        assert_eq!(received, Some(HubMessage::Pong { timestamp: 7 }));
    }

    #[tokio::test]
    async fn test_finish_ends_peer_stream() {
        let (mut client, mut server) =
            duplex(StreamMetadata::new(), StreamMetadata::new(), Compression::None);

        client.finish().await.unwrap();
        assert!(server.recv_message().await.unwrap().is_none());

        let result = client.send_message(&HubMessage::Ping { timestamp: 1 }).await;
        assert!(matches!(result, Err(TransportError::StreamClosed)));
    }

    #[tokio::test]
    async fn test_unsupported_compression_is_unimplemented() {
        let (dialer, _listener) = listener([Compression::None]);
        let request = StreamRequest::new(StreamMetadata::new(), Compression::Gzip);

        let err = dialer.open_stream(&request).await.unwrap_err();
        assert!(err.is_unimplemented());
    }

    #[tokio::test]
    async fn test_header_exchange() {
        let (dialer, mut listener) = listener([Compression::Gzip, Compression::None]);
        let request = StreamRequest::new(
            StreamMetadata::new().with("role", "sensor"),
            Compression::Gzip,
        );

        let pending = dialer.open_stream(&request).await.unwrap();
        let incoming = listener.accept().await.unwrap();
        assert_eq!(incoming.request_metadata().get("role"), Some("sensor"));
        assert_eq!(incoming.compression(), Compression::Gzip);

        let mut server = incoming
            .accept(StreamMetadata::new().with("role", "central"))
            .unwrap();
        let mut client = pending.await_header().await.unwrap();
        assert_eq!(client.peer_metadata().get("role"), Some("central"));

        server
            .send_message(&HubMessage::Ping { timestamp: 3 })
            .await
            .unwrap();
        assert_eq!(
            client.recv_message().await.unwrap(),
            Some(HubMessage::Ping { timestamp: 3 })
        );
    }

    #[tokio::test]
    async fn test_dropped_incoming_fails_header() {
        let (dialer, mut listener) = listener([Compression::None]);
        let request = StreamRequest::new(StreamMetadata::new(), Compression::None);

        let pending = dialer.open_stream(&request).await.unwrap();
        drop(listener.accept().await.unwrap());

        let err = pending.await_header().await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn test_closed_listener() {
        let (dialer, listener) = listener([Compression::None]);
        drop(listener);

        let request = StreamRequest::new(StreamMetadata::new(), Compression::None);
        let err = dialer.open_stream(&request).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionError(_)));
    }
}
