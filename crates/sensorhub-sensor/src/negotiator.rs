//! Stream negotiation with a single compression fallback
//!
//! The preferred compression is requested first. If central answers
//! `Unimplemented` (an older server without that codec), exactly one more
//! attempt is made with compression disabled. Every other failure is returned
//! to the caller, which owns the reconnect policy.

use sensorhub_proto::Compression;
use sensorhub_transport::{HubStream, StreamDialer, StreamRequest, TransportError};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NegotiateError {
    #[error("Failed to open stream with {compression} compression: {source}")]
    Open {
        compression: Compression,
        #[source]
        source: TransportError,
    },

    #[error("Failed to receive stream header with {compression} compression: {source}")]
    Header {
        compression: Compression,
        #[source]
        source: TransportError,
    },

    #[error("Stream negotiation cancelled")]
    Cancelled,
}

impl NegotiateError {
    /// The underlying transport failure, if any
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            NegotiateError::Open { source, .. } | NegotiateError::Header { source, .. } => {
                Some(source)
            }
            NegotiateError::Cancelled => None,
        }
    }

    /// Dial and header failures share one fallback rule
    pub fn is_unimplemented(&self) -> bool {
        self.transport_error()
            .map(TransportError::is_unimplemented)
            .unwrap_or(false)
    }
}

/// Opens the sensor's stream to central
#[derive(Debug, Clone)]
pub struct StreamNegotiator {
    dialer: Arc<dyn StreamDialer>,
    request: StreamRequest,
}

impl StreamNegotiator {
    /// `request.compression` is the preferred compression
    pub fn new(dialer: Arc<dyn StreamDialer>, request: StreamRequest) -> Self {
        Self { dialer, request }
    }

    pub fn preferred_compression(&self) -> Compression {
        self.request.compression
    }

    /// Open a usable stream, falling back to no compression at most once
    pub async fn negotiate(&self, cancel: &CancellationToken) -> Result<HubStream, NegotiateError> {
        let preferred = self.request.compression;

        match self.attempt(preferred, cancel).await {
            Ok(stream) => Ok(stream),
            Err(err) if err.is_unimplemented() && preferred != Compression::None => {
                warn!(
                    "Central does not implement {} compression ({}), retrying without compression",
                    preferred, err
                );
                self.attempt(Compression::None, cancel).await
            }
            Err(err) => Err(err),
        }
    }

    async fn attempt(
        &self,
        compression: Compression,
        cancel: &CancellationToken,
    ) -> Result<HubStream, NegotiateError> {
        let request = self.request.with_compression(compression);
        debug!("Opening stream to central (compression: {})", compression);

        let open = async {
            let pending = self
                .dialer
                .open_stream(&request)
                .await
                .map_err(|source| NegotiateError::Open {
                    compression,
                    source,
                })?;

            pending
                .await_header()
                .await
                .map_err(|source| NegotiateError::Header {
                    compression,
                    source,
                })
        };

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(NegotiateError::Cancelled),
            result = open => result?,
        };

        info!(
            stream_id = stream.stream_id(),
            "Stream to central established (compression: {})", compression
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sensorhub_proto::StreamMetadata;
    use sensorhub_transport::{memory, PendingStream, TransportResult};
    use std::sync::Mutex;

    fn ready_header(
        stream: HubStream,
        header: TransportResult<StreamMetadata>,
    ) -> PendingStream {
        let id = stream.stream_id();
        let compression = stream.compression();
        let (sink, source) = stream.into_parts();
        PendingStream::new(id, compression, sink, source, Box::pin(async move { header }))
    }

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Ok,
        DialUnimplemented,
        HeaderUnimplemented,
        DialFailure,
    }

    /// Dialer that replays a script of outcomes and records requests
    #[derive(Debug)]
    struct ScriptedDialer {
        script: Mutex<Vec<Outcome>>,
        requests: Mutex<Vec<Compression>>,
    }

    impl ScriptedDialer {
        fn new(script: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<Compression> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StreamDialer for ScriptedDialer {
        async fn open_stream(&self, request: &StreamRequest) -> TransportResult<PendingStream> {
            self.requests.lock().unwrap().push(request.compression);
            let outcome = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    Outcome::Ok
                } else {
                    script.remove(0)
                }
            };

            let (client, _server) = memory::duplex(
                request.metadata.clone(),
                StreamMetadata::new(),
                request.compression,
            );

            match outcome {
                Outcome::Ok => Ok(ready_header(client, Ok(StreamMetadata::new()))),
                Outcome::DialUnimplemented => {
                    Err(TransportError::Unimplemented("gzip".to_string()))
                }
                Outcome::HeaderUnimplemented => Ok(ready_header(
                    client,
                    Err(TransportError::Unimplemented("gzip".to_string())),
                )),
                Outcome::DialFailure => Err(TransportError::ConnectionError(
                    "connection refused".to_string(),
                )),
            }
        }
    }

    fn negotiator(dialer: Arc<ScriptedDialer>, preferred: Compression) -> StreamNegotiator {
        StreamNegotiator::new(dialer, StreamRequest::new(StreamMetadata::new(), preferred))
    }

    #[tokio::test]
    async fn test_first_attempt_succeeds() {
        let dialer = ScriptedDialer::new(vec![Outcome::Ok]);
        let stream = negotiator(dialer.clone(), Compression::Gzip)
            .negotiate(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stream.compression(), Compression::Gzip);
        assert_eq!(dialer.requests(), vec![Compression::Gzip]);
    }

    #[tokio::test]
    async fn test_unimplemented_falls_back_once() {
        let dialer = ScriptedDialer::new(vec![Outcome::DialUnimplemented, Outcome::Ok]);
        let stream = negotiator(dialer.clone(), Compression::Gzip)
            .negotiate(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stream.compression(), Compression::None);
        assert_eq!(dialer.requests(), vec![Compression::Gzip, Compression::None]);
    }

    #[tokio::test]
    async fn test_header_unimplemented_falls_back_once() {
        let dialer = ScriptedDialer::new(vec![Outcome::HeaderUnimplemented, Outcome::Ok]);
        let stream = negotiator(dialer.clone(), Compression::Gzip)
            .negotiate(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stream.compression(), Compression::None);
        assert_eq!(dialer.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_second_unimplemented_is_terminal() {
        let dialer = ScriptedDialer::new(vec![
            Outcome::DialUnimplemented,
            Outcome::DialUnimplemented,
            Outcome::Ok,
        ]);
        let err = negotiator(dialer.clone(), Compression::Gzip)
            .negotiate(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_unimplemented());
        assert_eq!(dialer.requests(), vec![Compression::Gzip, Compression::None]);
    }

    #[tokio::test]
    async fn test_other_error_does_not_retry() {
        let dialer = ScriptedDialer::new(vec![Outcome::DialFailure, Outcome::Ok]);
        let err = negotiator(dialer.clone(), Compression::Gzip)
            .negotiate(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiateError::Open { .. }));
        assert_eq!(dialer.requests(), vec![Compression::Gzip]);
    }

    #[tokio::test]
    async fn test_fallback_failure_is_terminal() {
        let dialer = ScriptedDialer::new(vec![Outcome::DialUnimplemented, Outcome::DialFailure]);
        let err = negotiator(dialer.clone(), Compression::Gzip)
            .negotiate(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(!err.is_unimplemented());
        assert_eq!(dialer.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_no_fallback_without_preferred_compression() {
        let dialer = ScriptedDialer::new(vec![Outcome::DialUnimplemented, Outcome::Ok]);
        let err = negotiator(dialer.clone(), Compression::None)
            .negotiate(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_unimplemented());
        assert_eq!(dialer.requests(), vec![Compression::None]);
    }

    #[tokio::test]
    async fn test_cancelled_before_header() {
        let (dialer, _listener) = memory::listener([Compression::Gzip]);
        let negotiator = StreamNegotiator::new(
            Arc::new(dialer),
            StreamRequest::new(StreamMetadata::new(), Compression::Gzip),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = negotiator.negotiate(&cancel).await.unwrap_err();
        assert!(matches!(err, NegotiateError::Cancelled));
    }
}
