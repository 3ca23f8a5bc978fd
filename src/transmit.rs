//! Batch serialization and delivery.
//!
//! The [`Transmitter`] turns a batch into the collector's JSON payload,
//! hands it to a [`Transport`] and interprets the answer. It also acts as
//! a circuit breaker: after more than [`CIRCUIT_BREAKER_THRESHOLD`]
//! consecutive failures it refuses to touch the network, except for one
//! trial attempt once [`MAX_BACKOFF`] has elapsed since the last real attempt.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backoff::MAX_BACKOFF;
use crate::config::Endpoint;
use crate::record::{format_bounded, LogRecord};
use crate::transport::{PostRequest, Transport, TransportError, LOGS_PATH};

/// Consecutive failures tolerated before the circuit opens.
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// Upper bound on the serialized payload size.
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024;

/// Bytes of an error response kept for diagnostics.
const ERROR_BODY_PREVIEW: usize = 50;

/// Errors that can occur while transmitting a batch.
#[derive(Debug, Error)]
pub enum TransmitError {
    /// Too many consecutive failures; the network was not attempted
    #[error("circuit open after {consecutive_failures} consecutive failures")]
    CircuitOpen { consecutive_failures: u32 },

    /// The payload could not be serialized
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// Connect, send or receive failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The collector answered with a non-success status
    #[error("collector returned status {code}: {body}")]
    Status { code: u16, body: String },
}

impl TransmitError {
    /// Whether the failure happened on an actual network attempt.
    pub fn is_attempt(&self) -> bool {
        matches!(self, TransmitError::Transport(_) | TransmitError::Status { .. })
    }
}

/// Collector payload: `{"source": .., "logs": [..]}`.
#[derive(Debug, Serialize)]
struct WirePayload<'a> {
    source: &'a str,
    logs: &'a [LogRecord],
}

/// A serialized payload and how many leading records of the batch it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBatch {
    pub body: String,
    pub included: usize,
}

/// Serialize the longest prefix of `batch` that fits in `budget` bytes.
///
/// At least one record is always included, even if it alone exceeds the
/// budget.
pub fn encode_batch(
    source: &str,
    batch: &[LogRecord],
    budget: usize,
) -> Result<EncodedBatch, serde_json::Error> {
    // `{"source":<source>,"logs":[` ... `]}`
    let mut size = serde_json::to_string(source)?.len() + r#"{"source":,"logs":[]}"#.len();
    let mut included = 0;

    for record in batch {
        let separator = usize::from(included > 0);
        let len = serde_json::to_vec(record)?.len() + separator;
        if included > 0 && size + len > budget {
            break;
        }
        size += len;
        included += 1;
    }

    let body = serde_json::to_string(&WirePayload {
        source,
        logs: &batch[..included],
    })?;
    debug_assert_eq!(body.len(), size);

    Ok(EncodedBatch { body, included })
}

/// Sends batches to one collector on behalf of one device.
pub struct Transmitter {
    transport: Arc<dyn Transport>,
    source: String,
    endpoint: Endpoint,
    last_attempt: Mutex<Option<Instant>>,
}

impl Transmitter {
    pub fn new(transport: Arc<dyn Transport>, source: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            transport,
            source: source.into(),
            endpoint,
            last_attempt: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Deliver the leading records of `batch` that fit in one payload.
    ///
    /// Returns the number of records the collector accepted. With
    /// `bypass_breaker` the circuit breaker is bypassed.
    pub async fn transmit(
        &self,
        batch: &[LogRecord],
        consecutive_failures: u32,
        bypass_breaker: bool,
    ) -> Result<usize, TransmitError> {
        if batch.is_empty() {
            return Ok(0);
        }

        if !bypass_breaker && !self.circuit_allows(consecutive_failures) {
            debug!(consecutive_failures, "Circuit open, skipping transmission");
            return Err(TransmitError::CircuitOpen {
                consecutive_failures,
            });
        }

        let encoded = encode_batch(&self.source, batch, MAX_PAYLOAD_BYTES)?;
        if encoded.included < batch.len() {
            debug!(
                included = encoded.included,
                batch_size = batch.len(),
                "Payload budget reached, sending partial batch"
            );
        }

        let request = PostRequest {
            host: self.endpoint.host().to_string(),
            port: self.endpoint.port(),
            path: LOGS_PATH.to_string(),
            body: encoded.body,
        };

        *self
            .last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let response = match self.transport.post(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, endpoint = %self.endpoint, "Failed to reach collector");
                return Err(e.into());
            }
        };

        match response.status {
            200 | 201 => {
                debug!(
                    sent = encoded.included,
                    status = response.status,
                    "Batch delivered"
                );
                Ok(encoded.included)
            }
            code => {
                let body = format_bounded(format_args!("{}", response.body), ERROR_BODY_PREVIEW);
                warn!(status = code, body = %body, "Collector rejected batch");
                Err(TransmitError::Status { code, body })
            }
        }
    }

    /// Closed below the threshold; half-open once `MAX_BACKOFF` has passed
    /// since the last real attempt.
    fn circuit_allows(&self, consecutive_failures: u32) -> bool {
        if consecutive_failures <= CIRCUIT_BREAKER_THRESHOLD {
            return true;
        }

        let last_attempt = *self
            .last_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        match last_attempt {
            Some(at) => at.elapsed() >= MAX_BACKOFF,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LogLevel;
    use crate::transport::TransportResponse;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Transport that replays scripted results and records every request.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        requests: Mutex<Vec<PostRequest>>,
    }

    impl ScriptedTransport {
        fn with(results: Vec<Result<TransportResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(results.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn post(&self, request: &PostRequest) -> Result<TransportResponse, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(TransportResponse::new(200, "ok")))
        }
    }

    fn batch(n: usize) -> Vec<LogRecord> {
        (0..n)
            .map(|i| LogRecord::with_timestamp(i as i64, LogLevel::Info, "net", &format!("msg {}", i)))
            .collect()
    }

    fn transmitter(transport: Arc<ScriptedTransport>) -> Transmitter {
        let endpoint = Endpoint::parse("http://collector:8080").unwrap();
        Transmitter::new(transport, "dev-7", endpoint)
    }

    #[test]
    fn test_encode_batch_wire_shape() {
        let records = vec![LogRecord::with_timestamp(
            5,
            LogLevel::Warn,
            "io",
            "say \"hi\" \\ bye",
        )];
        let encoded = encode_batch("dev", &records, MAX_PAYLOAD_BYTES).unwrap();

        assert_eq!(encoded.included, 1);
        assert_eq!(
            encoded.body,
            r#"{"source":"dev","logs":[{"timestamp":5,"level":"warn","module":"io","message":"say \"hi\" \\ bye"}]}"#
        );
    }

    #[test]
    fn test_encode_batch_respects_budget() {
        let records: Vec<LogRecord> = (0..100)
            .map(|i| LogRecord::with_timestamp(i, LogLevel::Info, "m", &"x".repeat(255)))
            .collect();
        let encoded = encode_batch("dev", &records, MAX_PAYLOAD_BYTES).unwrap();

        assert!(encoded.included > 0);
        assert!(encoded.included < records.len());
        assert!(encoded.body.len() <= MAX_PAYLOAD_BYTES);

        let parsed: serde_json::Value = serde_json::from_str(&encoded.body).unwrap();
        assert_eq!(parsed["logs"].as_array().unwrap().len(), encoded.included);
    }

    #[test]
    fn test_encode_batch_always_includes_one() {
        let records = batch(3);
        let encoded = encode_batch("dev", &records, 10).unwrap();
        assert_eq!(encoded.included, 1);
    }

    #[tokio::test]
    async fn test_transmit_success_posts_to_logs() {
        let transport = ScriptedTransport::with(vec![Ok(TransportResponse::new(201, ""))]);
        let tx = transmitter(transport.clone());

        let sent = tx.transmit(&batch(3), 0, false).await.unwrap();
        assert_eq!(sent, 3);

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].host, "collector");
        assert_eq!(requests[0].port, 8080);
        assert_eq!(requests[0].path, "/logs");
        assert!(requests[0].body.starts_with(r#"{"source":"dev-7","logs":["#));
    }

    #[tokio::test]
    async fn test_transmit_empty_batch_skips_network() {
        let transport = ScriptedTransport::with(vec![]);
        let tx = transmitter(transport.clone());

        assert_eq!(tx.transmit(&[], 0, false).await.unwrap(), 0);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_success_status_is_failure() {
        let long_body = "e".repeat(200);
        let transport = ScriptedTransport::with(vec![
            Ok(TransportResponse::new(204, "")),
            Ok(TransportResponse::new(503, long_body)),
        ]);
        let tx = transmitter(transport);

        let err = tx.transmit(&batch(1), 0, false).await.unwrap_err();
        assert!(matches!(err, TransmitError::Status { code: 204, .. }));

        match tx.transmit(&batch(1), 0, false).await.unwrap_err() {
            TransmitError::Status { code, body } => {
                assert_eq!(code, 503);
                assert_eq!(body.len(), ERROR_BODY_PREVIEW);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_error_is_attempt() {
        let transport = ScriptedTransport::with(vec![Err(TransportError::Timeout)]);
        let tx = transmitter(transport);

        let err = tx.transmit(&batch(1), 0, false).await.unwrap_err();
        assert!(err.is_attempt());
        assert!(matches!(err, TransmitError::Transport(TransportError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_refuses_then_retries() {
        let transport = ScriptedTransport::with(vec![Err(TransportError::Timeout)]);
        let tx = transmitter(transport.clone());

        // A real failed attempt sets the last-attempt clock
        tx.transmit(&batch(1), 6, true).await.unwrap_err();
        assert_eq!(transport.calls(), 1);

        let err = tx.transmit(&batch(1), 6, false).await.unwrap_err();
        assert!(matches!(err, TransmitError::CircuitOpen { consecutive_failures: 6 }));
        assert!(!err.is_attempt());
        assert_eq!(transport.calls(), 1);

        tokio::time::advance(MAX_BACKOFF + Duration::from_millis(1)).await;

        assert_eq!(tx.transmit(&batch(1), 6, false).await.unwrap(), 1);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_threshold_itself_still_attempts() {
        let transport = ScriptedTransport::with(vec![]);
        let tx = transmitter(transport.clone());

        tx.transmit(&batch(1), CIRCUIT_BREAKER_THRESHOLD, false)
            .await
            .unwrap();
        assert_eq!(transport.calls(), 1);
    }
}
