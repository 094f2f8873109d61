//! # Transport
//!
//! The boundary between the queue and the central system, and its WebSocket
//! implementation.
//!
//! ## Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Transport Boundary                                │
//! │                                                                         │
//! │  SyncTransport::submit(endpoint, [Submission])                         │
//! │      └──► [SubmitResult { entry_id, Ack(remote) | Rejected(reason)     │
//! │                                      | TransportError(reason) }]       │
//! │                                                                         │
//! │  RemoteDirectory::lookup(endpoint, entity_type, key)                   │
//! │      └──► [RemoteCandidate { remote_record_id, name, contact }]        │
//! │                                                                         │
//! │  An Err from either call means the whole request failed in transit.   │
//! │  Per-entry outcomes are always reported through SubmitResult.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WebSocket Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  request(endpoint)                                                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  cached connection? ── yes ──► send + await reply with same request_id │
//! │       │ no                              │                               │
//! │       ▼                                 │ error                         │
//! │  connect (timeout) ◄── backoff ──┐      ▼                               │
//! │       │ fail, attempts left ─────┘   drop cached connection            │
//! │       │ ok                                                              │
//! │       ▼                                                                 │
//! │  cache per endpoint, send + await reply                                │
//! │                                                                         │
//! │  BACKOFF (exponential with jitter): 500ms, 1s, 2s ... max 30s          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use harbor_core::{EntityType, Operation, Payload};

use crate::config::TransportSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{LookupKey, RemoteCandidate, SyncMessage, WireEntry, WireResult, WireStatus};

// =============================================================================
// Boundary Types
// =============================================================================

/// One entry handed to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub entry_id: i64,
    pub entity_type: EntityType,
    pub local_record_id: String,
    pub operation: Operation,
    pub remote_record_id: Option<String>,
    pub revision: i64,
    pub payload: Payload,
}

impl Submission {
    pub fn to_wire(&self) -> WireEntry {
        WireEntry {
            entry_id: self.entry_id,
            entity_type: self.entity_type,
            local_record_id: self.local_record_id.clone(),
            operation: self.operation,
            remote_record_id: self.remote_record_id.clone(),
            revision: self.revision,
            payload_version: self.payload.version,
            payload: self.payload.body.clone(),
        }
    }
}

/// What the central system said about one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored remotely; carries the remote id when the receiver assigned one.
    Ack(Option<String>),
    /// Application-level refusal (validation failure).
    Rejected(String),
    /// Failed in transit or on a transient central-side error.
    TransportError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitResult {
    pub entry_id: i64,
    pub outcome: SubmitOutcome,
    /// Raw response kept on the entry for operators.
    pub response: Option<String>,
}

impl SubmitResult {
    pub fn new(entry_id: i64, outcome: SubmitOutcome) -> Self {
        SubmitResult {
            entry_id,
            outcome,
            response: None,
        }
    }

    fn from_wire(result: &WireResult) -> Self {
        let reason = || result.reason.clone().unwrap_or_else(|| "no reason given".into());
        let outcome = match result.status {
            WireStatus::Accepted => SubmitOutcome::Ack(result.remote_record_id.clone()),
            WireStatus::Rejected => SubmitOutcome::Rejected(reason()),
            WireStatus::Failed => SubmitOutcome::TransportError(reason()),
        };
        SubmitResult {
            entry_id: result.entry_id,
            outcome,
            response: serde_json::to_string(result).ok(),
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Delivers entries to the central system.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn submit(
        &self,
        endpoint: &str,
        submissions: Vec<Submission>,
    ) -> SyncResult<Vec<SubmitResult>>;
}

/// Answers "does the central system already know this record?".
#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    async fn lookup(
        &self,
        endpoint: &str,
        entity_type: EntityType,
        key: LookupKey,
    ) -> SyncResult<Vec<RemoteCandidate>>;
}

// =============================================================================
// WebSocket Transport
// =============================================================================

/// Connection settings for [`WsTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Connect attempts per request before giving up.
    pub connect_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            connect_attempts: 3,
        }
    }
}

impl From<&TransportSettings> for TransportConfig {
    fn from(settings: &TransportSettings) -> Self {
        TransportConfig {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
            ..Default::default()
        }
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// JSON-over-WebSocket transport with one reusable connection per endpoint.
///
/// Requests on the same endpoint are serialized over that connection; the
/// reply is matched by `request_id`.
pub struct WsTransport {
    config: TransportConfig,
    device_id: String,
    connections: Mutex<HashMap<String, Arc<Mutex<WsStream>>>>,
}

impl WsTransport {
    pub fn new(config: TransportConfig, device_id: impl Into<String>) -> Self {
        WsTransport {
            config,
            device_id: device_id.into(),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Number of cached connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Closes and forgets every cached connection.
    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self.connections.lock().await.drain().collect();
        for (endpoint, conn) in connections {
            let mut stream = conn.lock().await;
            if let Err(e) = stream.close(None).await {
                debug!(endpoint = %endpoint, ?e, "Close failed");
            }
        }
    }

    /// Sends one request and waits for its reply. A failed exchange drops the
    /// cached connection so the next request reconnects.
    async fn request(&self, endpoint: &str, message: SyncMessage) -> SyncResult<SyncMessage> {
        let conn = self.connection(endpoint).await?;
        let result = {
            let mut stream = conn.lock().await;
            exchange(&mut stream, &message).await
        };

        if let Err(ref e) = result {
            warn!(endpoint, error = %e, "Exchange failed, dropping connection");
            let mut connections = self.connections.lock().await;
            if connections
                .get(endpoint)
                .is_some_and(|cached| Arc::ptr_eq(cached, &conn))
            {
                connections.remove(endpoint);
            }
        }
        result
    }

    async fn connection(&self, endpoint: &str) -> SyncResult<Arc<Mutex<WsStream>>> {
        if let Some(conn) = self.connections.lock().await.get(endpoint) {
            return Ok(conn.clone());
        }

        let stream = self.connect_with_backoff(endpoint).await?;
        let conn = Arc::new(Mutex::new(stream));
        let mut connections = self.connections.lock().await;
        // Another task may have connected meanwhile; keep the first one.
        Ok(connections
            .entry(endpoint.to_string())
            .or_insert(conn)
            .clone())
    }

    async fn connect_with_backoff(&self, endpoint: &str) -> SyncResult<WsStream> {
        let mut backoff = self.create_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.connect_with_timeout(endpoint).await {
                Ok(stream) => {
                    info!(endpoint, attempt, "WebSocket connected");
                    return Ok(stream);
                }
                Err(e) if attempt >= self.config.connect_attempts.max(1) => {
                    warn!(endpoint, attempt, error = %e, "Giving up on connection");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                    debug!(endpoint, attempt, ?delay, error = %e, "Connect failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_with_timeout(&self, endpoint: &str) -> SyncResult<WsStream> {
        match timeout(self.config.connect_timeout, connect_async(endpoint)).await {
            Ok(Ok((stream, response))) => {
                debug!(status = ?response.status(), "WebSocket handshake complete");
                Ok(stream)
            }
            Ok(Err(e)) => Err(SyncError::from(e)),
            Err(_) => Err(SyncError::Timeout(self.config.connect_timeout.as_secs())),
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Writes `message` and reads until the reply carrying its request id.
async fn exchange(stream: &mut WsStream, message: &SyncMessage) -> SyncResult<SyncMessage> {
    let request_id = message.request_id();
    stream.send(WsMessage::Text(message.to_json()?.into())).await?;
    debug!(msg_type = message.type_name(), "Sent message");

    while let Some(frame) = stream.next().await {
        match frame? {
            WsMessage::Text(text) => {
                let reply = SyncMessage::from_json(&text)
                    .map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
                if reply.request_id().is_none() || reply.request_id() == request_id {
                    return Ok(reply);
                }
                debug!(msg_type = reply.type_name(), "Ignoring reply to another request");
            }
            WsMessage::Ping(data) => stream.send(WsMessage::Pong(data)).await?,
            WsMessage::Pong(_) | WsMessage::Frame(_) => {}
            WsMessage::Binary(_) => warn!("Received unexpected binary message"),
            WsMessage::Close(frame) => {
                info!(?frame, "Central endpoint closed the connection");
                return Err(SyncError::Disconnected);
            }
        }
    }
    Err(SyncError::Disconnected)
}

#[async_trait]
impl SyncTransport for WsTransport {
    async fn submit(
        &self,
        endpoint: &str,
        submissions: Vec<Submission>,
    ) -> SyncResult<Vec<SubmitResult>> {
        if submissions.is_empty() {
            return Ok(Vec::new());
        }
        let entries = submissions.iter().map(Submission::to_wire).collect();
        let reply = self
            .request(endpoint, SyncMessage::submit(&self.device_id, entries))
            .await?;

        match reply {
            SyncMessage::SubmitAck(ack) => {
                let mut by_entry: HashMap<i64, &WireResult> =
                    ack.results.iter().map(|r| (r.entry_id, r)).collect();
                Ok(submissions
                    .iter()
                    .map(|s| match by_entry.remove(&s.entry_id) {
                        Some(result) => SubmitResult::from_wire(result),
                        None => SubmitResult::new(
                            s.entry_id,
                            SubmitOutcome::TransportError("no result for entry in ack".into()),
                        ),
                    })
                    .collect())
            }
            SyncMessage::Error(err) => {
                let reason = format!("{}: {}", err.code, err.message);
                Ok(submissions
                    .iter()
                    .map(|s| SubmitResult::new(s.entry_id, SubmitOutcome::TransportError(reason.clone())))
                    .collect())
            }
            other => Err(SyncError::UnexpectedMessageType {
                expected: "SubmitAck".into(),
                actual: other.type_name().into(),
            }),
        }
    }
}

#[async_trait]
impl RemoteDirectory for WsTransport {
    async fn lookup(
        &self,
        endpoint: &str,
        entity_type: EntityType,
        key: LookupKey,
    ) -> SyncResult<Vec<RemoteCandidate>> {
        match self.request(endpoint, SyncMessage::lookup(entity_type, key)).await? {
            SyncMessage::LookupResult(result) => Ok(result.candidates),
            SyncMessage::Error(err) => Err(SyncError::LookupFailed(format!(
                "{}: {}",
                err.code, err.message
            ))),
            other => Err(SyncError::UnexpectedMessageType {
                expected: "LookupResult".into(),
                actual: other.type_name().into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LookupResultPayload, SubmitAckPayload};
    use tokio::net::TcpListener;

    /// Minimal central endpoint: accepts everything except records named
    /// "bad", and knows one partner by tax id.
    async fn spawn_central() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    while let Some(Ok(frame)) = ws.next().await {
                        let WsMessage::Text(text) = frame else { continue };
                        let reply = match SyncMessage::from_json(&text).unwrap() {
                            SyncMessage::Submit(p) => SyncMessage::SubmitAck(SubmitAckPayload {
                                request_id: p.request_id,
                                results: p
                                    .entries
                                    .iter()
                                    .map(|e| {
                                        if e.local_record_id == "bad" {
                                            WireResult {
                                                entry_id: e.entry_id,
                                                status: WireStatus::Rejected,
                                                remote_record_id: None,
                                                reason: Some("vat invalid".into()),
                                            }
                                        } else {
                                            WireResult {
                                                entry_id: e.entry_id,
                                                status: WireStatus::Accepted,
                                                remote_record_id: Some(format!("R-{}", e.local_record_id)),
                                                reason: None,
                                            }
                                        }
                                    })
                                    .collect(),
                            }),
                            SyncMessage::Lookup(p) => {
                                let candidates = match p.key {
                                    LookupKey::BusinessKey(k) if k == "PT1" => vec![RemoteCandidate {
                                        remote_record_id: "R-77".into(),
                                        name: Some("Ana".into()),
                                        contact: None,
                                    }],
                                    _ => Vec::new(),
                                };
                                SyncMessage::LookupResult(LookupResultPayload {
                                    request_id: p.request_id,
                                    candidates,
                                })
                            }
                            other => other,
                        };
                        ws.send(WsMessage::Text(reply.to_json().unwrap().into()))
                            .await
                            .unwrap();
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    fn submission(entry_id: i64, local_id: &str) -> Submission {
        Submission {
            entry_id,
            entity_type: EntityType::Partner,
            local_record_id: local_id.into(),
            operation: Operation::Create,
            remote_record_id: None,
            revision: 1,
            payload: Payload::new(serde_json::json!({"id": local_id})),
        }
    }

    #[tokio::test]
    async fn test_submit_maps_per_entry_outcomes() {
        let endpoint = spawn_central().await;
        let transport = WsTransport::new(TransportConfig::default(), "register-1");

        let results = transport
            .submit(&endpoint, vec![submission(1, "p-1"), submission(2, "bad")])
            .await
            .unwrap();

        assert_eq!(results[0].outcome, SubmitOutcome::Ack(Some("R-p-1".into())));
        assert_eq!(results[1].outcome, SubmitOutcome::Rejected("vat invalid".into()));
        assert!(results[1].response.as_deref().unwrap().contains("vat invalid"));
    }

    #[tokio::test]
    async fn test_connection_is_reused_across_requests() {
        let endpoint = spawn_central().await;
        let transport = WsTransport::new(TransportConfig::default(), "register-1");

        transport.submit(&endpoint, vec![submission(1, "p-1")]).await.unwrap();
        let found = transport
            .lookup(&endpoint, EntityType::Partner, LookupKey::BusinessKey("PT1".into()))
            .await
            .unwrap();

        assert_eq!(found[0].remote_record_id, "R-77");
        assert_eq!(transport.connection_count().await, 1);

        transport.disconnect_all().await;
        assert_eq!(transport.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = TransportConfig {
            connect_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            connect_attempts: 2,
        };
        let transport = WsTransport::new(config, "register-1");
        let err = transport
            .submit(&format!("ws://{addr}"), vec![submission(1, "p-1")])
            .await
            .unwrap_err();

        assert!(err.is_retryable(), "unexpected error: {err}");
        assert_eq!(transport.connection_count().await, 0);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = TransportSettings::default();
        let config = TransportConfig::from(&settings);
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.connect_attempts, 3);
    }
}
