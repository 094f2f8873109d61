//! # Sync Engine Errors
//!
//! Plumbing failures around replication: bad config, a dead socket, a
//! malformed frame, a store that refused a write.
//!
//! ```text
//!   config.rs ──► InvalidConfig / MissingDeviceId / InvalidUrl / ConfigLoad|SaveFailed
//!   transport ──► ConnectionFailed / Disconnected / Timeout / TlsError / WebSocketError
//!   protocol  ──► InvalidMessage / SerializationFailed / UnexpectedMessageType
//!   reconciler ─► LookupFailed
//!   harbor-db ──► Database
//! ```
//!
//! A failed submission is not one of these. The worker records it on the
//! entry (`mark_error`) and carries on with the batch.

use harbor_db::DbError;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Broad class of a [`SyncError`], for deciding what to do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Fix the config file or environment and restart.
    Config,
    /// The central endpoint is unreachable or dropped us; try again later.
    Transport,
    /// The two sides disagree on the wire format.
    Protocol,
    /// The local queue store failed.
    Storage,
    Internal,
}

#[derive(Debug, Error)]
pub enum SyncError {
    // -------------------------------------------------------------------------
    // Config
    // -------------------------------------------------------------------------
    #[error("Bad sync config: {0}")]
    InvalidConfig(String),

    #[error("No device id configured for this branch")]
    MissingDeviceId,

    /// Partition endpoint that is not a `ws://` / `wss://` URL.
    #[error("Bad endpoint URL: {0}")]
    InvalidUrl(String),

    #[error("Cannot read sync config: {0}")]
    ConfigLoadFailed(String),

    #[error("Cannot write sync config: {0}")]
    ConfigSaveFailed(String),

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------
    #[error("Cannot reach central endpoint: {0}")]
    ConnectionFailed(String),

    #[error("Central endpoint closed the connection")]
    Disconnected,

    /// Connect or request took longer than the configured bound (seconds).
    #[error("No answer from central endpoint within {0}s")]
    Timeout(u64),

    #[error("TLS handshake failed: {0}")]
    TlsError(String),

    #[error("WebSocket failure: {0}")]
    WebSocketError(String),

    // -------------------------------------------------------------------------
    // Protocol
    // -------------------------------------------------------------------------
    #[error("Malformed message from central: {0}")]
    InvalidMessage(String),

    #[error("Cannot encode message: {0}")]
    SerializationFailed(String),

    /// A reply that does not answer the request we sent.
    #[error("Expected a {expected} reply, got {actual}")]
    UnexpectedMessageType { expected: String, actual: String },

    // -------------------------------------------------------------------------
    // Storage and lookups
    // -------------------------------------------------------------------------
    #[error(transparent)]
    Database(#[from] DbError),

    /// The remote directory could not answer an identity lookup.
    #[error("Identity lookup failed: {0}")]
    LookupFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::InvalidConfig(_)
            | SyncError::MissingDeviceId
            | SyncError::InvalidUrl(_)
            | SyncError::ConfigLoadFailed(_)
            | SyncError::ConfigSaveFailed(_) => ErrorClass::Config,

            SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::Timeout(_)
            | SyncError::TlsError(_)
            | SyncError::WebSocketError(_)
            | SyncError::LookupFailed(_) => ErrorClass::Transport,

            SyncError::InvalidMessage(_)
            | SyncError::SerializationFailed(_)
            | SyncError::UnexpectedMessageType { .. } => ErrorClass::Protocol,

            SyncError::Database(_) => ErrorClass::Storage,
            SyncError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Worth retrying unchanged on a later cycle. TLS failures are a
    /// certificate or config problem and will not clear by themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::TlsError(_) => false,
            SyncError::Database(db) => db.is_busy(),
            other => other.class() == ErrorClass::Transport,
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            SyncError::InvalidMessage(err.to_string())
        } else {
            SyncError::SerializationFailed(err.to_string())
        }
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as Ws;
        match err {
            Ws::ConnectionClosed | Ws::AlreadyClosed => SyncError::Disconnected,
            Ws::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            Ws::Tls(tls) => SyncError::TlsError(tls.to_string()),
            Ws::Url(url) => SyncError::InvalidUrl(url.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}
