//! Error types for the synchronization client.

use thiserror::Error;

/// Reasons an inbound event is rejected before reaching any projection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Required field missing, ill-typed, or the id does not match the content hash.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Signature does not verify against `pubkey` and `id`.
    #[error("invalid signature")]
    InvalidSignature,
}

/// Transient relay failures. Logged and retried with backoff, never fatal.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("proxy error: {0}")]
    Proxy(#[from] tokio_socks::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect timed out")]
    Timeout,
}

/// Durable cache failures. In-memory state stays authoritative.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("persist error: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Errors returned by the client facade.
#[derive(Error, Debug)]
pub enum ClientError {
    /// No secret key is available; the client is read-only.
    #[error("no signing key available")]
    NoKeyAvailable,

    #[error("not connected to any relay")]
    NotConnected,

    #[error("client is already connected")]
    AlreadyConnected,

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("no relay accepted event {event_id}: {details}")]
    PublishRejected { event_id: String, details: String },

    #[error("no relay answered within {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid event: {0}")]
    Invalid(#[from] ValidationError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
