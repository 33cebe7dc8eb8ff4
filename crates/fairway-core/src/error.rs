use std::time::Duration;

/// Errors surfaced by a `MessageSource` implementation.
/// Transport faults are fatal for the ingestion loop; the lock and lease
/// variants are per-session conditions the dispatcher recovers from locally.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("message source is closed")]
    Closed,

    #[error("session lock lost: {0}")]
    SessionLockLost(String),

    #[error("session lock unavailable: {0}")]
    SessionLockUnavailable(String),

    #[error("lease not found or expired for message {0}")]
    LeaseNotFound(uuid::Uuid),
}

/// Payload encoding/decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}

/// Failure returned by a message handler. Every variant causes the message to
/// be abandoned (or dead-lettered once the attempt limit is reached).
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] CodecError),

    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
}

/// Engine-level errors: configuration, lifecycle and fatal transport faults.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport fault: {0}")]
    Transport(String),

    #[error("failed to spawn {0} thread")]
    SpawnFailed(String),

    #[error("dispatcher thread panicked")]
    DispatcherPanicked,

    #[error("engine is stopped")]
    Stopped,

    #[error("no tokio runtime: {0}")]
    NoRuntime(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;
pub type EngineResult<T> = std::result::Result<T, EngineError>;
