//! Unified error types for outpost.
//!
//! Every variant belongs to one [`ErrorKind`], which is what the task queue
//! consults when deciding between retrying, giving up, or dropping a task.

use std::time::Duration;

use tokio_rusqlite::rusqlite;

/// How a failure should be treated by callers that retry work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected absence (cache miss, 404/410). Never escalated.
    NotFound,
    /// The request itself was rejected. Never retried.
    Client,
    /// Server-side or network trouble. Retried with backoff.
    Transient,
    /// Misconfiguration or a broken invariant. Logged and dropped.
    Internal,
}

/// Unified error types for the outpost pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., empty URL, malformed task arguments).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Invalid or unsupported URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// The remote document does not exist (404/410).
    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    /// Database operation failed.
    #[error("STORAGE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("STORAGE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// A stored record could not be decoded.
    #[error("CORRUPT_RECORD: {0}")]
    CorruptRecord(String),

    /// Remote answered with a 4xx status.
    #[error("HTTP_CLIENT_ERROR: status {status} for {url}")]
    HttpClient { status: u16, url: String },

    /// Remote answered with a 5xx status.
    #[error("HTTP_SERVER_ERROR: status {status} for {url}")]
    HttpServer { status: u16, url: String, retry_after: Option<Duration> },

    /// Remote asked us to slow down (429).
    #[error("RATE_LIMITED: {url}")]
    RateLimited { url: String, retry_after: Option<Duration> },

    /// Network-level failure (connection reset, DNS, TLS).
    #[error("NETWORK_ERROR: {0}")]
    Network(String),

    /// Fetch timeout.
    #[error("FETCH_TIMEOUT: {0}")]
    FetchTimeout(String),

    /// Fetch response too large.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// Response body or task arguments were not the expected JSON.
    #[error("DECODE_ERROR: {0}")]
    Decode(String),

    /// No handler registered under the task name.
    #[error("HANDLER_NOT_FOUND: {0}")]
    HandlerNotFound(String),

    /// A handler was registered twice under the same name.
    #[error("DUPLICATE_HANDLER: {0}")]
    DuplicateHandler(String),

    /// An operation needs persistent storage but none is configured.
    #[error("STORAGE_MISSING: {0}")]
    StorageMissing(String),

    /// The loader chain a handler re-enters has been torn down.
    #[error("CHAIN_DROPPED: {0}")]
    ChainDropped(String),

    /// The in-memory work buffer is full or closed.
    #[error("QUEUE_UNAVAILABLE: {0}")]
    QueueUnavailable(String),
}

impl Error {
    /// Classify this error for retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidInput(_)
            | Error::InvalidUrl(_)
            | Error::HttpClient { .. }
            | Error::FetchTooLarge(_)
            | Error::Decode(_) => ErrorKind::Client,
            Error::HttpServer { .. }
            | Error::RateLimited { .. }
            | Error::Network(_)
            | Error::FetchTimeout(_)
            | Error::Database(_)
            | Error::QueueUnavailable(_) => ErrorKind::Transient,
            Error::MigrationFailed(_)
            | Error::CorruptRecord(_)
            | Error::HandlerNotFound(_)
            | Error::DuplicateHandler(_)
            | Error::StorageMissing(_)
            | Error::ChainDropped(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same work later could succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Delay requested by the origin (Retry-After), if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::HttpServer { retry_after, .. } | Error::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}
