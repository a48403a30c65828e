//! Error types for modelbridge-core.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for model resolution, fetching and sessions.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The URI scheme is not one of file, http, https or bundle
    /// (or the operation does not support the scheme).
    #[error("unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    /// The host has no bundled resource with this identifier.
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// Filesystem failure on a specific path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The resource does not fit the in-memory size ceiling.
    #[error("{what} is {size} bytes, above the {limit} byte in-memory limit")]
    TooLarge { what: String, size: u64, limit: u64 },

    /// The server answered with a non-success status.
    #[error("HTTP error {status} fetching {url}")]
    Http { status: u16, url: String },

    /// The server answered successfully but sent no bytes.
    #[error("empty response body from {0}")]
    EmptyBody(String),

    /// Transport failure before a status was received.
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    /// The host context has been torn down.
    #[error("host context is unavailable")]
    ContextUnavailable,

    /// Another `run` is already in flight on this session.
    #[error("session is busy with another run")]
    SessionBusy,

    /// The session was closed.
    #[error("session is closed")]
    SessionClosed,

    /// The source cannot be turned into a usable location or cache key.
    #[error("invalid model source '{source_ref}': {reason}")]
    InvalidSource { source_ref: String, reason: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error from the engine layer.
    #[error(transparent)]
    Inference(#[from] modelbridge_inference::InferenceError),
}

impl BridgeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BridgeError::Io {
            path: path.into(),
            source,
        }
    }

    /// HTTP status code, if this is an HTTP error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            BridgeError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for modelbridge-core.
pub type Result<T> = std::result::Result<T, BridgeError>;
