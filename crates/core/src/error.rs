//! Error types for the transfer engine
//!
//! Adapters raise [`Error`] values; the orchestrator classifies them and wraps
//! the final failure of a session into a [`TransferError`] carrying context.

use std::fmt;

use crate::provider::Provider;

/// Result type alias using the engine error type
pub type Result<T> = std::result::Result<T, Error>;

/// Whether a retry budget was exhausted for one chunk or for the whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    Chunk,
    Session,
}

impl fmt::Display for RetryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryScope::Chunk => write!(f, "chunk"),
            RetryScope::Session => write!(f, "session"),
        }
    }
}

/// Transfer engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The source has no content; nothing is planned or sent
    #[error("Nothing to transfer, {0} is empty")]
    EmptyFile(String),

    /// The requested chunk size violates the provider's chunk policy
    #[error("Invalid chunk size {requested} bytes: {reason}")]
    InvalidChunkSize { requested: u64, reason: String },

    /// Network timeout, 5xx or throttling signal
    #[error("Transient error: {0}")]
    Transient(String),

    /// Credentials rejected by the provider or unavailable
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Non-retryable provider response (malformed request, conflict, ...)
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Local and remote digests differ
    #[error("Checksum mismatch on object {object_index}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        object_index: usize,
        expected: String,
        actual: String,
    },

    /// The provider committed a different number of bytes than were sent
    #[error("Size mismatch on object {object_index}: sent {expected} bytes, provider committed {actual}")]
    SizeMismatch {
        object_index: usize,
        expected: u64,
        actual: u64,
    },

    #[error("Retries exhausted for {scope} after {attempts} attempts (chunk {chunk_index:?}): {source}")]
    RetryExhausted {
        scope: RetryScope,
        chunk_index: Option<usize>,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// `abort()` itself failed; never replaces the error that caused the abort
    #[error("Failed to clean up partial object {object_index}: {source}")]
    PartialObjectCleanup {
        object_index: usize,
        #[source]
        source: Box<Error>,
    },

    /// Commit was requested on an upload already aborted
    #[error("Upload session is closed: {0}")]
    SessionClosed(String),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    General(String),
}

impl Error {
    /// Whether the error may succeed when the operation is repeated
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Short machine-readable name of the error class
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::EmptyFile(_) => "empty_file",
            Error::InvalidChunkSize { .. } => "invalid_chunk_size",
            Error::Transient(_) => "transient",
            Error::Auth(_) => "auth",
            Error::NotFound(_) => "not_found",
            Error::Provider(_) => "provider",
            Error::InvalidLocator(_) => "invalid_locator",
            Error::Config(_) => "config",
            Error::ChecksumMismatch { .. } => "checksum_mismatch",
            Error::SizeMismatch { .. } => "size_mismatch",
            Error::RetryExhausted { .. } => "retry_exhausted",
            Error::PartialObjectCleanup { .. } => "partial_object_cleanup",
            Error::SessionClosed(_) => "session_closed",
            Error::Cancelled => "cancelled",
            Error::Io(_) => "io",
            Error::General(_) => "general",
        }
    }
}

/// Direction of a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// Final, classified failure of an upload or download session
///
/// `source` is the error that ended the session. Cleanup failures raised while
/// aborting remote objects are kept separately in `cleanup`.
#[derive(Debug, thiserror::Error)]
#[error("{direction} via {provider} failed (object {object_index:?}, chunk {chunk_index:?}): {source}")]
pub struct TransferError {
    pub provider: Provider,
    pub direction: Direction,
    pub object_index: Option<usize>,
    pub chunk_index: Option<usize>,
    #[source]
    pub source: Error,
    pub cleanup: Vec<Error>,
}

impl TransferError {
    pub fn new(provider: Provider, direction: Direction, source: Error) -> Self {
        Self {
            provider,
            direction,
            object_index: None,
            chunk_index: None,
            source,
            cleanup: Vec::new(),
        }
    }

    pub fn at_object(mut self, object_index: usize) -> Self {
        self.object_index = Some(object_index);
        self
    }

    pub fn at_chunk(mut self, chunk_index: Option<usize>) -> Self {
        if chunk_index.is_some() {
            self.chunk_index = chunk_index;
        }
        self
    }

    /// The error that ended the session
    pub fn kind(&self) -> &Error {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("503".to_string()).is_transient());
        assert!(Error::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_transient());
        assert!(!Error::Auth("denied".to_string()).is_transient());
        assert!(
            !Error::ChecksumMismatch {
                object_index: 0,
                expected: "a".to_string(),
                actual: "b".to_string(),
            }
            .is_transient()
        );
        assert!(!Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_transient());
    }

    #[test]
    fn test_retry_exhausted_keeps_cause() {
        let err = Error::RetryExhausted {
            scope: RetryScope::Chunk,
            chunk_index: Some(3),
            attempts: 4,
            source: Box::new(Error::Transient("timeout".to_string())),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("timeout"));
        assert!(err.to_string().contains("chunk"));
    }

    #[test]
    fn test_transfer_error_context() {
        let err = TransferError::new(
            Provider::Google,
            Direction::Upload,
            Error::Transient("boom".to_string()),
        )
        .at_object(1)
        .at_chunk(Some(7));
        assert_eq!(err.object_index, Some(1));
        assert_eq!(err.chunk_index, Some(7));
        assert_eq!(err.kind().kind_name(), "transient");
        assert!(err.to_string().contains("upload via google"));
    }
}
