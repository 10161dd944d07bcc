//! Error types for the sync engine.

use bucketsync_protocol::ProtocolError;
use bucketsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The service violated the sync protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The service rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Non-success HTTP response.
    #[error("http {status}: {message}")]
    Http {
        /// Response status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Local storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The connector failed to upload local writes.
    #[error("upload error: {0}")]
    Upload(String),

    /// The connector could not provide credentials.
    #[error("credentials unavailable: {0}")]
    Credentials(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Creates an upload error.
    pub fn upload(message: impl Into<String>) -> Self {
        Self::Upload(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::AuthenticationFailed(_) => true,
            SyncError::Http { status, .. } => *status >= 500 || *status == 429,
            SyncError::Upload(_) => true,
            SyncError::Credentials(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error is the result of an intentional
    /// disconnect.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::AuthenticationFailed("expired".into()).is_retryable());
        assert!(SyncError::Http {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!SyncError::Http {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::protocol("diff before checkpoint").is_retryable());
    }

    #[test]
    fn cancellation_is_distinct() {
        assert!(SyncError::Cancelled.is_cancelled());
        assert!(!SyncError::Timeout.is_cancelled());
    }

    #[test]
    fn error_display() {
        let err = SyncError::upload("rejected");
        assert_eq!(err.to_string(), "upload error: rejected");

        let err = SyncError::Http {
            status: 404,
            message: "no such route".into(),
        };
        assert_eq!(err.to_string(), "http 404: no such route");

        let err: SyncError = StoreError::Closed.into();
        assert!(matches!(err, SyncError::Storage(_)));

        let err: SyncError = ProtocolError::InvalidFrame("short".into()).into();
        assert!(matches!(err, SyncError::Codec(_)));
    }
}
