//! Error types for the local store.

use bucketsync_protocol::ProtocolError;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// The journal or a table is inconsistent.
    #[error("store corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// A journal record could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// A `PUT` payload was not a JSON object.
    #[error("invalid row data for {object_type}/{object_id}")]
    InvalidRowData {
        /// Table of the offending entry.
        object_type: String,
        /// Id of the offending entry.
        object_id: String,
    },

    /// A local write named a table that cannot hold rows.
    #[error("invalid table name: {name:?}")]
    InvalidTable {
        /// The rejected name.
        name: String,
    },

    /// The store has been closed.
    #[error("store is closed")]
    Closed,

    /// Wire data could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl StoreError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }

    /// Creates a codec error from any displayable source.
    pub fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec {
            message: err.to_string(),
        }
    }

    /// Creates an invalid table error.
    pub fn invalid_table(name: impl Into<String>) -> Self {
        Self::InvalidTable { name: name.into() }
    }
}
