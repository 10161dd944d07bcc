//! Error types for protocol encoding and decoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A JSON line or body could not be parsed.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A CBOR payload could not be encoded or decoded.
    #[error("invalid CBOR: {0}")]
    Cbor(String),

    /// An op id was not a non-negative 64-bit integer.
    #[error("invalid op id: {0:?}")]
    InvalidOpId(String),

    /// An op name was not recognized.
    #[error("unknown op type: {0:?}")]
    UnknownOpType(String),

    /// A socket frame was malformed.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl ProtocolError {
    /// Creates a CBOR error from any displayable source.
    pub fn cbor(err: impl std::fmt::Display) -> Self {
        Self::Cbor(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::InvalidOpId("-3".into());
        assert_eq!(err.to_string(), "invalid op id: \"-3\"");

        let err = ProtocolError::cbor("unexpected end of input");
        assert!(err.to_string().contains("unexpected end"));
    }
}
