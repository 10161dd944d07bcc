//! Frames for the credit-based socket transport.
//!
//! A socket session starts with [`Frame::Setup`] followed by one
//! [`Frame::RequestStream`]. The server answers with [`Frame::Payload`]
//! frames, each consuming one unit of credit; the client grants more with
//! [`Frame::RequestN`].

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// One frame on the socket transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Connection setup, sent once by the client.
    Setup {
        /// Bearer token.
        token: String,
        /// Client identification.
        user_agent: String,
        /// Interval at which the server sends keepalive frames.
        keepalive_ms: u64,
        /// Maximum time without any frame before the connection is stale.
        lifetime_ms: u64,
    },
    /// Opens the sync stream with an initial credit.
    RequestStream {
        /// Number of payload frames the server may send before waiting.
        initial_credit: u32,
        /// JSON-encoded streaming sync request.
        payload: Vec<u8>,
    },
    /// Grants additional credit.
    RequestN {
        /// Credit to add.
        n: u32,
    },
    /// One CBOR-encoded sync line.
    Payload {
        /// Encoded line.
        data: Vec<u8>,
        /// Whether this is the final payload of the stream.
        complete: bool,
    },
    /// Liveness signal. Carries no data and consumes no credit.
    KeepAlive,
    /// The server finished the stream.
    Complete,
    /// The server failed the stream.
    Error {
        /// Application error code.
        code: u32,
        /// Human readable message.
        message: String,
    },
    /// The client cancels the stream.
    Cancel,
}

impl Frame {
    /// Encodes the frame as CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes a CBOR frame.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
    }

    /// Returns true if this frame ends the stream, successfully or not.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Frame::Complete | Frame::Error { .. } | Frame::Cancel | Frame::Payload { complete: true, .. }
        )
    }
}
