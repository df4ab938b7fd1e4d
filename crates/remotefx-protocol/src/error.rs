//! Error types for the wire protocol

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown message type tag: {0}")]
    UnknownTag(u32),

    #[error("Payload of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },

    #[error("Unexpected {got} message (expected {expected})")]
    UnexpectedMessage {
        got: &'static str,
        expected: &'static str,
    },

    #[error("Unsupported protocol version {got} (expected {expected})")]
    VersionMismatch { got: u32, expected: u32 },

    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("Audio format mismatch: {0}")]
    FormatMismatch(String),

    #[error("Timeout after {duration_ms}ms: {operation}")]
    Timeout {
        operation: &'static str,
        duration_ms: u64,
    },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Transport-level failures (as opposed to a peer speaking garbage).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::ConnectionClosed | ProtocolError::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
