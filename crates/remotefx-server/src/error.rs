//! Error types for the session engine

use remotefx_protocol::ProtocolError;
use thiserror::Error;

/// Failure to capture an editor surface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Editor surface no longer exists")]
    SurfaceGone,

    #[error("Editor is not on screen")]
    NotShown,

    #[error("Capture failed: {0}")]
    Failed(String),
}

/// A processor failed while rendering one buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct RenderError {
    pub reason: String,
}

impl RenderError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A processor rejected a state blob.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Failed to restore processor state: {0}")]
pub struct StateError(pub String);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Failed to load plugin {identifier}: {reason}")]
    PluginInstantiation { identifier: String, reason: String },

    #[error("Processor {index} failed to render: {reason}")]
    Render { index: usize, reason: String },

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid index {index} (size {len})")]
    InvalidIndex { index: usize, len: usize },
}

impl ServerError {
    pub fn instantiation(identifier: impl Into<String>, reason: impl Into<String>) -> Self {
        ServerError::PluginInstantiation {
            identifier: identifier.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error ends the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::Protocol(_) | ServerError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
