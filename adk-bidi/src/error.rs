//! Error types for the bidi bridge.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionState;

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BidiError>;

/// Errors that can occur while bridging a duplex session.
#[derive(Error, Debug)]
pub enum BidiError {
    /// A client transport read or write failed.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The backend connection could not be established or was lost.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Session already closed.
    #[error("Session closed")]
    SessionClosed,

    /// The bridge is already driving a session.
    #[error("A session is already active on this bridge")]
    SessionActive,

    /// A session state change that would move backwards.
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: SessionState,
        /// Requested state.
        to: SessionState,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    /// Audio format error.
    #[error("Audio format error: {0}")]
    AudioFormatError(String),

    /// Tool execution error.
    #[error("Tool execution error: {0}")]
    ToolError(String),

    /// A referenced input file does not exist.
    #[error("Missing resource: {}", path.display())]
    MissingResource {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// Malformed message from a peer.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BidiError {
    /// Create a new transport error.
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::TransportError(msg.into())
    }

    /// Create a new connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Create a new audio format error.
    pub fn audio<S: Into<String>>(msg: S) -> Self {
        Self::AudioFormatError(msg.into())
    }

    /// Create a new tool error.
    pub fn tool<S: Into<String>>(msg: S) -> Self {
        Self::ToolError(msg.into())
    }

    /// Create a new protocol error.
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a missing-resource error for `path`.
    pub fn missing(path: impl Into<PathBuf>) -> Self {
        Self::MissingResource { path: path.into() }
    }

    /// Whether this error reports an absent input file.
    pub fn is_missing_resource(&self) -> bool {
        matches!(self, Self::MissingResource { .. })
    }
}
