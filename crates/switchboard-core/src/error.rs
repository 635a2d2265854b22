//! Error types
//!
//! Each concern gets its own `thiserror` enum so callers can tell a
//! recoverable per-message failure apart from one that ends a connection.
//! [`ProxyError`] is the crate-level error returned by the server.

use thiserror::Error;

/// Errors produced while framing or unframing line-delimited JSON
#[derive(Debug, Error)]
pub enum CodecError {
    /// The underlying stream failed; the connection is unusable
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A complete line arrived but was not valid JSON (or not UTF-8)
    #[error("Malformed frame: {reason}")]
    Malformed { reason: String, line: String },

    /// A line exceeded the configured frame limit and was discarded
    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// Outbound value could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CodecError {
    /// Whether the reader can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CodecError::Malformed { .. } | CodecError::FrameTooLarge { .. }
        )
    }
}

/// Application message that parsed as JSON but broke the message contract
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Missing message type")]
    MissingType,

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Invalid '{kind}' message: {reason}")]
    Invalid { kind: String, reason: String },
}

/// Why a tool name could not be routed to a connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("ambiguous tool name '{name}'; use one of: {}", candidates.join(", "))]
    Ambiguous {
        name: String,
        candidates: Vec<String>,
    },
}

/// Server-level errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Failed to bind application listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent channel failed: {0}")]
    AgentChannel(#[source] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ProxyError>;
