//! Error types for the thermonet environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The peer end of the connection is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Target agent is unreachable
    #[error("Agent unreachable: {0}")]
    Unreachable(String),

    /// Payload encoding/decoding failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a channel-closed error.
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::ChannelClosed(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(agent: impl std::fmt::Display) -> Self {
        Self::Unreachable(agent.to_string())
    }
}
