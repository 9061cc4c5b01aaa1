//! Agent transport abstraction: one bidirectional channel per connection.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{AgentId, MessageEnvelope};

/// Bidirectional message channel between a device agent and the engine.
///
/// Each connected device owns one end; the engine-side `AgentSession` owns
/// the other. Payloads are opaque bytes (either wire encoding) and are
/// decoded by the receiving side.
///
/// ```text
/// Device                   Transport                 AgentSession
///   |-- send(request) -------->|                          |
///   |                          |------------------------->|-- recv()
///   |                          |<-------------------------|-- send(reply)
///   |-- recv() -> reply <------|                          |
/// ```
#[async_trait]
pub trait AgentTransport: Send + Sync + 'static {
    /// Sends one message to the peer.
    ///
    /// # Returns
    /// * `Ok(())` - Message queued for delivery
    /// * `Err(EnvError::ChannelClosed)` - The peer hung up
    async fn send(&self, envelope: MessageEnvelope) -> Result<(), EnvError>;

    /// Receives the next message from the peer.
    ///
    /// Returns `None` once the peer has closed its end.
    async fn recv(&self) -> Option<MessageEnvelope>;

    /// Returns this end's identifier.
    fn local_id(&self) -> AgentId;
}
