//! Production implementations backed by Tokio.

use crate::{AgentId, AgentTransport, EnvError, MessageEnvelope, ThermoContext};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Production context backed by Tokio and OS entropy.
pub struct TokioContext {
    /// Start time for monotonic duration calculations
    start: Instant,
}

impl TokioContext {
    /// Creates a new TokioContext.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Creates an Arc-wrapped context for sharing across tasks.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for TokioContext {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ThermoContext for TokioContext {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn<F>(&self, _name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn derive_seed(&self, _extension: u64) -> u64 {
        rand::random()
    }

    fn seed(&self) -> u64 {
        // Production is not seeded
        0
    }
}

/// One end of an in-process, mpsc-backed agent connection.
pub struct ChannelTransport {
    /// This end's ID
    local_id: AgentId,

    /// Sender towards the peer
    tx: mpsc::Sender<MessageEnvelope>,

    /// Receiver for messages from the peer (behind tokio mutex for async)
    rx: tokio::sync::Mutex<mpsc::Receiver<MessageEnvelope>>,
}

impl ChannelTransport {
    /// Creates both ends of a connection with the given buffer capacity.
    ///
    /// Returns `(device_end, session_end)`.
    pub fn pair(capacity: usize) -> (Self, Self) {
        Self::pair_with_ids(AgentId::new(), AgentId::new(), capacity)
    }

    /// Like [`Self::pair`], with explicit endpoint IDs.
    pub fn pair_with_ids(device: AgentId, session: AgentId, capacity: usize) -> (Self, Self) {
        let (to_session, from_device) = mpsc::channel(capacity);
        let (to_device, from_session) = mpsc::channel(capacity);

        let device_end = Self {
            local_id: device,
            tx: to_session,
            rx: tokio::sync::Mutex::new(from_session),
        };
        let session_end = Self {
            local_id: session,
            tx: to_device,
            rx: tokio::sync::Mutex::new(from_device),
        };
        (device_end, session_end)
    }
}

#[async_trait]
impl AgentTransport for ChannelTransport {
    async fn send(&self, envelope: MessageEnvelope) -> Result<(), EnvError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| EnvError::closed(format!("peer of {} hung up", self.local_id)))
    }

    async fn recv(&self) -> Option<MessageEnvelope> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn local_id(&self) -> AgentId {
        self.local_id
    }
}
