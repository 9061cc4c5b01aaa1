//! Engine-side session for one connected device.
//!
//! Each inbound message is normalized, dispatched by role and answered
//! with exactly one flat [`EngineReply`]:
//!
//! | role | engine call | reply |
//! |------|-------------|-------|
//! | sensor | `submit_measurement` | `{"temp","setpoint","timestep"}` |
//! | actuator | `submit_actuation` | `{"status":true,"timestep"}` |
//! | controller | `query_setpoint` | `{"setpoint","timestep"}` |
//!
//! Unknown rooms are answered with `{"status":false}`. A malformed message
//! closes this session only.

use crate::building::Subsystem;
use crate::engine::{EngineHandle, SetpointReply, SubmitError};
use crate::reading::{ProtocolError, Reading, ReadingNormalizer, Role, Unit};
use crate::wire::{EncodeError, EngineReply};
use std::sync::Arc;
use thermonet_env::{AgentTransport, EnvError, MessageEnvelope, ThermoContext};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Engine cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[from] EnvError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Counters kept over a session's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests: u64,
    pub rejected: u64,
}

pub struct AgentSession<T: AgentTransport, C: ThermoContext> {
    transport: T,
    engine: EngineHandle,
    ctx: Arc<C>,
    normalizer: ReadingNormalizer,
    stats: SessionStats,
}

impl<T: AgentTransport, C: ThermoContext> AgentSession<T, C> {
    pub fn new(transport: T, engine: EngineHandle, ctx: Arc<C>) -> Self {
        Self {
            transport,
            engine,
            ctx,
            normalizer: ReadingNormalizer::new(),
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Serves requests until the peer hangs up or the engine stops.
    pub async fn run(mut self) -> Result<SessionStats, SessionError> {
        let peer = self.transport.local_id();
        let engine = self.engine.clone();
        loop {
            let envelope = tokio::select! {
                msg = self.transport.recv() => msg,
                _ = engine.cancelled() => None,
            };
            let Some(envelope) = envelope else {
                debug!("session {}: closed after {} requests", peer, self.stats.requests);
                return Ok(self.stats);
            };

            let reply = match self.handle_message(&envelope.payload).await {
                Ok(reply) => reply,
                Err(SessionError::Cancelled) => return Ok(self.stats),
                Err(e) => {
                    warn!("session {}: {}; closing", peer, e);
                    return Err(e);
                }
            };

            let now_ms = self.ctx.now().as_millis() as u64;
            self.transport
                .send(MessageEnvelope::new(reply.encode()?, now_ms))
                .await?;
        }
    }

    /// Normalizes one payload and performs the engine call for its role.
    pub async fn handle_message(&mut self, payload: &[u8]) -> Result<EngineReply, SessionError> {
        let reading = self.normalizer.normalize(payload)?;
        self.stats.requests += 1;

        let outcome = match reading.role {
            Role::Sensor => self.measure(&reading).await,
            Role::Actuator => self.actuate(&reading).await,
            Role::Controller => Ok(self.query(&reading)),
        };

        match outcome {
            Ok(reply) => {
                if reply == EngineReply::rejected(reply.timestep()) {
                    self.stats.rejected += 1;
                }
                Ok(reply)
            }
            Err(SubmitError::UnknownEntity { room, subsystem }) => {
                debug!("rejecting {} for unknown ({}, {})", reading.agent_id, room, subsystem);
                self.stats.rejected += 1;
                Ok(EngineReply::rejected(self.engine.timestep()))
            }
            Err(SubmitError::Protocol(e)) => Err(e.into()),
            Err(SubmitError::Cancelled) => Err(SessionError::Cancelled),
        }
    }

    async fn measure(&self, reading: &Reading) -> Result<EngineReply, SubmitError> {
        let subsystem = require_subsystem(reading)?;
        let ack = self
            .engine
            .submit_measurement(&reading.room_id, subsystem, reading)
            .await?;
        Ok(EngineReply::Measurement {
            temp: ack.temperature,
            setpoint: ack.setpoint,
            timestep: ack.timestep,
        })
    }

    async fn actuate(&self, reading: &Reading) -> Result<EngineReply, SubmitError> {
        let subsystem = require_subsystem(reading)?;
        if reading.unit != Some(Unit::Watt) {
            return Err(ProtocolError::UnitNotAllowed {
                unit: reading.unit.map(|u| u.tag()).unwrap_or("none").to_string(),
                role: reading.role,
            }
            .into());
        }
        let value = reading.value.ok_or(ProtocolError::MissingField("value"))?;
        let ack = self
            .engine
            .submit_actuation(&reading.room_id, subsystem, value)
            .await?;
        Ok(EngineReply::Status {
            status: true,
            timestep: ack.timestep,
        })
    }

    fn query(&self, reading: &Reading) -> EngineReply {
        match self.engine.query_setpoint(&reading.room_id) {
            SetpointReply::Setpoint { setpoint, timestep } => {
                EngineReply::Setpoint { setpoint, timestep }
            }
            SetpointReply::Rejected { timestep } => EngineReply::rejected(timestep),
        }
    }
}

fn require_subsystem(reading: &Reading) -> Result<Subsystem, ProtocolError> {
    reading.subsystem.ok_or(ProtocolError::MissingField("subsystem"))
}
