//! Misbehaving agents for fault scenarios.

use crate::context::SimContext;
use crate::hub::SessionHub;
use std::sync::Arc;
use thermonet_core::wire::{EngineReply, FlatMessage};
use thermonet_core::{EngineClient, RoomId, ServiceError, Subsystem};
use thermonet_env::{AgentTransport, MessageEnvelope, ThermoContext};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RogueBehavior {
    /// Sends one payload and waits for the engine to hang up
    Malformed(Vec<u8>),

    /// Reports every read phase and keeps posting the same power
    StuckActuator {
        room: RoomId,
        subsystem: Subsystem,
        watts: f64,
    },
}

/// Connects a rogue agent through `hub` and starts it in the background.
pub fn spawn_rogue(hub: &mut SessionHub, ctx: Arc<SimContext>, name: &str, behavior: RogueBehavior) {
    let link = hub.connect(name);
    let agent = name.to_string();
    match behavior {
        RogueBehavior::Malformed(payload) => {
            ctx.spawn(name, async move {
                if link.send(MessageEnvelope::new(payload, 0)).await.is_err() {
                    return;
                }
                match link.recv().await {
                    None => debug!("{}: engine hung up", agent),
                    Some(reply) => warn!("{}: malformed payload was answered: {:?}", agent, reply.payload),
                }
            });
        }
        RogueBehavior::StuckActuator {
            room,
            subsystem,
            watts,
        } => {
            let client = EngineClient::new(link, ctx.clone());
            ctx.spawn(name, async move {
                let outcome = stuck_actuator(&client, &room, subsystem, watts).await;
                debug!("{}: stopped ({:?})", agent, outcome);
            });
        }
    }
}

async fn stuck_actuator<T: AgentTransport, C: ThermoContext>(
    client: &EngineClient<T, C>,
    room: &RoomId,
    subsystem: Subsystem,
    watts: f64,
) -> Result<(), ServiceError> {
    // Legacy flat shape: `unit` carries the subsystem
    let read = FlatMessage::new(room.as_str(), "sensor")
        .with_unit(subsystem.as_str())
        .encode()?;
    let actuate = FlatMessage::new(room.as_str(), "actuator")
        .with_unit(subsystem.as_str())
        .with_value(watts)
        .encode()?;
    loop {
        match client.request(read.clone()).await? {
            EngineReply::Measurement { .. } => {}
            _ => return Err(ServiceError::UnknownEntity(room.clone())),
        }
        client.request(actuate.clone()).await?;
    }
}
