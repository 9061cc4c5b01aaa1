//! Session hub: one engine-side session per connected device.

use crate::context::SimContext;
use std::sync::Arc;
use thermonet_core::session::SessionStats;
use thermonet_core::{AgentSession, EngineHandle, SessionError};
use thermonet_env::{AgentTransport, ChannelTransport};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Per-connection buffer; devices keep at most one request in flight.
const LINK_CAPACITY: usize = 8;

/// Totals over every session the hub served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubReport {
    pub sessions: usize,
    pub requests: u64,
    pub rejected: u64,
    /// Sessions closed by a malformed message
    pub protocol_closures: usize,
    /// Names of the agents whose sessions closed on a protocol error
    pub closed_agents: Vec<String>,
}

pub struct SessionHub {
    engine: EngineHandle,
    ctx: Arc<SimContext>,
    sessions: JoinSet<(String, Result<SessionStats, SessionError>)>,
    connected: usize,
}

impl SessionHub {
    pub fn new(engine: EngineHandle, ctx: Arc<SimContext>) -> Self {
        Self {
            engine,
            ctx,
            sessions: JoinSet::new(),
            connected: 0,
        }
    }

    /// Opens a connection for `agent` and returns the device end.
    pub fn connect(&mut self, agent: &str) -> ChannelTransport {
        let (device, end) = ChannelTransport::pair(LINK_CAPACITY);
        debug!("hub: {} connected as {}", agent, end.local_id());

        let session = AgentSession::new(end, self.engine.clone(), self.ctx.clone());
        let name = agent.to_string();
        self.sessions.spawn(async move { (name, session.run().await) });
        self.connected += 1;
        device
    }

    pub fn connected(&self) -> usize {
        self.connected
    }

    /// Waits for every session to end.
    ///
    /// Sessions end once their device hangs up or the engine stops.
    pub async fn join(mut self) -> HubReport {
        let mut report = HubReport {
            sessions: self.connected,
            ..HubReport::default()
        };
        while let Some(joined) = self.sessions.join_next().await {
            match joined {
                Ok((_, Ok(stats))) => {
                    report.requests += stats.requests;
                    report.rejected += stats.rejected;
                }
                Ok((agent, Err(SessionError::Protocol(e)))) => {
                    debug!("hub: {} dropped for {}", agent, e);
                    report.protocol_closures += 1;
                    report.closed_agents.push(agent);
                }
                Ok((agent, Err(e))) => warn!("hub: session {} failed: {}", agent, e),
                Err(e) => warn!("hub: session task panicked: {}", e),
            }
        }
        report.closed_agents.sort();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thermonet_core::wire::{EngineReply, FlatMessage};
    use thermonet_core::{BuildingConfig, EngineConfig, SimulationEngine};
    use thermonet_env::MessageEnvelope;

    #[tokio::test(start_paused = true)]
    async fn test_hub_counts_protocol_closures() {
        let ctx = SimContext::shared(1);
        let engine =
            SimulationEngine::from_building(&BuildingConfig::demo(), ctx.clone(), EngineConfig::default())
                .unwrap();
        let mut hub = SessionHub::new(engine.handle(), ctx);

        let good = hub.connect("A11_controller");
        let bad = hub.connect("rogue");
        assert_eq!(hub.connected(), 2);

        let query = FlatMessage::new("A11", "controller").encode().unwrap();
        good.send(MessageEnvelope::new(query, 0)).await.unwrap();
        let reply = good.recv().await.unwrap();
        assert!(matches!(
            EngineReply::decode(&reply.payload).unwrap(),
            EngineReply::Setpoint { .. }
        ));

        bad.send(MessageEnvelope::new(b"not json".to_vec(), 0))
            .await
            .unwrap();
        assert!(bad.recv().await.is_none());

        drop(good);
        let report = hub.join().await;
        assert_eq!(report.sessions, 2);
        assert_eq!(report.requests, 1);
        assert_eq!(report.protocol_closures, 1);
        assert_eq!(report.closed_agents, vec!["rogue".to_string()]);
    }
}
