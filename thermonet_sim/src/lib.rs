//! thermonet Deterministic Simulation Harness
//!
//! Boots a whole building (engine, sessions, device fleet, local cloud)
//! inside one current-thread tokio runtime with a paused clock, then drives
//! it tick by tick through fault scenarios.
//!
//! # Core Principle: nothing moves unless everyone waits
//!
//! All sources of non-determinism are controlled:
//! - **Time**: the paused clock advances only when every task is blocked
//! - **Scheduling**: one runtime thread, tasks interleave in a fixed order
//! - **Randomness**: sensor noise and fault victims derive from one seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ tokio current_thread runtime (paused clock)                  │
//! │                                                              │
//! │   ScenarioRunner ── step() ──► SimulationEngine              │
//! │         │                          ▲  read / update barrier  │
//! │         │ cut / restore rules      │                         │
//! │         ▼                     AgentSession × N               │
//! │   InMemoryCloud                    ▲   (SessionHub)          │
//! │         ▲ orchestrate              │ ChannelTransport        │
//! │         │                          │                         │
//! │   Controller ──► Sensor / Actuator ─┘     Rogue agents       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use thermonet_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42)
//!     .with_ticks(30)
//!     .run(ScenarioId::ActuatorOutage);
//! assert!(result.passed);
//! ```

mod cloud;
mod context;
mod error;
mod fleet;
mod hub;
mod rogue;
mod runner;
pub mod scenarios;

pub use cloud::{InMemoryCloud, Orchestrated, ProviderMap};
pub use context::SimContext;
pub use error::SimError;
pub use fleet::{ControllerOutcome, Fleet, FleetOptions};
pub use hub::{HubReport, SessionHub};
pub use rogue::{spawn_rogue, RogueBehavior};
pub use runner::{outage_window, ScenarioMetrics, ScenarioResult, ScenarioRunner};
