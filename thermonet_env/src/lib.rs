//! thermonet Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seam that lets the thermonet engine and
//! device agents run in both **Production** (tokio wall clock) and
//! **Simulation** (paused, auto-advancing clock) environments.
//!
//! # Core Concept
//!
//! Everything that would make a run irreproducible goes through a trait:
//! - Time (`now()`, `sleep()`)
//! - Agent connections (`send()`, `recv()`)
//! - Randomness (`derive_seed()`)
//!
//! # Example
//!
//! ```ignore
//! use thermonet_env::{ThermoContext, AgentTransport};
//!
//! async fn device_loop<Ctx: ThermoContext, T: AgentTransport>(ctx: &Ctx, link: &T) {
//!     loop {
//!         tokio::select! {
//!             msg = link.recv() => handle(msg),
//!             _ = ctx.sleep(Duration::from_secs(10)) => retry(),
//!         }
//!     }
//! }
//! ```

mod context;
mod transport;
mod types;
mod error;
mod tokio_impl;

pub use context::ThermoContext;
pub use transport::AgentTransport;
pub use types::{AgentId, MessageEnvelope};
pub use error::EnvError;
pub use tokio_impl::{ChannelTransport, TokioContext};
