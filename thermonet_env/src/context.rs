//! Core environment context trait for thermonet agents and the engine.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// Abstracts the clock, task spawning and entropy so that the simulation
/// engine and the device agents run unchanged against a real tokio runtime
/// or against the deterministic harness in `thermonet_sim`.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wall clock, OS entropy
/// - **Simulation**: `SimContext` - paused tokio clock, seeded entropy
#[async_trait]
pub trait ThermoContext: Send + Sync + 'static {
    /// Returns the time elapsed since the context was created.
    ///
    /// In simulation, this is virtual time.
    fn now(&self) -> Duration;

    /// Suspends the caller for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Derives a seed for a component-local RNG.
    ///
    /// The simulation combines its master seed with `extension` so every
    /// sensor gets a distinct but reproducible noise stream. Production
    /// returns fresh entropy each call.
    fn derive_seed(&self, extension: u64) -> u64;

    /// Returns the context's master seed (0 when not seeded).
    fn seed(&self) -> u64;
}
