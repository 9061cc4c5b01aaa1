//! Error types for the simulation harness.

use thermonet_core::{ConfigError, RegistryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The tokio runtime could not be built
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// The building cannot host the requested scenario
    #[error("Scenario error: {0}")]
    Scenario(String),

    #[error("No device binding for '{consumer}' ({service})")]
    UnknownBinding { consumer: String, service: String },
}
