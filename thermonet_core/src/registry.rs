//! Local-cloud registry collaborator.
//!
//! Systems register themselves and the services they provide; consumers
//! are bound to providers by orchestration rules. Controllers resolve their
//! `temperature` and `actuator` providers through [`LocalCloud::orchestrate`].

use crate::devices::DeviceConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Service definition provided by temperature sensors.
pub const TEMPERATURE_SERVICE: &str = "temperature";

/// Service definition provided by actuators.
pub const ACTUATOR_SERVICE: &str = "actuator";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    #[error("No available services for '{service}' (consumer '{consumer}')")]
    NoAvailableServices { consumer: String, service: String },

    #[error("Unknown system '{0}'")]
    UnknownSystem(String),

    #[error("Unknown orchestration rule {0}")]
    UnknownRule(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SystemRecord {
    pub system_name: String,
    pub address: String,
    pub port: u16,
}

impl From<&DeviceConfig> for SystemRecord {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            system_name: config.system_name.clone(),
            address: config.address.clone(),
            port: config.port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessPolicy {
    NotSecure,
    Certificate,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub service_definition: String,
    pub service_uri: String,
    pub method: ServiceMethod,
    pub access_policy: AccessPolicy,
    pub provider: SystemRecord,
}

impl ServiceRecord {
    /// The `temperature` service of a sensor.
    pub fn temperature(provider: SystemRecord) -> Self {
        Self {
            service_definition: TEMPERATURE_SERVICE.to_string(),
            service_uri: "/temperature".to_string(),
            method: ServiceMethod::Get,
            access_policy: AccessPolicy::NotSecure,
            provider,
        }
    }

    /// The `actuator` service of an actuator.
    pub fn actuator(provider: SystemRecord) -> Self {
        Self {
            service_definition: ACTUATOR_SERVICE.to_string(),
            service_uri: "/actuation".to_string(),
            method: ServiceMethod::Post,
            access_policy: AccessPolicy::NotSecure,
            provider,
        }
    }
}

/// Binds one consumer to one provider for a service definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationRule {
    pub service_definition: String,
    pub consumer: String,
    pub provider: SystemRecord,
}

#[async_trait]
pub trait LocalCloud: Send + Sync {
    async fn register_system(&self, system: SystemRecord) -> Result<(), RegistryError>;

    async fn register_service(&self, service: ServiceRecord) -> Result<(), RegistryError>;

    /// Returns the rule id.
    async fn add_orchestration_rule(&self, rule: OrchestrationRule) -> Result<u64, RegistryError>;

    async fn remove_orchestration_rule(&self, id: u64) -> Result<(), RegistryError>;

    /// Resolves the provider bound to `consumer` for `service`.
    async fn orchestrate(&self, consumer: &str, service: &str) -> Result<SystemRecord, RegistryError>;
}
