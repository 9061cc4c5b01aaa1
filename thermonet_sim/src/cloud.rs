//! In-memory local cloud and orchestrated service proxies.
//!
//! Controllers never hold their sensor or actuator directly. Every call goes
//! through [`Orchestrated`], which asks the cloud for the provider bound to
//! the controller on that call, so removing an orchestration rule takes the
//! service away mid-run.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thermonet_core::registry::{
    OrchestrationRule, ACTUATOR_SERVICE, TEMPERATURE_SERVICE,
};
use thermonet_core::{
    ActuationService, LocalCloud, MeasurementService, RegistryError, ServiceError, ServiceRecord,
    SystemRecord,
};
use tracing::debug;

#[derive(Default)]
struct CloudTables {
    systems: BTreeMap<String, SystemRecord>,
    services: Vec<ServiceRecord>,
    rules: BTreeMap<u64, OrchestrationRule>,
    next_rule: u64,
}

/// Registry backed by mutex-guarded tables.
#[derive(Default)]
pub struct InMemoryCloud {
    tables: Mutex<CloudTables>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn system_count(&self) -> usize {
        self.tables.lock().unwrap().systems.len()
    }

    pub fn service_count(&self) -> usize {
        self.tables.lock().unwrap().services.len()
    }

    pub fn rule_count(&self) -> usize {
        self.tables.lock().unwrap().rules.len()
    }
}

#[async_trait]
impl LocalCloud for InMemoryCloud {
    async fn register_system(&self, system: SystemRecord) -> Result<(), RegistryError> {
        let mut tables = self.tables.lock().unwrap();
        debug!("registered system {}", system.system_name);
        tables.systems.insert(system.system_name.clone(), system);
        Ok(())
    }

    async fn register_service(&self, service: ServiceRecord) -> Result<(), RegistryError> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.systems.contains_key(&service.provider.system_name) {
            return Err(RegistryError::UnknownSystem(service.provider.system_name));
        }
        // Re-registering replaces
        tables.services.retain(|s| {
            !(s.service_definition == service.service_definition && s.provider == service.provider)
        });
        tables.services.push(service);
        Ok(())
    }

    async fn add_orchestration_rule(&self, rule: OrchestrationRule) -> Result<u64, RegistryError> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.systems.contains_key(&rule.provider.system_name) {
            return Err(RegistryError::UnknownSystem(rule.provider.system_name));
        }
        let offered = tables
            .services
            .iter()
            .any(|s| s.service_definition == rule.service_definition && s.provider == rule.provider);
        if !offered {
            return Err(RegistryError::NoAvailableServices {
                consumer: rule.consumer,
                service: rule.service_definition,
            });
        }

        let id = tables.next_rule;
        tables.next_rule += 1;
        debug!(
            "rule {}: {} -> {} ({})",
            id, rule.consumer, rule.provider.system_name, rule.service_definition
        );
        tables.rules.insert(id, rule);
        Ok(id)
    }

    async fn remove_orchestration_rule(&self, id: u64) -> Result<(), RegistryError> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .rules
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::UnknownRule(id))
    }

    async fn orchestrate(&self, consumer: &str, service: &str) -> Result<SystemRecord, RegistryError> {
        let tables = self.tables.lock().unwrap();
        tables
            .rules
            .values()
            .find(|r| r.consumer == consumer && r.service_definition == service)
            .map(|r| r.provider.clone())
            .ok_or_else(|| RegistryError::NoAvailableServices {
                consumer: consumer.to_string(),
                service: service.to_string(),
            })
    }
}

/// Providers of one capability, keyed by system name.
pub type ProviderMap<S> = BTreeMap<String, Arc<S>>;

/// A service resolved through the cloud on every call.
pub struct Orchestrated<S: ?Sized> {
    consumer: String,
    service: &'static str,
    cloud: Arc<dyn LocalCloud>,
    providers: Arc<ProviderMap<S>>,
}

impl<S: ?Sized> Orchestrated<S> {
    async fn resolve(&self) -> Result<Arc<S>, ServiceError> {
        let provider = self
            .cloud
            .orchestrate(&self.consumer, self.service)
            .await
            .map_err(|_| ServiceError::Unavailable(self.service.to_string()))?;
        self.providers
            .get(&provider.system_name)
            .cloned()
            .ok_or_else(|| ServiceError::Unavailable(self.service.to_string()))
    }
}

impl Orchestrated<dyn MeasurementService> {
    /// The `temperature` service as seen by `consumer`.
    pub fn temperature(
        consumer: impl Into<String>,
        cloud: Arc<dyn LocalCloud>,
        providers: Arc<ProviderMap<dyn MeasurementService>>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            service: TEMPERATURE_SERVICE,
            cloud,
            providers,
        }
    }
}

impl Orchestrated<dyn ActuationService> {
    /// The `actuator` service as seen by `consumer`.
    pub fn actuator(
        consumer: impl Into<String>,
        cloud: Arc<dyn LocalCloud>,
        providers: Arc<ProviderMap<dyn ActuationService>>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            service: ACTUATOR_SERVICE,
            cloud,
            providers,
        }
    }
}

#[async_trait]
impl MeasurementService for Orchestrated<dyn MeasurementService> {
    async fn read(&self) -> Result<Vec<u8>, ServiceError> {
        self.resolve().await?.read().await
    }
}

#[async_trait]
impl ActuationService for Orchestrated<dyn ActuationService> {
    async fn actuate(&self, payload: &[u8]) -> Result<(), ServiceError> {
        self.resolve().await?.actuate(payload).await
    }
}
