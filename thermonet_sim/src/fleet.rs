//! Fleet bootstrap: devices per room and family, wired through the cloud.
//!
//! For every room and every active family whose subsystem the room hosts,
//! the fleet deploys a sensor, an actuator and a controller, each on its own
//! engine connection. Sensors and actuators register their services; each
//! controller is bound to its room's pair by two orchestration rules.
//!
//! ```text
//! controller ──orchestrate──► cloud
//!     │ temperature              │ actuator
//!     ▼                          ▼
//!   sensor ── hub ── engine ── hub ── actuator
//! ```

use crate::cloud::{InMemoryCloud, Orchestrated, ProviderMap};
use crate::context::SimContext;
use crate::error::SimError;
use crate::hub::SessionHub;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thermonet_core::registry::{OrchestrationRule, ACTUATOR_SERVICE, TEMPERATURE_SERVICE};
use thermonet_core::{
    ActuationService, Actuator, BuildingConfig, ControlLoop, ControlLoopConfig, ControlStats,
    DeviceConfig, DeviceFamily, DeviceKind, EngineClient, LocalCloud, MeasurementService,
    PIController, RoomId, ServiceError, ServiceRecord, SystemRecord, TemperatureSensor,
};
use thermonet_env::ThermoContext;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// First port of each device kind per family; room `i` adds `i`.
fn port_base(kind: DeviceKind, family: DeviceFamily) -> u16 {
    let base = match kind {
        DeviceKind::TemperatureSensor => 5000,
        DeviceKind::Actuator => 5100,
        DeviceKind::Controller => 5200,
    };
    match family {
        DeviceFamily::A => base,
        DeviceFamily::B => base + 10,
    }
}

#[derive(Debug, Clone)]
pub struct FleetOptions {
    pub families: Vec<DeviceFamily>,
    /// Std-dev (K) of sensor noise; `None` reports exact temperatures
    pub sensor_noise: Option<f64>,
    pub dt_secs: f64,
    pub backoff: Duration,
    /// (room, family) pairs left without devices
    pub skip: Vec<(RoomId, DeviceFamily)>,
}

impl Default for FleetOptions {
    fn default() -> Self {
        Self {
            families: DeviceFamily::ALL.to_vec(),
            sensor_noise: None,
            dt_secs: 10.0,
            backoff: Duration::from_secs(10),
            skip: Vec::new(),
        }
    }
}

impl FleetOptions {
    pub fn with_families(mut self, families: &[DeviceFamily]) -> Self {
        self.families = families.to_vec();
        self
    }

    pub fn with_sensor_noise(mut self, std_dev: f64) -> Self {
        self.sensor_noise = Some(std_dev);
        self
    }

    pub fn without(mut self, room: impl Into<RoomId>, family: DeviceFamily) -> Self {
        self.skip.push((room.into(), family));
        self
    }
}

/// How one controller loop ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOutcome {
    pub name: String,
    pub result: Result<ControlStats, ServiceError>,
}

type Binding = (String, &'static str);

pub struct Fleet {
    cloud: Arc<InMemoryCloud>,
    devices: Vec<DeviceConfig>,
    bindings: BTreeMap<Binding, OrchestrationRule>,
    active: BTreeMap<Binding, u64>,
    controllers: JoinSet<ControllerOutcome>,
}

impl Fleet {
    /// Deploys and starts the fleet for `building`.
    pub async fn deploy(
        building: &BuildingConfig,
        options: &FleetOptions,
        hub: &mut SessionHub,
        ctx: Arc<SimContext>,
    ) -> Result<Self, SimError> {
        let cloud = InMemoryCloud::shared();
        let mut sensors: ProviderMap<dyn MeasurementService> = BTreeMap::new();
        let mut actuators: ProviderMap<dyn ActuationService> = BTreeMap::new();
        let mut devices = Vec::new();
        let mut bindings = BTreeMap::new();

        for (index, room) in building.rooms.iter().enumerate() {
            for family in &options.families {
                let family = *family;
                if !room.subsystems.contains(&family.subsystem())
                    || options.skip.contains(&(room.name.clone(), family))
                {
                    continue;
                }
                let offset = index as u16;
                let config = |kind| {
                    DeviceConfig::new(kind, family, room.name.clone(), port_base(kind, family) + offset)
                        .with_coordinate(room.position)
                };

                let sensor_cfg = config(DeviceKind::TemperatureSensor);
                let actuator_cfg = config(DeviceKind::Actuator);
                let controller_cfg = config(DeviceKind::Controller);
                for cfg in [&sensor_cfg, &actuator_cfg, &controller_cfg] {
                    cfg.validate()?;
                    cloud.register_system(SystemRecord::from(cfg)).await?;
                }

                let sensor_record = SystemRecord::from(&sensor_cfg);
                let actuator_record = SystemRecord::from(&actuator_cfg);
                cloud
                    .register_service(ServiceRecord::temperature(sensor_record.clone()))
                    .await?;
                cloud
                    .register_service(ServiceRecord::actuator(actuator_record.clone()))
                    .await?;

                let consumer = controller_cfg.system_name.clone();
                bindings.insert(
                    (consumer.clone(), TEMPERATURE_SERVICE),
                    OrchestrationRule {
                        service_definition: TEMPERATURE_SERVICE.to_string(),
                        consumer: consumer.clone(),
                        provider: sensor_record,
                    },
                );
                bindings.insert(
                    (consumer.clone(), ACTUATOR_SERVICE),
                    OrchestrationRule {
                        service_definition: ACTUATOR_SERVICE.to_string(),
                        consumer,
                        provider: actuator_record,
                    },
                );

                let client = EngineClient::new(hub.connect(&sensor_cfg.system_name), ctx.clone());
                let mut sensor = TemperatureSensor::new(sensor_cfg.clone(), client);
                if let Some(std_dev) = options.sensor_noise {
                    let seed = ctx.derive_seed(devices.len() as u64);
                    sensor = sensor.with_noise(std_dev, seed)?;
                }
                sensors.insert(sensor_cfg.system_name.clone(), Arc::new(sensor));

                let client = EngineClient::new(hub.connect(&actuator_cfg.system_name), ctx.clone());
                actuators.insert(
                    actuator_cfg.system_name.clone(),
                    Arc::new(Actuator::new(actuator_cfg.clone(), client)),
                );

                devices.extend([sensor_cfg, actuator_cfg, controller_cfg]);
            }
        }

        let mut fleet = Self {
            cloud: cloud.clone(),
            devices,
            bindings,
            active: BTreeMap::new(),
            controllers: JoinSet::new(),
        };
        let keys: Vec<Binding> = fleet.bindings.keys().cloned().collect();
        for (consumer, service) in keys {
            fleet.restore_service(&consumer, service).await?;
        }

        let sensors = Arc::new(sensors);
        let actuators = Arc::new(actuators);
        let controllers: Vec<DeviceConfig> = fleet
            .devices
            .iter()
            .filter(|d| d.kind == DeviceKind::Controller)
            .cloned()
            .collect();
        for cfg in controllers {
            let name = cfg.system_name.clone();
            let controller = PIController::new(cfg.room.clone(), cfg.kp, cfg.ki, cfg.family.variant());
            let setpoints = EngineClient::new(hub.connect(&name), ctx.clone());
            let mut control = ControlLoop::new(
                name.clone(),
                cfg.family,
                controller,
                Orchestrated::temperature(name.clone(), cloud.clone(), sensors.clone()),
                Orchestrated::actuator(name.clone(), cloud.clone(), actuators.clone()),
                setpoints,
                ctx.clone(),
                ControlLoopConfig {
                    dt_secs: options.dt_secs,
                    backoff: options.backoff,
                    coordinate: cfg.coordinate,
                },
            );
            fleet.controllers.spawn(async move {
                let result = control.run().await;
                ControllerOutcome { name, result }
            });
        }

        info!(
            "fleet deployed: {} devices, {} rules",
            fleet.devices.len(),
            fleet.cloud.rule_count()
        );
        Ok(fleet)
    }

    pub fn devices(&self) -> &[DeviceConfig] {
        &self.devices
    }

    pub fn cloud(&self) -> &Arc<InMemoryCloud> {
        &self.cloud
    }

    /// Names of every deployed controller, sorted.
    pub fn controller_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.kind == DeviceKind::Controller)
            .map(|d| d.system_name.clone())
            .collect();
        names.sort();
        names
    }

    /// Removes the rule binding `consumer` to its `service` provider.
    pub async fn cut_service(&mut self, consumer: &str, service: &'static str) -> Result<(), SimError> {
        let key = (consumer.to_string(), service);
        let id = self.active.remove(&key).ok_or_else(|| SimError::UnknownBinding {
            consumer: consumer.to_string(),
            service: service.to_string(),
        })?;
        self.cloud.remove_orchestration_rule(id).await?;
        debug!("cut {} for {}", service, consumer);
        Ok(())
    }

    /// Re-adds the rule binding `consumer` to its `service` provider.
    pub async fn restore_service(&mut self, consumer: &str, service: &'static str) -> Result<(), SimError> {
        let key = (consumer.to_string(), service);
        if self.active.contains_key(&key) {
            return Ok(());
        }
        let rule = self
            .bindings
            .get(&key)
            .cloned()
            .ok_or_else(|| SimError::UnknownBinding {
                consumer: consumer.to_string(),
                service: service.to_string(),
            })?;
        let id = self.cloud.add_orchestration_rule(rule).await?;
        self.active.insert(key, id);
        Ok(())
    }

    /// Waits for every controller loop to end, sorted by name.
    pub async fn join(mut self) -> Vec<ControllerOutcome> {
        let mut outcomes = Vec::new();
        while let Some(joined) = self.controllers.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("controller task panicked: {}", e),
            }
        }
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));
        outcomes
    }
}
