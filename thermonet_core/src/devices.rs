//! Device agents: temperature sensors, actuators and the engine client.
//!
//! Devices hold an [`EngineClient`] over their own transport and expose
//! their capability through [`MeasurementService`] or [`ActuationService`].
//! Controllers consume those services (see [`crate::controller`]).
//!
//! # Families
//!
//! | family | subsystem | payloads | controller |
//! |--------|-----------|----------|------------|
//! | A | heater | `[{"n","t","u","v"}]`, flat engine requests | heating-only PI, kP=40 kI=1 |
//! | B | cooler | SenML-like with Lon/Lat | heat/cool PI, kP=0.1 kI=0.01 |

use crate::building::{ConfigError, RoomId, Subsystem};
use crate::controller::ControlVariant;
use crate::reading::{ProtocolError, ReadingNormalizer, Unit};
use crate::wire::{encode_senml, EncodeError, EngineReply, FlatMessage, SenmlRecord};
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thermonet_env::{AgentTransport, MessageEnvelope, ThermoContext};
use thiserror::Error;
use tracing::trace;

/// Upper bound of actuator power (W).
pub const DEFAULT_MAX_POWER: f64 = 1500.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    /// No provider currently resolves for the named service
    #[error("Service '{0}' unavailable")]
    Unavailable(String),

    /// The engine connection is gone
    #[error("Engine connection closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Engine does not know room {0}")]
    UnknownEntity(RoomId),

    #[error("{0}")]
    Encode(String),
}

impl From<EncodeError> for ServiceError {
    fn from(e: EncodeError) -> Self {
        ServiceError::Encode(e.to_string())
    }
}

/// Provides temperature payloads in the device family's encoding.
#[async_trait]
pub trait MeasurementService: Send + Sync {
    async fn read(&self) -> Result<Vec<u8>, ServiceError>;
}

/// Accepts actuation payloads in the device family's encoding.
#[async_trait]
pub trait ActuationService: Send + Sync {
    async fn actuate(&self, payload: &[u8]) -> Result<(), ServiceError>;
}

/// Current setpoint and timestep for a room.
#[async_trait]
pub trait SetpointSource: Send + Sync {
    async fn setpoint(&self, room: &RoomId, subsystem: Subsystem) -> Result<(f64, u64), ServiceError>;
}

#[async_trait]
impl<S: MeasurementService + ?Sized> MeasurementService for Arc<S> {
    async fn read(&self) -> Result<Vec<u8>, ServiceError> {
        (**self).read().await
    }
}

#[async_trait]
impl<S: ActuationService + ?Sized> ActuationService for Arc<S> {
    async fn actuate(&self, payload: &[u8]) -> Result<(), ServiceError> {
        (**self).actuate(payload).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceFamily {
    A,
    B,
}

impl DeviceFamily {
    pub const ALL: [DeviceFamily; 2] = [DeviceFamily::A, DeviceFamily::B];

    pub fn subsystem(&self) -> Subsystem {
        match self {
            DeviceFamily::A => Subsystem::Heater,
            DeviceFamily::B => Subsystem::Cooler,
        }
    }

    pub fn variant(&self) -> ControlVariant {
        match self {
            DeviceFamily::A => ControlVariant::HeatingOnly,
            DeviceFamily::B => ControlVariant::HeatCool,
        }
    }

    /// (kP, kI)
    pub fn default_gains(&self) -> (f64, f64) {
        match self {
            DeviceFamily::A => (40.0, 1.0),
            DeviceFamily::B => (0.1, 0.01),
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            DeviceFamily::A => "",
            DeviceFamily::B => "_cooler",
        }
    }
}

/// What a device is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    TemperatureSensor,
    Actuator,
    Controller,
}

impl DeviceKind {
    fn token(&self) -> &'static str {
        match self {
            DeviceKind::TemperatureSensor => "temp_sensor",
            DeviceKind::Actuator => "actuator",
            DeviceKind::Controller => "controller",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// `<room>_<kind>[_cooler]`
    pub system_name: String,
    pub address: String,
    pub port: u16,
    pub room: RoomId,
    /// Non-negative Lon/Lat tags for SenML payloads
    pub coordinate: [f64; 2],
    pub kind: DeviceKind,
    pub family: DeviceFamily,
    pub kp: f64,
    pub ki: f64,
    pub max_power: f64,
}

impl DeviceConfig {
    pub fn new(kind: DeviceKind, family: DeviceFamily, room: RoomId, port: u16) -> Self {
        let (kp, ki) = family.default_gains();
        Self {
            system_name: format!("{}_{}{}", room, kind.token(), family.suffix()),
            address: "127.0.0.1".to_string(),
            port,
            room,
            coordinate: [0.0, 0.0],
            kind,
            family,
            kp,
            ki,
            max_power: DEFAULT_MAX_POWER,
        }
    }

    pub fn with_coordinate(mut self, coordinate: [f64; 2]) -> Self {
        self.coordinate = coordinate;
        self
    }

    pub fn with_gains(mut self, kp: f64, ki: f64) -> Self {
        self.kp = kp;
        self.ki = ki;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinate.iter().any(|c| !(c.is_finite() && *c >= 0.0)) {
            return Err(ConfigError::InvalidParameter(format!(
                "{}: coordinate {:?} must be non-negative",
                self.system_name, self.coordinate
            )));
        }
        if !(self.max_power.is_finite() && self.max_power >= 0.0) {
            return Err(ConfigError::InvalidParameter(format!(
                "{}: max_power = {}",
                self.system_name, self.max_power
            )));
        }
        Ok(())
    }
}

/// Request/reply client over one device's engine connection.
///
/// Requests are serialized: a reply always belongs to the request that
/// preceded it.
pub struct EngineClient<T: AgentTransport, C: ThermoContext> {
    transport: T,
    ctx: Arc<C>,
    in_flight: tokio::sync::Mutex<()>,
}

impl<T: AgentTransport, C: ThermoContext> EngineClient<T, C> {
    pub fn new(transport: T, ctx: Arc<C>) -> Self {
        Self {
            transport,
            ctx,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn request(&self, payload: Vec<u8>) -> Result<EngineReply, ServiceError> {
        let _turn = self.in_flight.lock().await;
        let now_ms = self.ctx.now().as_millis() as u64;
        self.transport
            .send(MessageEnvelope::new(payload, now_ms))
            .await
            .map_err(|_| ServiceError::Closed)?;
        let reply = self.transport.recv().await.ok_or(ServiceError::Closed)?;
        EngineReply::decode(&reply.payload)
            .map_err(|e| ProtocolError::Decode(e.to_string()).into())
    }
}

#[async_trait]
impl<T: AgentTransport, C: ThermoContext> SetpointSource for EngineClient<T, C> {
    async fn setpoint(&self, room: &RoomId, subsystem: Subsystem) -> Result<(f64, u64), ServiceError> {
        let query = FlatMessage::new(room.as_str(), "controller").with_unit(subsystem.as_str());
        match self.request(query.encode()?).await? {
            EngineReply::Setpoint { setpoint, timestep } => Ok((setpoint, timestep)),
            EngineReply::Status { status: false, .. } => Err(ServiceError::UnknownEntity(room.clone())),
            other => Err(ProtocolError::UnexpectedReply(format!("{:?}", other)).into()),
        }
    }
}

struct SensorNoise {
    rng: ChaCha8Rng,
    normal: Normal<f64>,
}

/// Provides the `temperature` service for one room.
pub struct TemperatureSensor<T: AgentTransport, C: ThermoContext> {
    config: DeviceConfig,
    client: EngineClient<T, C>,
    noise: Option<Mutex<SensorNoise>>,
}

impl<T: AgentTransport, C: ThermoContext> TemperatureSensor<T, C> {
    pub fn new(config: DeviceConfig, client: EngineClient<T, C>) -> Self {
        Self {
            config,
            client,
            noise: None,
        }
    }

    /// Adds Gaussian noise (K) to every reported temperature.
    pub fn with_noise(mut self, std_dev: f64, seed: u64) -> Result<Self, ConfigError> {
        let normal = Normal::new(0.0, std_dev)
            .map_err(|e| ConfigError::InvalidParameter(format!("sensor noise: {}", e)))?;
        self.noise = Some(Mutex::new(SensorNoise {
            rng: ChaCha8Rng::seed_from_u64(seed),
            normal,
        }));
        Ok(self)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Asks the engine for this tick's temperature. Returns (K, timestep).
    pub async fn measure(&self) -> Result<(f64, u64), ServiceError> {
        let request = FlatMessage::new(self.config.room.as_str(), "sensor").with_agent(&self.config.system_name);
        let request = match self.config.family {
            DeviceFamily::A => request.with_unit(Subsystem::Heater.as_str()),
            DeviceFamily::B => request.with_subsystem(Subsystem::Cooler.as_str()),
        };

        match self.client.request(request.encode()?).await? {
            EngineReply::Measurement { temp, timestep, .. } => {
                let noise = match &self.noise {
                    Some(noise) => {
                        let mut noise = noise.lock().unwrap();
                        let SensorNoise { rng, normal } = &mut *noise;
                        normal.sample(rng)
                    }
                    None => 0.0,
                };
                Ok((temp + noise, timestep))
            }
            EngineReply::Status { status: false, .. } => {
                Err(ServiceError::UnknownEntity(self.config.room.clone()))
            }
            other => Err(ProtocolError::UnexpectedReply(format!("{:?}", other)).into()),
        }
    }
}

#[async_trait]
impl<T: AgentTransport, C: ThermoContext> MeasurementService for TemperatureSensor<T, C> {
    async fn read(&self) -> Result<Vec<u8>, ServiceError> {
        let (kelvin, timestep) = self.measure().await?;
        trace!("{}: {:.3}K at t={}", self.config.system_name, kelvin, timestep);

        let records = match self.config.family {
            DeviceFamily::A => vec![SenmlRecord::named(&self.config.system_name, timestep, "K", kelvin)],
            DeviceFamily::B => vec![
                SenmlRecord::base(&self.config.system_name, timestep),
                SenmlRecord::value("Lon", self.config.coordinate[0]),
                SenmlRecord::value("Lat", self.config.coordinate[1]),
                SenmlRecord::value("Cel", kelvin - crate::reading::CELSIUS_OFFSET),
            ],
        };
        Ok(encode_senml(&records)?)
    }
}

/// Provides the `actuator` service for one room.
pub struct Actuator<T: AgentTransport, C: ThermoContext> {
    config: DeviceConfig,
    client: EngineClient<T, C>,
    normalizer: ReadingNormalizer,
}

impl<T: AgentTransport, C: ThermoContext> Actuator<T, C> {
    pub fn new(config: DeviceConfig, client: EngineClient<T, C>) -> Self {
        Self {
            config,
            client,
            normalizer: ReadingNormalizer::new(),
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Physical power (W) for a command in this family's unit.
    pub fn power_for(&self, unit: Unit, value: f64) -> Result<f64, ProtocolError> {
        match (self.config.family, unit) {
            (DeviceFamily::A, Unit::Watt) => Ok(value.max(0.0).min(self.config.max_power)),
            (DeviceFamily::B, Unit::Fraction) => Ok((-self.config.max_power * value).min(0.0)),
            (_, unit) => Err(ProtocolError::UnitNotAllowed {
                unit: unit.tag().to_string(),
                role: crate::reading::Role::Actuator,
            }),
        }
    }
}

#[async_trait]
impl<T: AgentTransport, C: ThermoContext> ActuationService for Actuator<T, C> {
    async fn actuate(&self, payload: &[u8]) -> Result<(), ServiceError> {
        let command = self.normalizer.normalize(payload)?;
        if command.room_id != self.config.room {
            return Err(ProtocolError::UnexpectedSource {
                expected: self.config.room.clone(),
                got: command.room_id,
            }
            .into());
        }
        let unit = command.unit.ok_or(ProtocolError::MissingField("u"))?;
        let value = command.value.ok_or(ProtocolError::MissingField("v"))?;
        let power = self.power_for(unit, value)?;
        trace!("{}: {:.1}W", self.config.system_name, power);

        let request = match self.config.family {
            DeviceFamily::A => FlatMessage::new(self.config.room.as_str(), "actuator")
                .with_unit(Subsystem::Heater.as_str())
                .with_value(power)
                .with_agent(&self.config.system_name)
                .encode()?,
            DeviceFamily::B => encode_senml(&[
                SenmlRecord::base(&self.config.system_name, command.timestep.unwrap_or(0)),
                SenmlRecord::value("Lon", self.config.coordinate[0]),
                SenmlRecord::value("Lat", self.config.coordinate[1]),
                SenmlRecord::value("W", power),
            ])?,
        };

        match self.client.request(request).await? {
            EngineReply::Status { status: true, .. } => Ok(()),
            EngineReply::Status { status: false, .. } => {
                Err(ServiceError::UnknownEntity(self.config.room.clone()))
            }
            other => Err(ProtocolError::UnexpectedReply(format!("{:?}", other)).into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Role;
    use approx::assert_relative_eq;
    use thermonet_env::{ChannelTransport, TokioContext};

    /// Answers one request with `reply` and hands the request back.
    async fn serve_once(end: &ChannelTransport, reply: EngineReply) -> Vec<u8> {
        let request = end.recv().await.unwrap();
        end.send(MessageEnvelope::new(reply.encode().unwrap(), 0))
            .await
            .unwrap();
        request.payload
    }

    fn client(transport: ChannelTransport) -> EngineClient<ChannelTransport, TokioContext> {
        EngineClient::new(transport, TokioContext::shared())
    }

    #[test]
    fn test_system_names_follow_base_name_grammar() {
        let a = DeviceConfig::new(DeviceKind::TemperatureSensor, DeviceFamily::A, "A11".into(), 5000);
        let b = DeviceConfig::new(DeviceKind::Controller, DeviceFamily::B, "A21".into(), 5214);
        assert_eq!(a.system_name, "A11_temp_sensor");
        assert_eq!(b.system_name, "A21_controller_cooler");
        assert_eq!((b.kp, b.ki), (0.1, 0.01));
    }

    #[tokio::test]
    async fn test_family_a_sensor_payload() {
        let (device, engine) = ChannelTransport::pair(2);
        let config = DeviceConfig::new(DeviceKind::TemperatureSensor, DeviceFamily::A, "A12".into(), 5001);
        let sensor = TemperatureSensor::new(config, client(device));

        let (payload, request) = tokio::join!(
            sensor.read(),
            serve_once(
                &engine,
                EngineReply::Measurement {
                    temp: 290.5,
                    setpoint: 293.15,
                    timestep: 4
                }
            )
        );

        let request = ReadingNormalizer::new().normalize(&request).unwrap();
        assert_eq!(request.role, Role::Sensor);
        assert_eq!(request.subsystem, Some(Subsystem::Heater));

        let reading = ReadingNormalizer::new().normalize(&payload.unwrap()).unwrap();
        assert_eq!(reading.agent_id, "A12_temp_sensor");
        assert_eq!(reading.value, Some(290.5));
        assert_eq!(reading.timestep, Some(4));
    }

    #[tokio::test]
    async fn test_family_b_sensor_reports_celsius_with_location() {
        let (device, engine) = ChannelTransport::pair(2);
        let config = DeviceConfig::new(DeviceKind::TemperatureSensor, DeviceFamily::B, "A22".into(), 5015)
            .with_coordinate([2.0, 1.0]);
        let sensor = TemperatureSensor::new(config, client(device));

        let (payload, _) = tokio::join!(
            sensor.read(),
            serve_once(
                &engine,
                EngineReply::Measurement {
                    temp: 300.0,
                    setpoint: 298.0,
                    timestep: 1
                }
            )
        );
        let payload = payload.unwrap();
        let raw: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(raw[3]["u"], "Cel");

        let reading = ReadingNormalizer::new().normalize(&payload).unwrap();
        assert_relative_eq!(reading.value.unwrap(), 300.0, epsilon = 1e-9);
        assert_eq!(reading.subsystem, Some(Subsystem::Cooler));
        assert_eq!(reading.location.map(|l| (l.lon, l.lat)), Some((2.0, 1.0)));
    }

    #[tokio::test]
    async fn test_sensor_noise_is_seeded() {
        let mut samples = Vec::new();
        for _ in 0..2 {
            let (device, engine) = ChannelTransport::pair(2);
            let config = DeviceConfig::new(DeviceKind::TemperatureSensor, DeviceFamily::A, "A11".into(), 5000);
            let sensor = TemperatureSensor::new(config, client(device)).with_noise(0.5, 42).unwrap();
            let (measured, _) = tokio::join!(
                sensor.measure(),
                serve_once(
                    &engine,
                    EngineReply::Measurement {
                        temp: 290.0,
                        setpoint: 293.15,
                        timestep: 0
                    }
                )
            );
            samples.push(measured.unwrap().0);
        }
        assert_eq!(samples[0], samples[1]);
        assert_ne!(samples[0], 290.0);
    }

    #[tokio::test]
    async fn test_actuator_scaling_per_family() {
        let (device, _engine) = ChannelTransport::pair(2);
        let heater = Actuator::new(
            DeviceConfig::new(DeviceKind::Actuator, DeviceFamily::A, "A11".into(), 5100),
            client(device),
        );
        assert_eq!(heater.power_for(Unit::Watt, 2000.0).unwrap(), 1500.0);
        assert_eq!(heater.power_for(Unit::Watt, -3.0).unwrap(), 0.0);
        assert!(heater.power_for(Unit::Fraction, 0.5).is_err());

        let (device, _engine) = ChannelTransport::pair(2);
        let cooler = Actuator::new(
            DeviceConfig::new(DeviceKind::Actuator, DeviceFamily::B, "A11".into(), 5110),
            client(device),
        );
        assert_eq!(cooler.power_for(Unit::Fraction, 0.2).unwrap(), -300.0);
        assert_eq!(cooler.power_for(Unit::Fraction, -0.5).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_cooler_forwards_senml_watts() {
        let (device, engine) = ChannelTransport::pair(2);
        let cooler = Actuator::new(
            DeviceConfig::new(DeviceKind::Actuator, DeviceFamily::B, "A23".into(), 5116)
                .with_coordinate([3.0, 1.0]),
            client(device),
        );
        let command = encode_senml(&[
            SenmlRecord::base("A23_controller_cooler", 6),
            SenmlRecord::value("Lon", 3.0),
            SenmlRecord::value("Lat", 1.0),
            SenmlRecord::value("/", 0.5),
        ])
        .unwrap();

        let (result, request) = tokio::join!(
            cooler.actuate(&command),
            serve_once(&engine, EngineReply::Status { status: true, timestep: 6 })
        );
        result.unwrap();

        let forwarded = ReadingNormalizer::new().normalize(&request).unwrap();
        assert_eq!(forwarded.role, Role::Actuator);
        assert_eq!(forwarded.subsystem, Some(Subsystem::Cooler));
        assert_eq!(forwarded.unit, Some(Unit::Watt));
        assert_eq!(forwarded.value, Some(-750.0));
        assert_eq!(forwarded.timestep, Some(6));
    }

    #[tokio::test]
    async fn test_rejected_setpoint_query_is_unknown_entity() {
        let (device, engine) = ChannelTransport::pair(2);
        let client = client(device);
        let room = RoomId::new("Z1");

        let (result, _) = tokio::join!(
            client.setpoint(&room, Subsystem::Heater),
            serve_once(&engine, EngineReply::rejected(3))
        );
        assert_eq!(result, Err(ServiceError::UnknownEntity(room)));
    }

    #[tokio::test]
    async fn test_closed_engine_connection() {
        let (device, engine) = ChannelTransport::pair(2);
        drop(engine);
        let result = client(device).setpoint(&RoomId::new("A11"), Subsystem::Heater).await;
        assert_eq!(result, Err(ServiceError::Closed));
    }
}
