//! Wire shapes exchanged over agent connections.
//!
//! Two request encodings are accepted (see [`crate::reading`]):
//!
//! ```text
//! flat:   {"name": "A11", "system": "actuator", "unit": "heater", "actuation": 750.0}
//! senml:  [{"bn": "A11_actuator_cooler", "bt": 12},
//!          {"u": "Lon", "v": 1}, {"u": "Lat", "v": 0},
//!          {"u": "W", "v": -300.0}]
//! ```
//!
//! Engine replies are always flat objects ([`EngineReply`]).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to serialize an outbound message.
#[derive(Debug, Error)]
#[error("Failed to encode message: {0}")]
pub struct EncodeError(String);

impl From<serde_json::Error> for EncodeError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

/// Flat, single-object encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatMessage {
    /// Room the message is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Role marker: sensor, actuator or controller
    #[serde(default, alias = "role", skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Unit tag, or the legacy subsystem marker (`heater`/`cooler`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,

    #[serde(default, alias = "actuation", skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestep: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl FlatMessage {
    pub fn new(room: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            name: Some(room.into()),
            system: Some(system.into()),
            ..Default::default()
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = Some(subsystem.into());
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_timestep(mut self, timestep: u64) -> Self {
        self.timestep = Some(timestep);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// One record of a SenML-like array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenmlRecord {
    /// Base name (first record only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bn: Option<String>,

    /// Base time (first record only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bt: Option<f64>,

    /// Name (single-record family-A payloads)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// Time (single-record family-A payloads)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<f64>,
}

impl SenmlRecord {
    pub fn base(name: impl Into<String>, time: u64) -> Self {
        Self {
            bn: Some(name.into()),
            bt: Some(time as f64),
            ..Default::default()
        }
    }

    pub fn named(name: impl Into<String>, time: u64, unit: &str, value: f64) -> Self {
        Self {
            n: Some(name.into()),
            t: Some(time as f64),
            u: Some(unit.to_string()),
            v: Some(value),
            ..Default::default()
        }
    }

    pub fn value(unit: &str, value: f64) -> Self {
        Self {
            u: Some(unit.to_string()),
            v: Some(value),
            ..Default::default()
        }
    }
}

pub fn encode_senml(records: &[SenmlRecord]) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(records)?)
}

/// Reply from the engine to one agent request.
///
/// Untagged: variants are told apart by their fields, most specific first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineReply {
    /// Sensor request answered during the read phase
    Measurement { temp: f64, setpoint: f64, timestep: u64 },

    /// Controller setpoint query
    Setpoint { setpoint: f64, timestep: u64 },

    /// Actuation confirmation (`true`) or rejection (`false`)
    Status { status: bool, timestep: u64 },
}

impl EngineReply {
    pub fn rejected(timestep: u64) -> Self {
        EngineReply::Status {
            status: false,
            timestep,
        }
    }

    pub fn timestep(&self) -> u64 {
        match self {
            EngineReply::Measurement { timestep, .. }
            | EngineReply::Setpoint { timestep, .. }
            | EngineReply::Status { timestep, .. } => *timestep,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
