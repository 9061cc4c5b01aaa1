//! Reading normalization: both wire encodings into one [`Reading`].
//!
//! # Rules
//!
//! - A JSON object is the flat encoding. A `unit` of `heater`/`cooler` is the
//!   legacy subsystem marker; the unit tag is then implied by the role.
//! - A single-record array whose record has `n` (no `bn`) is the family-A
//!   service payload and is read like a flat message.
//! - Any other array is SenML-like: the first record must carry `bn`; every
//!   later record must carry a known unit tag. Exactly one primary
//!   measurement (`K`, `Cel`, `W`, `/`) is required. `Lon`/`Lat` must be
//!   non-negative and present together.
//! - Base names follow `<room>_<role>[_<subsystem>]`.
//! - `Cel` is converted to Kelvin.
//!
//! Anything else is a [`ProtocolError`]; nothing is guessed.

use crate::building::{RoomId, Subsystem};
use crate::wire::{FlatMessage, SenmlRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Offset between the Celsius and Kelvin scales.
pub const CELSIUS_OFFSET: f64 = 273.15;

/// Malformed or undecodable agent message.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Payload is not valid JSON: {0}")]
    Decode(String),

    #[error("Payload must be an object or an array, got {0}")]
    Shape(&'static str),

    #[error("Empty record array")]
    EmptyArray,

    #[error("Missing field '{0}'")]
    MissingField(&'static str),

    #[error("Unknown role '{0}'")]
    UnknownRole(String),

    #[error("Unknown subsystem '{0}'")]
    UnknownSubsystem(String),

    #[error("Unknown unit tag '{0}'")]
    UnknownUnit(String),

    #[error("First record must carry a base name")]
    MissingBaseName,

    #[error("Base name '{0}' appears more than once")]
    DuplicateBaseName(String),

    #[error("Base name '{0}' does not name a room and role")]
    BadBaseName(String),

    #[error("No primary measurement entry")]
    MissingPrimary,

    #[error("More than one primary measurement entry ({0})")]
    DuplicatePrimary(String),

    #[error("Duplicate '{0}' entry")]
    DuplicateEntry(String),

    #[error("{unit} = {value} < 0")]
    NegativeCoordinate { unit: String, value: f64 },

    #[error("Location needs both Lon and Lat")]
    IncompleteLocation,

    #[error("Invalid timestep {0}")]
    BadTimestep(f64),

    #[error("Unit '{unit}' not valid for {role}")]
    UnitNotAllowed { unit: String, role: Role },

    #[error("Invalid actuation {value} for {subsystem}")]
    InvalidActuation { subsystem: Subsystem, value: f64 },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Expected a reading for room '{expected}', got '{got}'")]
    UnexpectedSource { expected: RoomId, got: RoomId },
}

/// Device role carried by every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sensor,
    Actuator,
    Controller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sensor => "sensor",
            Role::Actuator => "actuator",
            Role::Controller => "controller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sensor" => Ok(Role::Sensor),
            "actuator" => Ok(Role::Actuator),
            "controller" => Ok(Role::Controller),
            other => Err(ProtocolError::UnknownRole(other.to_string())),
        }
    }
}

/// Unit tags understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Unit {
    Kelvin,
    Celsius,
    Watt,
    /// Dimensionless actuation fraction
    Fraction,
    Longitude,
    Latitude,
}

impl Unit {
    pub fn parse(tag: &str) -> Option<Unit> {
        match tag {
            "K" => Some(Unit::Kelvin),
            "Cel" => Some(Unit::Celsius),
            "W" => Some(Unit::Watt),
            "/" => Some(Unit::Fraction),
            "Lon" | "lon" => Some(Unit::Longitude),
            "Lat" | "lat" => Some(Unit::Latitude),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Unit::Kelvin => "K",
            Unit::Celsius => "Cel",
            Unit::Watt => "W",
            Unit::Fraction => "/",
            Unit::Longitude => "Lon",
            Unit::Latitude => "Lat",
        }
    }

    /// Whether the unit denotes a physical quantity of interest.
    pub fn is_primary(&self) -> bool {
        !matches!(self, Unit::Longitude | Unit::Latitude)
    }
}

/// Non-negative geolocation tags passed through from SenML records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lon: f64,
    pub lat: f64,
}

/// Canonical record produced from either wire encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub agent_id: String,
    pub room_id: RoomId,
    pub role: Role,
    pub subsystem: Option<Subsystem>,
    /// Never `Celsius`: temperatures are normalized to Kelvin
    pub unit: Option<Unit>,
    pub value: Option<f64>,
    pub timestep: Option<u64>,
    pub location: Option<Location>,
}

impl Reading {
    /// Encodes this reading as a flat message.
    pub fn to_flat(&self) -> FlatMessage {
        FlatMessage {
            name: Some(self.room_id.to_string()),
            system: Some(self.role.to_string()),
            unit: self.unit.map(|u| u.tag().to_string()),
            subsystem: self.subsystem.map(|s| s.to_string()),
            value: self.value,
            timestep: self.timestep,
            agent: Some(self.agent_id.clone()),
        }
    }

    /// Encodes this reading as SenML-like records.
    ///
    /// The agent id is used as base name, so it must follow the
    /// `<room>_<role>[_<subsystem>]` grammar to normalize back.
    pub fn to_senml(&self) -> Vec<SenmlRecord> {
        let mut records = vec![SenmlRecord {
            bn: Some(self.agent_id.clone()),
            bt: self.timestep.map(|t| t as f64),
            ..Default::default()
        }];
        if let Some(loc) = self.location {
            records.push(SenmlRecord::value("Lon", loc.lon));
            records.push(SenmlRecord::value("Lat", loc.lat));
        }
        if let (Some(unit), Some(value)) = (self.unit, self.value) {
            records.push(SenmlRecord::value(unit.tag(), value));
        }
        records
    }
}

/// Room, role and subsystem recovered from a base name.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseName {
    pub room: RoomId,
    pub role: Role,
    pub subsystem: Option<Subsystem>,
}

impl BaseName {
    /// Parses `<room>_<role>[_<subsystem>]`; `temp_sensor` counts as `sensor`.
    ///
    /// Any token outside that grammar rejects the whole name.
    pub fn parse(name: &str) -> Result<Self, ProtocolError> {
        let bad = || ProtocolError::BadBaseName(name.to_string());
        let mut parts = name.split('_');
        let room = match parts.next() {
            Some(room) if !room.is_empty() => RoomId::new(room),
            _ => return Err(bad()),
        };

        let role = match parts.next() {
            Some("temp") => match parts.next() {
                Some("sensor") => Role::Sensor,
                _ => return Err(bad()),
            },
            Some(token) => token.parse::<Role>().map_err(|_| bad())?,
            None => return Err(bad()),
        };
        let subsystem = parts
            .next()
            .map(|token| token.parse::<Subsystem>().map_err(|_| bad()))
            .transpose()?;
        if parts.next().is_some() {
            return Err(bad());
        }

        Ok(Self {
            room,
            role,
            subsystem,
        })
    }
}

/// Parses inbound payloads in either encoding.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadingNormalizer;

impl ReadingNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, payload: &[u8]) -> Result<Reading, ProtocolError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| ProtocolError::Decode(e.to_string()))?;
        self.normalize_value(value)
    }

    pub fn normalize_value(&self, value: Value) -> Result<Reading, ProtocolError> {
        match value {
            Value::Object(_) => {
                let flat: FlatMessage = serde_json::from_value(value)
                    .map_err(|e| ProtocolError::Decode(e.to_string()))?;
                self.normalize_flat(flat)
            }
            Value::Array(items) => {
                let records = items
                    .into_iter()
                    .map(serde_json::from_value::<SenmlRecord>)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ProtocolError::Decode(e.to_string()))?;
                self.normalize_records(&records)
            }
            Value::Null => Err(ProtocolError::Shape("null")),
            Value::Bool(_) => Err(ProtocolError::Shape("bool")),
            Value::Number(_) => Err(ProtocolError::Shape("number")),
            Value::String(_) => Err(ProtocolError::Shape("string")),
        }
    }

    pub fn normalize_flat(&self, msg: FlatMessage) -> Result<Reading, ProtocolError> {
        let room = msg.name.ok_or(ProtocolError::MissingField("name"))?;
        let role: Role = msg
            .system
            .as_deref()
            .ok_or(ProtocolError::MissingField("system"))?
            .parse()?;

        // `unit` doubles as the subsystem marker in the legacy shape
        let legacy_subsystem = msg.unit.as_deref().and_then(|u| u.parse::<Subsystem>().ok());
        let subsystem = match msg.subsystem.as_deref() {
            Some(s) => Some(
                s.parse::<Subsystem>()
                    .map_err(|_| ProtocolError::UnknownSubsystem(s.to_string()))?,
            ),
            None => legacy_subsystem,
        };

        let tag = match (&msg.unit, legacy_subsystem) {
            (Some(_), Some(_)) | (None, _) => None,
            (Some(tag), None) => Some(tag.as_str()),
        };
        let (unit, value) = match tag {
            Some(tag) => {
                let unit = Unit::parse(tag).ok_or_else(|| ProtocolError::UnknownUnit(tag.to_string()))?;
                if !unit.is_primary() {
                    return Err(ProtocolError::UnitNotAllowed {
                        unit: tag.to_string(),
                        role,
                    });
                }
                to_canonical(unit, msg.value)
            }
            None => (implied_unit(role), msg.value),
        };

        let agent_id = msg
            .agent
            .unwrap_or_else(|| format!("{}_{}", room, role));

        Ok(Reading {
            agent_id,
            room_id: RoomId::new(room),
            role,
            subsystem,
            unit,
            value,
            timestep: msg.timestep,
            location: None,
        })
    }

    pub fn normalize_records(&self, records: &[SenmlRecord]) -> Result<Reading, ProtocolError> {
        let first = records.first().ok_or(ProtocolError::EmptyArray)?;

        if first.bn.is_none() && records.len() == 1 && first.n.is_some() {
            return self.normalize_named(first);
        }

        let base = first.bn.as_deref().ok_or(ProtocolError::MissingBaseName)?;
        let name = BaseName::parse(base)?;
        let timestep = first.bt.map(parse_timestep).transpose()?;

        let mut primary: Option<(Unit, f64)> = None;
        let mut lon = None;
        let mut lat = None;

        for record in &records[1..] {
            if let Some(dup) = &record.bn {
                return Err(ProtocolError::DuplicateBaseName(dup.clone()));
            }
            let tag = record.u.as_deref().ok_or(ProtocolError::MissingField("u"))?;
            let unit = Unit::parse(tag).ok_or_else(|| ProtocolError::UnknownUnit(tag.to_string()))?;
            let value = record.v.ok_or(ProtocolError::MissingField("v"))?;

            match unit {
                Unit::Longitude | Unit::Latitude => {
                    if value < 0.0 {
                        return Err(ProtocolError::NegativeCoordinate {
                            unit: tag.to_string(),
                            value,
                        });
                    }
                    let slot = if unit == Unit::Longitude { &mut lon } else { &mut lat };
                    if slot.replace(value).is_some() {
                        return Err(ProtocolError::DuplicateEntry(tag.to_string()));
                    }
                }
                _ => {
                    if primary.is_some() {
                        return Err(ProtocolError::DuplicatePrimary(tag.to_string()));
                    }
                    primary = Some((unit, value));
                }
            }
        }

        let (unit, value) = primary.ok_or(ProtocolError::MissingPrimary)?;
        let (unit, value) = to_canonical(unit, Some(value));
        let location = match (lon, lat) {
            (Some(lon), Some(lat)) => Some(Location { lon, lat }),
            (None, None) => None,
            _ => return Err(ProtocolError::IncompleteLocation),
        };

        Ok(Reading {
            agent_id: base.to_string(),
            room_id: name.room,
            role: name.role,
            subsystem: name.subsystem,
            unit,
            value,
            timestep,
            location,
        })
    }

    /// Single `{"n","t","u","v"}` record.
    fn normalize_named(&self, record: &SenmlRecord) -> Result<Reading, ProtocolError> {
        let base = record.n.as_deref().ok_or(ProtocolError::MissingField("n"))?;
        let name = BaseName::parse(base)?;
        let tag = record.u.as_deref().ok_or(ProtocolError::MissingField("u"))?;
        let unit = Unit::parse(tag).ok_or_else(|| ProtocolError::UnknownUnit(tag.to_string()))?;
        if !unit.is_primary() {
            return Err(ProtocolError::MissingPrimary);
        }
        let value = record.v.ok_or(ProtocolError::MissingField("v"))?;
        let (unit, value) = to_canonical(unit, Some(value));

        Ok(Reading {
            agent_id: base.to_string(),
            room_id: name.room,
            role: name.role,
            subsystem: name.subsystem,
            unit,
            value,
            timestep: record.t.map(parse_timestep).transpose()?,
            location: None,
        })
    }
}

fn implied_unit(role: Role) -> Option<Unit> {
    match role {
        Role::Sensor => Some(Unit::Kelvin),
        Role::Actuator => Some(Unit::Watt),
        Role::Controller => None,
    }
}

fn to_canonical(unit: Unit, value: Option<f64>) -> (Option<Unit>, Option<f64>) {
    match unit {
        Unit::Celsius => (Some(Unit::Kelvin), value.map(|v| v + CELSIUS_OFFSET)),
        other => (Some(other), value),
    }
}

fn parse_timestep(raw: f64) -> Result<u64, ProtocolError> {
    // u64::MAX as f64 rounds up to 2^64, which is out of range
    if raw.is_finite() && raw >= 0.0 && raw.fract() == 0.0 && raw < u64::MAX as f64 {
        Ok(raw as u64)
    } else {
        Err(ProtocolError::BadTimestep(raw))
    }
}
