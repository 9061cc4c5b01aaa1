//! Building topology: room identities, subsystems and the room graph config.
//!
//! The configuration is the single place where the room graph is declared.
//! [`BuildingConfig::demo`] builds the eight-room, two-storey demo building;
//! custom buildings can be assembled with the builder methods or loaded
//! from JSON.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Default heat capacity of an interior room (J/K).
pub const DEFAULT_HEAT_CAPACITY: f64 = 46e3;

/// Identifier of a room in the thermal network.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// One of the two device branches that report for a room each phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subsystem {
    /// Branch A: heating actuators, positive power
    Heater,
    /// Branch B: cooling actuators, negative power
    Cooler,
}

impl Subsystem {
    pub const ALL: [Subsystem; 2] = [Subsystem::Heater, Subsystem::Cooler];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Heater => "heater",
            Subsystem::Cooler => "cooler",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subsystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heater" => Ok(Subsystem::Heater),
            "cooler" => Ok(Subsystem::Cooler),
            other => Err(format!("unknown subsystem '{}'", other)),
        }
    }
}

/// Errors raised while building or loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Room '{0}' declared twice")]
    DuplicateRoom(RoomId),

    #[error("Edge {from} -> {to} points at an unknown room")]
    UnknownNeighbor { from: RoomId, to: RoomId },

    #[error("Unknown room '{0}'")]
    UnknownRoom(RoomId),

    #[error("Room '{room}' has invalid heat capacity {value}")]
    InvalidHeatCapacity { room: RoomId, value: f64 },

    #[error("Edge {from} -> {to} has invalid conductance {value}")]
    InvalidConductance { from: RoomId, to: RoomId, value: f64 },

    #[error("Building has no interior rooms")]
    NoRooms,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

/// A directed edge carrying heat from a neighbour into the owning room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub to: RoomId,
    pub conductance: f64,
}

/// An interior room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSpec {
    pub name: RoomId,

    /// Display-only position
    pub position: [f64; 2],

    #[serde(default = "default_heat_capacity")]
    pub heat_capacity: f64,

    /// Starting temperature (K)
    pub initial_temperature: f64,

    /// Device branches reporting for this room each phase
    #[serde(default = "all_subsystems")]
    pub subsystems: Vec<Subsystem>,

    #[serde(default)]
    pub neighbors: Vec<EdgeSpec>,
}

impl RoomSpec {
    pub fn position(&self) -> Point2<f64> {
        Point2::new(self.position[0], self.position[1])
    }
}

/// The exterior boundary node: infinite heat capacity, driven temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExteriorSpec {
    pub name: RoomId,
    pub position: [f64; 2],
    pub initial_temperature: f64,
}

fn default_heat_capacity() -> f64 {
    DEFAULT_HEAT_CAPACITY
}

fn all_subsystems() -> Vec<Subsystem> {
    Subsystem::ALL.to_vec()
}

/// Room graph declaration for one building.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingConfig {
    pub exterior: ExteriorSpec,
    pub rooms: Vec<RoomSpec>,
}

impl BuildingConfig {
    /// Creates an empty building around the given exterior node.
    pub fn new(exterior: ExteriorSpec) -> Self {
        Self {
            exterior,
            rooms: Vec::new(),
        }
    }

    /// Adds an interior room with both subsystems and no edges.
    pub fn add_room(
        &mut self,
        name: impl Into<RoomId>,
        position: [f64; 2],
        heat_capacity: f64,
        initial_temperature: f64,
    ) -> &mut Self {
        self.rooms.push(RoomSpec {
            name: name.into(),
            position,
            heat_capacity,
            initial_temperature,
            subsystems: all_subsystems(),
            neighbors: Vec::new(),
        });
        self
    }

    /// Declares a single directed edge: heat flows from `to` into `from`.
    ///
    /// Edges whose owner is the exterior are ignored by the thermal model,
    /// so the exterior is never given edges here.
    pub fn link(&mut self, from: &RoomId, to: &RoomId, conductance: f64) -> &mut Self {
        if let Some(room) = self.rooms.iter_mut().find(|r| &r.name == from) {
            room.neighbors.push(EdgeSpec {
                to: to.clone(),
                conductance,
            });
        }
        self
    }

    /// Declares both directed edges between two rooms with one conductance.
    pub fn connect(&mut self, a: &RoomId, b: &RoomId, conductance: f64) -> &mut Self {
        self.link(a, b, conductance);
        self.link(b, a, conductance);
        self
    }

    /// Restricts a room to the given subsystems.
    pub fn set_subsystems(&mut self, room: &RoomId, subsystems: &[Subsystem]) -> &mut Self {
        if let Some(spec) = self.rooms.iter_mut().find(|r| &r.name == room) {
            spec.subsystems = subsystems.to_vec();
        }
        self
    }

    /// Keeps only the given subsystems in every room.
    pub fn retain_subsystems(&mut self, keep: &[Subsystem]) -> &mut Self {
        for room in &mut self.rooms {
            room.subsystems.retain(|s| keep.contains(s));
        }
        self
    }

    /// Checks names, edges and capacities.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rooms.is_empty() {
            return Err(ConfigError::NoRooms);
        }

        let mut names = BTreeSet::new();
        names.insert(self.exterior.name.clone());
        for room in &self.rooms {
            if !names.insert(room.name.clone()) {
                return Err(ConfigError::DuplicateRoom(room.name.clone()));
            }
        }

        for room in &self.rooms {
            if !(room.heat_capacity > 0.0) {
                return Err(ConfigError::InvalidHeatCapacity {
                    room: room.name.clone(),
                    value: room.heat_capacity,
                });
            }
            for edge in &room.neighbors {
                if !names.contains(&edge.to) {
                    return Err(ConfigError::UnknownNeighbor {
                        from: room.name.clone(),
                        to: edge.to.clone(),
                    });
                }
                if !edge.conductance.is_finite() || edge.conductance < 0.0 {
                    return Err(ConfigError::InvalidConductance {
                        from: room.name.clone(),
                        to: edge.to.clone(),
                        value: edge.conductance,
                    });
                }
            }
        }
        Ok(())
    }

    /// Interior room ids in declaration order.
    pub fn interior_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|r| r.name.clone()).collect()
    }

    pub fn room(&self, id: &RoomId) -> Option<&RoomSpec> {
        self.rooms.iter().find(|r| &r.name == id)
    }

    /// Subsystems expected to report per room in every phase.
    pub fn participants(&self) -> BTreeMap<RoomId, Vec<Subsystem>> {
        self.rooms
            .iter()
            .map(|r| (r.name.clone(), r.subsystems.clone()))
            .collect()
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_json_str(&text)
    }

    /// The eight-room demo building: two rows of four rooms around one
    /// exterior node. Corner rooms have twice the exterior exposure.
    ///
    /// The `A1x` row is heated and the `A2x` row is cooled. No room hosts
    /// both subsystems, since two independent controllers in one room end
    /// up heating and cooling it in the same tick.
    pub fn demo() -> Self {
        const NAMES: [&str; 8] = ["A11", "A12", "A13", "A14", "A21", "A22", "A23", "A24"];
        const POSITIONS: [[f64; 2]; 8] = [
            [0.0, 0.0],
            [1.0, 0.0],
            [2.0, 0.0],
            [3.0, 0.0],
            [1.0, 1.0],
            [2.0, 1.0],
            [3.0, 1.0],
            [4.0, 1.0],
        ];

        let outside = RoomId::new("OO");
        let mut building = Self::new(ExteriorSpec {
            name: outside.clone(),
            position: [0.0, 2.0],
            initial_temperature: 273.0,
        });
        for (name, pos) in NAMES.iter().zip(POSITIONS) {
            building.add_room(*name, pos, DEFAULT_HEAT_CAPACITY, 273.0);
        }

        let id = |name: &str| RoomId::new(name);
        for row in ["A1", "A2"] {
            for col in 1..4 {
                let a = id(&format!("{}{}", row, col));
                let b = id(&format!("{}{}", row, col + 1));
                building.connect(&a, &b, 1.0);
            }
        }
        for col in 1..=4 {
            building.connect(&id(&format!("A1{}", col)), &id(&format!("A2{}", col)), 1.0);
        }
        for name in NAMES {
            let exposure = if name.ends_with('1') || name.ends_with('4') { 2.0 } else { 1.0 };
            building.link(&id(name), &outside, exposure);
            let subsystem = if name.starts_with("A1") { Subsystem::Heater } else { Subsystem::Cooler };
            building.set_subsystems(&id(name), &[subsystem]);
        }
        building
    }
}
