//! Thermal network collaborator.
//!
//! The engine only depends on [`ThermalNetwork`]; [`RoomGraph`] is the
//! default model, an explicit Euler step over the conductance graph.

use crate::building::{BuildingConfig, ConfigError, RoomId};
use nalgebra::Point2;
use std::collections::BTreeMap;
use thiserror::Error;

/// Per-room temperatures (K) or heat inputs (W), keyed by room.
pub type RoomMap = BTreeMap<RoomId, f64>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ThermalError {
    #[error("No previous temperature for room '{0}'")]
    MissingTemperature(RoomId),

    #[error("Temperature of room '{room}' diverged to {value}")]
    NonFinite { room: RoomId, value: f64 },
}

/// The building's thermal model as seen by the simulation engine.
pub trait ThermalNetwork: Send + Sync + 'static {
    /// Id of the exterior boundary node.
    fn exterior_id(&self) -> &RoomId;

    /// Ids of every interior room.
    fn interior_ids(&self) -> Vec<RoomId>;

    /// Current temperature of every node, exterior included.
    fn temperatures(&self) -> RoomMap;

    /// Drives the exterior node's temperature for the coming tick.
    fn set_exterior_temperature(&mut self, kelvin: f64);

    /// Advances every interior room by `dt` seconds.
    ///
    /// `previous` holds the temperatures at the start of the tick and is the
    /// only input to the neighbour exchange, so the result does not depend
    /// on room iteration order. Returns the new temperature of every node.
    fn update_temperature(
        &mut self,
        previous: &RoomMap,
        dt: f64,
        diffusion_coefficient: f64,
        heat_input: &RoomMap,
    ) -> Result<RoomMap, ThermalError>;
}

/// A room node in the graph.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    pub temperature: f64,
    /// J/K; infinite for the exterior node
    pub heat_capacity: f64,
    pub position: Point2<f64>,
    /// Directed edges (neighbour, conductance) feeding this room
    pub neighbors: Vec<(RoomId, f64)>,
}

impl Room {
    pub fn is_static(&self) -> bool {
        self.heat_capacity.is_infinite()
    }
}

/// Default thermal model built from a [`BuildingConfig`].
#[derive(Debug, Clone)]
pub struct RoomGraph {
    exterior: Room,
    rooms: BTreeMap<RoomId, Room>,
}

impl RoomGraph {
    pub fn from_config(config: &BuildingConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let exterior = Room {
            id: config.exterior.name.clone(),
            temperature: config.exterior.initial_temperature,
            heat_capacity: f64::INFINITY,
            position: Point2::new(config.exterior.position[0], config.exterior.position[1]),
            neighbors: Vec::new(),
        };

        let rooms = config
            .rooms
            .iter()
            .map(|spec| {
                let room = Room {
                    id: spec.name.clone(),
                    temperature: spec.initial_temperature,
                    heat_capacity: spec.heat_capacity,
                    position: spec.position(),
                    neighbors: spec
                        .neighbors
                        .iter()
                        .map(|e| (e.to.clone(), e.conductance))
                        .collect(),
                };
                (spec.name.clone(), room)
            })
            .collect();

        Ok(Self { exterior, rooms })
    }

    pub fn room(&self, id: &RoomId) -> Option<&Room> {
        if id == &self.exterior.id {
            Some(&self.exterior)
        } else {
            self.rooms.get(id)
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl ThermalNetwork for RoomGraph {
    fn exterior_id(&self) -> &RoomId {
        &self.exterior.id
    }

    fn interior_ids(&self) -> Vec<RoomId> {
        self.rooms.keys().cloned().collect()
    }

    fn temperatures(&self) -> RoomMap {
        let mut temps: RoomMap = self
            .rooms
            .values()
            .map(|r| (r.id.clone(), r.temperature))
            .collect();
        temps.insert(self.exterior.id.clone(), self.exterior.temperature);
        temps
    }

    fn set_exterior_temperature(&mut self, kelvin: f64) {
        self.exterior.temperature = kelvin;
    }

    fn update_temperature(
        &mut self,
        previous: &RoomMap,
        dt: f64,
        diffusion_coefficient: f64,
        heat_input: &RoomMap,
    ) -> Result<RoomMap, ThermalError> {
        let mut next = BTreeMap::new();

        for room in self.rooms.values() {
            let own = *previous
                .get(&room.id)
                .ok_or_else(|| ThermalError::MissingTemperature(room.id.clone()))?;

            let mut exchange = 0.0;
            for (neighbor, conductance) in &room.neighbors {
                let other = *previous
                    .get(neighbor)
                    .ok_or_else(|| ThermalError::MissingTemperature(neighbor.clone()))?;
                exchange += conductance * (other - own);
            }

            let power = heat_input.get(&room.id).copied().unwrap_or(0.0);
            let value = own + dt * (diffusion_coefficient * exchange + power / room.heat_capacity);
            if !value.is_finite() {
                return Err(ThermalError::NonFinite {
                    room: room.id.clone(),
                    value,
                });
            }
            next.insert(room.id.clone(), value);
        }

        // Commit only once every room succeeded
        for (id, value) in &next {
            if let Some(room) = self.rooms.get_mut(id) {
                room.temperature = *value;
            }
        }
        next.insert(self.exterior.id.clone(), self.exterior.temperature);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::ExteriorSpec;
    use approx::assert_relative_eq;

    fn two_rooms() -> BuildingConfig {
        let mut building = BuildingConfig::new(ExteriorSpec {
            name: "OO".into(),
            position: [0.0, 0.0],
            initial_temperature: 280.0,
        });
        building
            .add_room("R1", [0.0, 0.0], 1000.0, 300.0)
            .add_room("R2", [1.0, 0.0], 1000.0, 290.0);
        building.connect(&"R1".into(), &"R2".into(), 1.0);
        building
    }

    #[test]
    fn test_heat_input_raises_temperature() {
        let mut graph = RoomGraph::from_config(&two_rooms()).unwrap();
        let previous = graph.temperatures();
        let heat: RoomMap = [(RoomId::new("R2"), 500.0)].into_iter().collect();

        let next = graph.update_temperature(&previous, 10.0, 0.0, &heat).unwrap();

        // 290 + 10 * 500 / 1000
        assert_relative_eq!(next[&RoomId::new("R2")], 295.0);
        assert_relative_eq!(next[&RoomId::new("R1")], 300.0);
    }

    #[test]
    fn test_diffusion_moves_heat_towards_colder_room() {
        let mut graph = RoomGraph::from_config(&two_rooms()).unwrap();
        let previous = graph.temperatures();

        let next = graph
            .update_temperature(&previous, 10.0, 1e-3, &RoomMap::new())
            .unwrap();

        // Symmetric edge: R1 loses exactly what R2 gains
        assert_relative_eq!(next[&RoomId::new("R1")], 300.0 - 0.1);
        assert_relative_eq!(next[&RoomId::new("R2")], 290.0 + 0.1);
    }

    #[test]
    fn test_exterior_is_driven_not_computed() {
        let mut config = two_rooms();
        config.link(&"R1".into(), &"OO".into(), 5.0);
        let mut graph = RoomGraph::from_config(&config).unwrap();

        graph.set_exterior_temperature(250.0);
        let previous = graph.temperatures();
        let next = graph
            .update_temperature(&previous, 10.0, 1e-3, &RoomMap::new())
            .unwrap();

        assert_eq!(next[&RoomId::new("OO")], 250.0);
        assert!(next[&RoomId::new("R1")] < 300.0);
    }

    #[test]
    fn test_missing_previous_temperature_leaves_state_untouched() {
        let mut graph = RoomGraph::from_config(&two_rooms()).unwrap();
        let mut previous = graph.temperatures();
        previous.remove(&RoomId::new("R2"));

        let err = graph
            .update_temperature(&previous, 10.0, 1e-3, &RoomMap::new())
            .unwrap_err();
        assert!(matches!(err, ThermalError::MissingTemperature(_)));
        assert_eq!(graph.room(&"R1".into()).unwrap().temperature, 300.0);
    }
}
