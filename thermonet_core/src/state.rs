//! Simulation state owned by the engine task.

use crate::building::{RoomId, Subsystem};
use crate::thermal::RoomMap;
use serde::Serialize;
use thiserror::Error;

/// Invariant violation in shared state. Aborts the tick.
#[derive(Debug, Error, Clone, PartialEq, Serialize)]
pub enum ConsistencyError {
    #[error("Room {room} is heated ({heating} W) and cooled ({cooling} W) in the same tick")]
    SimultaneousHeatingAndCooling {
        room: RoomId,
        heating: f64,
        cooling: f64,
    },

    #[error("Room {room} has {subsystem} power {value} W with the wrong sign")]
    WrongSign {
        room: RoomId,
        subsystem: Subsystem,
        value: f64,
    },

    #[error("Actuation for unknown room {0}")]
    UnknownRoom(RoomId),
}

/// Timestep, per-room heating/cooling power and setpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationState {
    timestep: u64,
    /// W, never negative
    heating: RoomMap,
    /// W, never positive
    cooling: RoomMap,
    /// K
    setpoints: RoomMap,
}

impl SimulationState {
    pub fn new(rooms: &[RoomId], initial_setpoint: f64) -> Self {
        let zeros: RoomMap = rooms.iter().map(|r| (r.clone(), 0.0)).collect();
        Self {
            timestep: 0,
            heating: zeros.clone(),
            cooling: zeros,
            setpoints: rooms.iter().map(|r| (r.clone(), initial_setpoint)).collect(),
        }
    }

    pub fn timestep(&self) -> u64 {
        self.timestep
    }

    pub fn advance(&mut self) -> u64 {
        self.timestep += 1;
        self.timestep
    }

    pub fn setpoint(&self, room: &RoomId) -> Option<f64> {
        self.setpoints.get(room).copied()
    }

    pub fn setpoints(&self) -> &RoomMap {
        &self.setpoints
    }

    pub fn set_setpoint(&mut self, room: &RoomId, kelvin: f64) {
        if let Some(slot) = self.setpoints.get_mut(room) {
            *slot = kelvin;
        }
    }

    pub fn heating(&self, room: &RoomId) -> Option<f64> {
        self.heating.get(room).copied()
    }

    pub fn cooling(&self, room: &RoomId) -> Option<f64> {
        self.cooling.get(room).copied()
    }

    /// Stores the latest actuation for one subsystem of a room.
    pub fn apply_actuation(
        &mut self,
        room: &RoomId,
        subsystem: Subsystem,
        value: f64,
    ) -> Result<(), ConsistencyError> {
        let wrong_sign = match subsystem {
            Subsystem::Heater => value < 0.0,
            Subsystem::Cooler => value > 0.0,
        };
        if wrong_sign || !value.is_finite() {
            return Err(ConsistencyError::WrongSign {
                room: room.clone(),
                subsystem,
                value,
            });
        }
        let table = match subsystem {
            Subsystem::Heater => &mut self.heating,
            Subsystem::Cooler => &mut self.cooling,
        };
        let slot = table
            .get_mut(room)
            .ok_or_else(|| ConsistencyError::UnknownRoom(room.clone()))?;
        *slot = value;
        Ok(())
    }

    /// Net heat input per room (heating + cooling).
    ///
    /// Fails on the first room that is both heated and cooled.
    pub fn net_heat_input(&self) -> Result<RoomMap, ConsistencyError> {
        let mut net = RoomMap::new();
        for (room, heating) in &self.heating {
            let cooling = self.cooling.get(room).copied().unwrap_or(0.0);
            if *heating != 0.0 && cooling != 0.0 {
                return Err(ConsistencyError::SimultaneousHeatingAndCooling {
                    room: room.clone(),
                    heating: *heating,
                    cooling,
                });
            }
            net.insert(room.clone(), heating + cooling);
        }
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rooms() -> Vec<RoomId> {
        vec![RoomId::new("A11"), RoomId::new("A12")]
    }

    #[test]
    fn test_initial_state() {
        let state = SimulationState::new(&rooms(), 293.15);
        assert_eq!(state.timestep(), 0);
        assert_eq!(state.setpoint(&RoomId::new("A12")), Some(293.15));
        assert_eq!(state.net_heat_input().unwrap()[&RoomId::new("A11")], 0.0);
    }

    #[test]
    fn test_heating_and_cooling_in_same_room_is_fatal() {
        let mut state = SimulationState::new(&rooms(), 293.15);
        let a11 = RoomId::new("A11");
        state.apply_actuation(&a11, Subsystem::Heater, 5.0).unwrap();
        state.apply_actuation(&a11, Subsystem::Cooler, -3.0).unwrap();

        let err = state.net_heat_input().unwrap_err();
        assert_eq!(
            err,
            ConsistencyError::SimultaneousHeatingAndCooling {
                room: a11,
                heating: 5.0,
                cooling: -3.0
            }
        );
    }

    #[test]
    fn test_net_heat_is_sum_per_room() {
        let mut state = SimulationState::new(&rooms(), 293.15);
        state.apply_actuation(&RoomId::new("A11"), Subsystem::Heater, 750.0).unwrap();
        state.apply_actuation(&RoomId::new("A12"), Subsystem::Cooler, -200.0).unwrap();

        let net = state.net_heat_input().unwrap();
        assert_eq!(net[&RoomId::new("A11")], 750.0);
        assert_eq!(net[&RoomId::new("A12")], -200.0);
    }

    #[test]
    fn test_sign_is_enforced_per_subsystem() {
        let mut state = SimulationState::new(&rooms(), 293.15);
        let a11 = RoomId::new("A11");
        assert!(state.apply_actuation(&a11, Subsystem::Heater, -1.0).is_err());
        assert!(state.apply_actuation(&a11, Subsystem::Cooler, 1.0).is_err());
        assert!(state.apply_actuation(&RoomId::new("B1"), Subsystem::Heater, 1.0).is_err());
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut state = SimulationState::new(&rooms(), 293.15);
        assert_eq!(state.advance(), 1);
        assert_eq!(state.advance(), 2);
    }
}
