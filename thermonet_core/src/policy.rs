//! Per-tick hooks: setpoint policy and exterior temperature driver.

use crate::building::RoomId;
use std::f64::consts::TAU;

/// Default setpoint target (K).
pub const DEFAULT_TARGET_SETPOINT: f64 = 298.0;

/// Default exterior temperature: 25 °C.
pub const DEFAULT_EXTERIOR_TEMPERATURE: f64 = 298.15;

/// Recomputes a room's setpoint after every read phase.
pub trait SetpointPolicy: Send + Sync + 'static {
    fn setpoint(&mut self, room: &RoomId, timestep: u64, current: f64) -> f64;
}

/// Same target for every room, every tick.
#[derive(Debug, Clone, Copy)]
pub struct FixedSetpoint(pub f64);

impl Default for FixedSetpoint {
    fn default() -> Self {
        Self(DEFAULT_TARGET_SETPOINT)
    }
}

impl SetpointPolicy for FixedSetpoint {
    fn setpoint(&mut self, _room: &RoomId, _timestep: u64, _current: f64) -> f64 {
        self.0
    }
}

/// Drives the exterior node's temperature at the start of each tick.
pub trait ExteriorDriver: Send + Sync + 'static {
    /// `elapsed_secs` is simulated time at the start of the tick.
    fn exterior_temperature(&mut self, timestep: u64, elapsed_secs: f64) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantExterior(pub f64);

impl Default for ConstantExterior {
    fn default() -> Self {
        Self(DEFAULT_EXTERIOR_TEMPERATURE)
    }
}

impl ExteriorDriver for ConstantExterior {
    fn exterior_temperature(&mut self, _timestep: u64, _elapsed_secs: f64) -> f64 {
        self.0
    }
}

/// Sinusoidal day/night cycle around a mean, coldest at `elapsed = 0`.
#[derive(Debug, Clone, Copy)]
pub struct DailyCycleExterior {
    pub mean: f64,
    pub amplitude: f64,
    pub period_secs: f64,
}

impl Default for DailyCycleExterior {
    fn default() -> Self {
        Self {
            mean: DEFAULT_EXTERIOR_TEMPERATURE,
            amplitude: 5.0,
            period_secs: 86_400.0,
        }
    }
}

impl ExteriorDriver for DailyCycleExterior {
    fn exterior_temperature(&mut self, _timestep: u64, elapsed_secs: f64) -> f64 {
        let phase = TAU * elapsed_secs / self.period_secs;
        self.mean - self.amplitude * phase.cos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_daily_cycle_extremes() {
        let mut driver = DailyCycleExterior {
            mean: 290.0,
            amplitude: 4.0,
            period_secs: 100.0,
        };
        assert_relative_eq!(driver.exterior_temperature(0, 0.0), 286.0);
        assert_relative_eq!(driver.exterior_temperature(5, 50.0), 294.0);
        assert_relative_eq!(driver.exterior_temperature(10, 100.0), 286.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fixed_setpoint_ignores_room() {
        let mut policy = FixedSetpoint::default();
        assert_eq!(policy.setpoint(&RoomId::new("A11"), 3, 280.0), 298.0);
    }
}
