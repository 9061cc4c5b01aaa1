//! Fault scenarios for the building simulation.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// Both families, no faults
    SteadyState,

    /// Heater branch only; no room is ever cooled
    HeatingOnly,

    /// One controller loses its actuator for a window of ticks
    ActuatorOutage,

    /// One controller loses its sensor for a window of ticks
    SensorOutage,

    /// Rogue agents send undecodable messages
    MalformedAgent,

    /// A stuck cooler fights a heater in the same room
    ConsistencyFault,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyState,
            ScenarioId::HeatingOnly,
            ScenarioId::ActuatorOutage,
            ScenarioId::SensorOutage,
            ScenarioId::MalformedAgent,
            ScenarioId::ConsistencyFault,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "steady_state",
            ScenarioId::HeatingOnly => "heating_only",
            ScenarioId::ActuatorOutage => "actuator_outage",
            ScenarioId::SensorOutage => "sensor_outage",
            ScenarioId::MalformedAgent => "malformed_agent",
            ScenarioId::ConsistencyFault => "consistency_fault",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "Full fleet on the demo building, every phase completes",
            ScenarioId::HeatingOnly => "Heater branch only, heat input never negative",
            ScenarioId::ActuatorOutage => "Actuator rule removed then restored, controller rolls back",
            ScenarioId::SensorOutage => "Sensor rule removed then restored, controller backs off",
            ScenarioId::MalformedAgent => "Bad payloads close their own sessions only",
            ScenarioId::ConsistencyFault => "Heating and cooling one room aborts the run",
        }
    }

    /// True when the engine is expected to stop with an error.
    pub fn expects_engine_failure(&self) -> bool {
        matches!(self, ScenarioId::ConsistencyFault)
    }

    /// True when phases are expected to close with stragglers.
    pub fn tolerates_stragglers(&self) -> bool {
        matches!(self, ScenarioId::ActuatorOutage | ScenarioId::SensorOutage)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_state" | "steady" => Ok(ScenarioId::SteadyState),
            "heating_only" | "heating" => Ok(ScenarioId::HeatingOnly),
            "actuator_outage" => Ok(ScenarioId::ActuatorOutage),
            "sensor_outage" => Ok(ScenarioId::SensorOutage),
            "malformed_agent" | "malformed" => Ok(ScenarioId::MalformedAgent),
            "consistency_fault" | "consistency" => Ok(ScenarioId::ConsistencyFault),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_parse_back() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
            assert_eq!(scenario.to_string(), scenario.name());
        }
        assert_eq!("Consistency".parse::<ScenarioId>(), Ok(ScenarioId::ConsistencyFault));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }

    #[test]
    fn test_only_consistency_fault_expects_failure() {
        let failing: Vec<_> = ScenarioId::all()
            .into_iter()
            .filter(|s| s.expects_engine_failure())
            .collect();
        assert_eq!(failing, vec![ScenarioId::ConsistencyFault]);
    }
}
