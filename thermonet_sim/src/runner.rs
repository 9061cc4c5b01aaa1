//! Scenario runner - executes fault scenarios on a paused tokio clock.

use crate::context::SimContext;
use crate::error::SimError;
use crate::fleet::{ControllerOutcome, Fleet, FleetOptions};
use crate::hub::{HubReport, SessionHub};
use crate::rogue::{spawn_rogue, RogueBehavior};
use crate::scenarios::ScenarioId;

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thermonet_core::registry::{ACTUATOR_SERVICE, TEMPERATURE_SERVICE};
use thermonet_core::{
    BuildingConfig, ConsistencyError, DeviceFamily, EngineConfig, EngineError, EngineFailure,
    RoomId, SimulationEngine, Subsystem, ThermalNetwork, TimeoutAction,
};
use thermonet_env::ThermoContext;
use tracing::{debug, info, warn};

/// Phase timeout while a fault keeps a pair from reporting.
const OUTAGE_PHASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Phase timeout treated as a stall in fault-free scenarios.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Power the stuck cooler keeps posting (W).
const STUCK_COOLER_WATTS: f64 = -300.0;

/// Payloads sent by the malformed agents.
const MALFORMED_PAYLOADS: [&[u8]; 3] = [
    br#"{"name": "A11", "system": "thermostat"}"#,
    br#"[{"bn": "A12_temp_sensor_cooler", "bt": 0}, {"u": "Lon", "v": -1.0}, {"u": "Lat", "v": 1.0}, {"u": "Cel", "v": 20.0}]"#,
    b"definitely not json",
];

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    #[serde(serialize_with = "serialize_scenario")]
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Ticks the engine completed
    pub total_ticks: u64,

    /// Virtual time at the end of the run
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

fn serialize_scenario<S: serde::Serializer>(id: &ScenarioId, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(id.name())
}

impl ScenarioResult {
    fn setup_failed(scenario: ScenarioId, seed: u64, error: SimError) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            total_ticks: 0,
            final_time_secs: 0.0,
            failure_reason: Some(format!("setup failed: {}", error)),
            metrics: ScenarioMetrics::default(),
        }
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScenarioMetrics {
    /// Engine sessions opened
    pub sessions: usize,

    /// Requests answered by the engine
    pub requests: u64,

    /// Requests answered with `{"status": false}`
    pub rejected: u64,

    /// Sessions closed by a malformed message
    pub protocol_closures: usize,

    /// (phase, room, subsystem) triples that missed a phase
    pub stragglers: usize,

    /// Controller steps that delivered an actuation
    pub controller_steps: u64,

    pub backoffs: u64,

    pub rollbacks: u64,

    /// Controller or device hit by the scenario's fault
    pub victim: Option<String>,

    /// Interior temperatures (K) at the start and end of the run
    pub initial_temperatures: BTreeMap<String, f64>,
    pub final_temperatures: BTreeMap<String, f64>,
}

impl ScenarioMetrics {
    /// Mean of `temps`; 0 when empty.
    pub fn mean(temps: &BTreeMap<String, f64>) -> f64 {
        if temps.is_empty() {
            return 0.0;
        }
        temps.values().sum::<f64>() / temps.len() as f64
    }
}

/// Everything observed during one run, before the verdict.
struct RunOutcome {
    ticks: u64,
    min_heat_input: f64,
    engine_error: Option<EngineError>,
    failures: Vec<EngineFailure>,
    hub: HubReport,
    controllers: Vec<ControllerOutcome>,
    rogues: usize,
    victim: Option<String>,
    metrics: ScenarioMetrics,
}

/// Runs fault scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Ticks per scenario
    ticks: u64,

    building: BuildingConfig,

    engine: EngineConfig,

    /// Device families deployed outside family-specific scenarios
    families: Vec<DeviceFamily>,

    /// Std-dev (K) of sensor noise
    sensor_noise: Option<f64>,
}

impl ScenarioRunner {
    /// Creates a new scenario runner on the demo building.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            ticks: 30,
            building: BuildingConfig::demo(),
            engine: EngineConfig::default(),
            families: DeviceFamily::ALL.to_vec(),
            sensor_noise: None,
        }
    }

    /// Sets the number of ticks per scenario.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    pub fn with_building(mut self, building: BuildingConfig) -> Self {
        self.building = building;
        self
    }

    /// Sets the engine tuning. Phase timeouts are chosen per scenario.
    pub fn with_engine_config(mut self, config: EngineConfig) -> Self {
        self.engine = config;
        self
    }

    pub fn with_families(mut self, families: &[DeviceFamily]) -> Self {
        self.families = families.to_vec();
        self
    }

    pub fn with_sensor_noise(mut self, std_dev: f64) -> Self {
        self.sensor_noise = Some(std_dev);
        self
    }

    /// Runs a scenario on its own paused runtime and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build();
        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(e) => return ScenarioResult::setup_failed(scenario, self.seed, e.into()),
        };

        runtime.block_on(async {
            match self.execute(scenario).await {
                Ok(result) => result,
                Err(e) => ScenarioResult::setup_failed(scenario, self.seed, e),
            }
        })
    }

    fn families_for(&self, scenario: ScenarioId) -> Vec<DeviceFamily> {
        match scenario {
            ScenarioId::HeatingOnly => vec![DeviceFamily::A],
            ScenarioId::ConsistencyFault => DeviceFamily::ALL.to_vec(),
            _ => self.families.clone(),
        }
    }

    fn engine_config_for(&self, scenario: ScenarioId) -> EngineConfig {
        if scenario.tolerates_stragglers() {
            self.engine
                .clone()
                .with_phase_timeout(OUTAGE_PHASE_TIMEOUT, TimeoutAction::Proceed)
        } else {
            self.engine
                .clone()
                .with_phase_timeout(STALL_TIMEOUT, TimeoutAction::Fail)
        }
    }

    async fn execute(&self, scenario: ScenarioId) -> Result<ScenarioResult, SimError> {
        let ctx = SimContext::shared(self.seed);
        let families = self.families_for(scenario);

        let mut building = self.building.clone();
        let keep: Vec<Subsystem> = families.iter().map(|f| f.subsystem()).collect();
        building.retain_subsystems(&keep);
        building.validate()?;

        // A heated room also gains a cooler pair, played by the stuck rogue
        let mut victim = None;
        if scenario == ScenarioId::ConsistencyFault {
            let heated: Vec<RoomId> = building
                .rooms
                .iter()
                .filter(|r| r.subsystems.contains(&Subsystem::Heater))
                .map(|r| r.name.clone())
                .collect();
            let index = ctx
                .choose_index(heated.len())
                .ok_or_else(|| SimError::Scenario("no heated room".to_string()))?;
            let room = heated[index].clone();
            building.set_subsystems(&room, &Subsystem::ALL);
            victim = Some(room);
        }

        let engine_config = self.engine_config_for(scenario);
        let mut engine = SimulationEngine::from_building(&building, ctx.clone(), engine_config.clone())?;
        let handle = engine.handle();
        let mut failures = handle.subscribe_failures();
        let mut hub = SessionHub::new(handle.clone(), ctx.clone());

        let interior = building.interior_ids();
        let initial_temperatures = interior_temperatures(&engine.network().temperatures(), &interior);

        let mut options = FleetOptions {
            families,
            sensor_noise: self.sensor_noise,
            dt_secs: engine_config.dt_secs,
            ..FleetOptions::default()
        };
        let mut rogues = 0;
        if let Some(room) = &victim {
            options = options.without(room.clone(), DeviceFamily::B);
        }
        let mut victim = victim.map(|room| room.to_string());

        let mut fleet = Fleet::deploy(&building, &options, &mut hub, ctx.clone()).await?;

        match scenario {
            ScenarioId::ActuatorOutage | ScenarioId::SensorOutage => {
                let names = fleet.controller_names();
                victim = ctx.choose_index(names.len()).map(|i| names[i].clone());
            }
            ScenarioId::MalformedAgent => {
                for (i, payload) in MALFORMED_PAYLOADS.iter().enumerate() {
                    let name = format!("rogue_{}", i);
                    spawn_rogue(&mut hub, ctx.clone(), &name, RogueBehavior::Malformed(payload.to_vec()));
                    rogues += 1;
                }
            }
            ScenarioId::ConsistencyFault => {
                if let Some(room) = &victim {
                    spawn_rogue(
                        &mut hub,
                        ctx.clone(),
                        &format!("{}_stuck_cooler", room),
                        RogueBehavior::StuckActuator {
                            room: RoomId::new(room.as_str()),
                            subsystem: Subsystem::Cooler,
                            watts: STUCK_COOLER_WATTS,
                        },
                    );
                    rogues += 1;
                }
            }
            ScenarioId::SteadyState | ScenarioId::HeatingOnly => {}
        }

        let service = match scenario {
            ScenarioId::ActuatorOutage => Some(ACTUATOR_SERVICE),
            ScenarioId::SensorOutage => Some(TEMPERATURE_SERVICE),
            _ => None,
        };
        let (cut_at, restore_at) = outage_window(self.ticks);

        handle.start();
        let mut completed = 0;
        let mut stragglers = 0;
        let mut min_heat_input = f64::INFINITY;
        let mut engine_error = None;
        let mut final_temperatures = initial_temperatures.clone();

        for tick in 0..self.ticks {
            if let (Some(service), Some(name)) = (service, &victim) {
                if tick == cut_at {
                    info!("tick {}: cutting {} for {}", tick, service, name);
                    fleet.cut_service(name, service).await?;
                } else if tick == restore_at {
                    info!("tick {}: restoring {} for {}", tick, service, name);
                    fleet.restore_service(name, service).await?;
                }
            }

            match engine.step().await {
                Ok(report) => {
                    completed += 1;
                    stragglers += report.stragglers.len();
                    min_heat_input = report.heat_input.values().copied().fold(min_heat_input, f64::min);
                    final_temperatures = interior_temperatures(&report.temperatures, &interior);
                    if tick % 10 == 0 {
                        debug!(
                            "  tick {} | t={:.1}s | mean={:.2}K | stragglers={}",
                            report.timestep,
                            ctx.elapsed_secs(),
                            ScenarioMetrics::mean(&final_temperatures),
                            report.stragglers.len()
                        );
                    }
                }
                Err(e) => {
                    warn!("tick {}: engine stopped: {}", tick, e);
                    engine_error = Some(e);
                    break;
                }
            }

            if tick + 1 < self.ticks {
                ctx.sleep(engine_config.tick_interval()).await;
            }
        }
        handle.shutdown();

        let controllers = fleet.join().await;
        let hub_report = hub.join().await;
        let mut observed = Vec::new();
        while let Ok(failure) = failures.try_recv() {
            observed.push(failure);
        }

        let metrics = ScenarioMetrics {
            sessions: hub_report.sessions,
            requests: hub_report.requests,
            rejected: hub_report.rejected,
            protocol_closures: hub_report.protocol_closures,
            stragglers,
            controller_steps: ok_stats(&controllers).map(|s| s.steps).sum(),
            backoffs: ok_stats(&controllers).map(|s| s.backoffs).sum(),
            rollbacks: ok_stats(&controllers).map(|s| s.rollbacks).sum(),
            victim: victim.clone(),
            initial_temperatures,
            final_temperatures,
        };

        let outcome = RunOutcome {
            ticks: completed,
            min_heat_input,
            engine_error,
            failures: observed,
            hub: hub_report,
            controllers,
            rogues,
            victim,
            metrics,
        };
        let verdict = self.evaluate(scenario, &outcome);
        match &verdict {
            Ok(()) => info!(
                "✓ {} complete: {} ticks, {} steps, {} rollbacks",
                scenario.name(),
                outcome.ticks,
                outcome.metrics.controller_steps,
                outcome.metrics.rollbacks
            ),
            Err(reason) => warn!("{} failed: {}", scenario.name(), reason),
        }

        Ok(ScenarioResult {
            scenario,
            seed: self.seed,
            passed: verdict.is_ok(),
            total_ticks: outcome.ticks,
            final_time_secs: ctx.elapsed_secs(),
            failure_reason: verdict.err(),
            metrics: outcome.metrics,
        })
    }

    /// Checks the scenario's assertions against what the run observed.
    fn evaluate(&self, scenario: ScenarioId, run: &RunOutcome) -> Result<(), String> {
        if scenario.expects_engine_failure() {
            return expect_consistency_fault(run);
        }
        if let Some(e) = &run.engine_error {
            return Err(format!("engine stopped after {} ticks: {}", run.ticks, e));
        }
        if run.ticks != self.ticks {
            return Err(format!("completed {} of {} ticks", run.ticks, self.ticks));
        }
        if let Some(failed) = run.controllers.iter().find(|c| c.result.is_err()) {
            return Err(format!("controller {} failed: {:?}", failed.name, failed.result));
        }
        if !scenario.tolerates_stragglers() && run.metrics.stragglers > 0 {
            return Err(format!("{} stragglers in a fault-free run", run.metrics.stragglers));
        }

        match scenario {
            ScenarioId::SteadyState | ScenarioId::HeatingOnly => {
                if run.hub.protocol_closures > 0 {
                    return Err(format!("{} sessions closed on protocol errors", run.hub.protocol_closures));
                }
                let before = ScenarioMetrics::mean(&run.metrics.initial_temperatures);
                let after = ScenarioMetrics::mean(&run.metrics.final_temperatures);
                if run.ticks > 0 && after <= before {
                    return Err(format!("building did not warm: {:.2}K -> {:.2}K", before, after));
                }
                if scenario == ScenarioId::HeatingOnly && run.min_heat_input < 0.0 {
                    return Err(format!("heat input went negative ({:.1}W)", run.min_heat_input));
                }
                Ok(())
            }
            ScenarioId::ActuatorOutage | ScenarioId::SensorOutage => {
                let victim = run.victim.as_deref().ok_or("no controller to fault")?;
                let stats = run
                    .controllers
                    .iter()
                    .find(|c| c.name == victim)
                    .and_then(|c| c.result.clone().ok())
                    .ok_or_else(|| format!("no outcome for {}", victim))?;
                if run.metrics.stragglers == 0 {
                    return Err("outage produced no stragglers".to_string());
                }
                let others_rolled_back = ok_stats(&run.controllers).map(|s| s.rollbacks).sum::<u64>() - stats.rollbacks;
                if others_rolled_back > 0 {
                    return Err(format!("{} rollbacks outside {}", others_rolled_back, victim));
                }
                if scenario == ScenarioId::ActuatorOutage && stats.rollbacks == 0 {
                    return Err(format!("{} never rolled back", victim));
                }
                if scenario == ScenarioId::SensorOutage && (stats.backoffs == 0 || stats.rollbacks > 0) {
                    return Err(format!(
                        "{}: {} backoffs, {} rollbacks",
                        victim, stats.backoffs, stats.rollbacks
                    ));
                }
                Ok(())
            }
            ScenarioId::MalformedAgent => {
                if run.hub.protocol_closures != run.rogues {
                    return Err(format!(
                        "{} protocol closures for {} rogue agents",
                        run.hub.protocol_closures, run.rogues
                    ));
                }
                if run.hub.closed_agents.iter().any(|a| !a.starts_with("rogue_")) {
                    return Err(format!("healthy sessions closed: {:?}", run.hub.closed_agents));
                }
                Ok(())
            }
            ScenarioId::ConsistencyFault => expect_consistency_fault(run),
        }
    }
}

fn expect_consistency_fault(run: &RunOutcome) -> Result<(), String> {
    let room = run.victim.as_deref().ok_or("no room to fault")?;
    match &run.engine_error {
        Some(EngineError::Consistency(ConsistencyError::SimultaneousHeatingAndCooling {
            room: failed,
            ..
        })) if failed.as_str() == room => {}
        Some(other) => return Err(format!("unexpected engine error: {}", other)),
        None => return Err(format!("engine ran {} ticks without noticing", run.ticks)),
    }
    let broadcast = run
        .failures
        .iter()
        .any(|f| matches!(f, EngineFailure::Consistency { .. }));
    if !broadcast {
        return Err("failure was not broadcast".to_string());
    }
    Ok(())
}

/// Ticks at which an outage starts and ends.
pub fn outage_window(ticks: u64) -> (u64, u64) {
    let cut = (ticks / 3).max(1);
    let restore = ((2 * ticks) / 3).max(cut + 3);
    (cut, restore)
}

fn ok_stats(
    controllers: &[ControllerOutcome],
) -> impl Iterator<Item = thermonet_core::ControlStats> + '_ {
    controllers.iter().filter_map(|c| c.result.clone().ok())
}

fn interior_temperatures(
    temperatures: &thermonet_core::thermal::RoomMap,
    interior: &[RoomId],
) -> BTreeMap<String, f64> {
    interior
        .iter()
        .filter_map(|id| temperatures.get(id).map(|t| (id.to_string(), *t)))
        .collect()
}
