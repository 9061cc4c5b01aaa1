//! Simulation engine: the single leader driving fixed-step ticks.
//!
//! # Tick
//!
//! ```text
//!  snapshot ─► drive exterior ─► publish view ─► settle ─► READ PHASE
//!      ─► setpoints ─► settle ─► drain actuations ─► net heat (checked)
//!      ─► update_temperature ─► publish ─► UPDATE PHASE ─► timestep += 1
//! ```
//!
//! The engine owns the thermal network and [`SimulationState`] and mutates
//! them only from its own task. Agent sessions interact through a cloned
//! [`EngineHandle`], which touches nothing but the barriers, the published
//! view and the actuation buffer.

use crate::barrier::{BarrierError, Phase, PhaseBarrier};
use crate::building::{BuildingConfig, ConfigError, RoomId, Subsystem};
use crate::policy::{ConstantExterior, ExteriorDriver, FixedSetpoint, SetpointPolicy};
use crate::reading::{ProtocolError, Reading};
use crate::state::{ConsistencyError, SimulationState};
use crate::thermal::{RoomGraph, RoomMap, ThermalError, ThermalNetwork};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thermonet_env::ThermoContext;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, trace, warn};

/// Initial setpoint of every room (K).
pub const DEFAULT_INITIAL_SETPOINT: f64 = 293.15;

/// What the leader does when a phase outlives `phase_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
    /// End the run with [`EngineError::PhaseTimeout`]
    Fail,
    /// Log the stragglers and close the phase without them
    Proceed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds of simulated time per tick
    pub dt_secs: f64,
    pub diffusion_coefficient: f64,
    pub initial_setpoint: f64,
    /// Pause before each phase is released
    pub phase_settle_ms: u64,
    /// Pause between ticks
    pub tick_interval_ms: u64,
    /// `None` blocks on stragglers forever
    pub phase_timeout_ms: Option<u64>,
    pub on_timeout: TimeoutAction,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dt_secs: 10.0,
            diffusion_coefficient: 1e-4,
            initial_setpoint: DEFAULT_INITIAL_SETPOINT,
            phase_settle_ms: 200,
            tick_interval_ms: 2000,
            phase_timeout_ms: None,
            on_timeout: TimeoutAction::Proceed,
        }
    }
}

impl EngineConfig {
    /// Timeouts beyond `u64::MAX` milliseconds are clamped to it.
    pub fn with_phase_timeout(mut self, timeout: Duration, action: TimeoutAction) -> Self {
        self.phase_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self.on_timeout = action;
        self
    }

    pub fn with_dt(mut self, dt_secs: f64) -> Self {
        self.dt_secs = dt_secs;
        self
    }

    pub fn with_diffusion(mut self, coefficient: f64) -> Self {
        self.diffusion_coefficient = coefficient;
        self
    }

    pub fn phase_settle(&self) -> Duration {
        Duration::from_millis(self.phase_settle_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn phase_timeout(&self) -> Option<Duration> {
        self.phase_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt_secs.is_finite() && self.dt_secs > 0.0) {
            return Err(ConfigError::InvalidParameter(format!("dt_secs = {}", self.dt_secs)));
        }
        if !(self.diffusion_coefficient.is_finite() && self.diffusion_coefficient >= 0.0) {
            return Err(ConfigError::InvalidParameter(format!(
                "diffusion_coefficient = {}",
                self.diffusion_coefficient
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    AwaitStart,
    ReadPhase,
    UpdatePhase,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    pub state: EngineState,
    pub timestep: u64,
}

/// Operator-visible fatal condition, broadcast before the run ends.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineFailure {
    Consistency { timestep: u64, error: ConsistencyError },
    Thermal { timestep: u64, error: ThermalError },
    PhaseTimeout {
        timestep: u64,
        phase: Phase,
        stragglers: Vec<(RoomId, Subsystem)>,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Thermal(#[from] ThermalError),

    #[error("{phase} phase timed out waiting for {stragglers:?}")]
    PhaseTimeout {
        phase: Phase,
        stragglers: Vec<(RoomId, Subsystem)>,
    },

    #[error("Engine cancelled")]
    Cancelled,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of one `EngineHandle` call, scoped to the calling session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SubmitError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("({room}, {subsystem}) is not part of this building")]
    UnknownEntity { room: RoomId, subsystem: Subsystem },

    #[error("Engine cancelled")]
    Cancelled,
}

impl From<BarrierError> for SubmitError {
    fn from(e: BarrierError) -> Self {
        match e {
            BarrierError::UnknownParticipant { room, subsystem } => {
                SubmitError::UnknownEntity { room, subsystem }
            }
            BarrierError::Closed | BarrierError::Cancelled => SubmitError::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementAck {
    pub temperature: f64,
    pub setpoint: f64,
    pub timestep: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuationAck {
    pub timestep: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetpointReply {
    Setpoint { setpoint: f64, timestep: u64 },
    Rejected { timestep: u64 },
}

/// Outcome of one completed tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub timestep: u64,
    pub exterior_temperature: f64,
    pub temperatures: RoomMap,
    pub heat_input: RoomMap,
    pub stragglers: Vec<(Phase, RoomId, Subsystem)>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Control {
    started: bool,
    cancelled: bool,
}

/// What sessions may read during a tick.
#[derive(Debug, Clone, Default)]
struct TickView {
    timestep: u64,
    temperatures: RoomMap,
    setpoints: RoomMap,
}

struct Shared {
    read: PhaseBarrier,
    update: PhaseBarrier,
    view: RwLock<TickView>,
    pending: Mutex<BTreeMap<(RoomId, Subsystem), f64>>,
    control: watch::Sender<Control>,
    status: watch::Sender<EngineStatus>,
    timestep: watch::Sender<u64>,
    failures: broadcast::Sender<EngineFailure>,
}

impl Shared {
    fn barrier(&self, phase: Phase) -> &PhaseBarrier {
        match phase {
            Phase::Read => &self.read,
            Phase::Update => &self.update,
        }
    }

    fn shutdown(&self) {
        self.control.send_modify(|c| c.cancelled = true);
        self.read.cancel();
        self.update.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.control.borrow().cancelled
    }

    async fn cancelled(&self) {
        let mut rx = self.control.subscribe();
        // Sender lives as long as `self`
        let _ = rx.wait_for(|c| c.cancelled).await;
    }

    fn set_state(&self, state: EngineState) {
        self.status.send_modify(|s| s.state = state);
    }
}

/// Cloneable entry point used by agent sessions.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn start(&self) {
        self.shared.control.send_modify(|c| c.started = true);
    }

    /// Cancels the engine and wakes every blocked session.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Resolves once the engine is cancelled or has failed.
    pub async fn cancelled(&self) {
        self.shared.cancelled().await
    }

    pub fn state(&self) -> EngineState {
        self.shared.status.borrow().state
    }

    pub fn timestep(&self) -> u64 {
        *self.shared.timestep.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe_timestep(&self) -> watch::Receiver<u64> {
        self.shared.timestep.subscribe()
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<EngineFailure> {
        self.shared.failures.subscribe()
    }

    /// Waits for the read phase, returns this tick's snapshot for the room
    /// and records the pair's completion.
    ///
    /// The sensor's own `reading` is only logged; the reply always carries
    /// the engine's snapshot.
    pub async fn submit_measurement(
        &self,
        room: &RoomId,
        subsystem: Subsystem,
        reading: &Reading,
    ) -> Result<MeasurementAck, SubmitError> {
        trace!(
            "measurement from {} for ({}, {}): {:?}",
            reading.agent_id,
            room,
            subsystem,
            reading.value
        );
        let barrier = &self.shared.read;
        loop {
            let generation = barrier.await_open_and_release(room, subsystem).await?;
            let ack = {
                let view = self.shared.view.read().unwrap();
                let temperature = view.temperatures.get(room).copied();
                let setpoint = view.setpoints.get(room).copied();
                match (temperature, setpoint) {
                    (Some(temperature), Some(setpoint)) => MeasurementAck {
                        temperature,
                        setpoint,
                        timestep: view.timestep,
                    },
                    _ => {
                        return Err(SubmitError::UnknownEntity {
                            room: room.clone(),
                            subsystem,
                        })
                    }
                }
            };
            match barrier.open_in(generation, room, subsystem) {
                Ok(_) => return Ok(ack),
                // Phase closed under us; report in the next one
                Err(BarrierError::Closed) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Buffers an actuation, then waits for the update phase and records
    /// the pair's completion.
    ///
    /// Heater power must be non-negative and cooler power non-positive.
    pub async fn submit_actuation(
        &self,
        room: &RoomId,
        subsystem: Subsystem,
        value: f64,
    ) -> Result<ActuationAck, SubmitError> {
        let wrong_sign = match subsystem {
            Subsystem::Heater => value < 0.0,
            Subsystem::Cooler => value > 0.0,
        };
        if wrong_sign || !value.is_finite() {
            return Err(ProtocolError::InvalidActuation { subsystem, value }.into());
        }

        let barrier = &self.shared.update;
        if !barrier.contains(room, subsystem) {
            return Err(SubmitError::UnknownEntity {
                room: room.clone(),
                subsystem,
            });
        }
        self.shared
            .pending
            .lock()
            .unwrap()
            .insert((room.clone(), subsystem), value);

        loop {
            let generation = barrier.await_open_and_release(room, subsystem).await?;
            let timestep = self.shared.view.read().unwrap().timestep;
            match barrier.open_in(generation, room, subsystem) {
                Ok(_) => return Ok(ActuationAck { timestep }),
                Err(BarrierError::Closed) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current setpoint; never blocks.
    pub fn query_setpoint(&self, room: &RoomId) -> SetpointReply {
        let view = self.shared.view.read().unwrap();
        match view.setpoints.get(room) {
            Some(setpoint) => SetpointReply::Setpoint {
                setpoint: *setpoint,
                timestep: view.timestep,
            },
            None => SetpointReply::Rejected {
                timestep: view.timestep,
            },
        }
    }
}

/// The single simulation leader.
pub struct SimulationEngine<N: ThermalNetwork, C: ThermoContext> {
    network: N,
    ctx: Arc<C>,
    config: EngineConfig,
    state: SimulationState,
    policy: Box<dyn SetpointPolicy>,
    exterior: Box<dyn ExteriorDriver>,
    shared: Arc<Shared>,
}

impl<C: ThermoContext> SimulationEngine<RoomGraph, C> {
    /// Builds the default room graph and the barriers from one building.
    pub fn from_building(
        building: &BuildingConfig,
        ctx: Arc<C>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        let network = RoomGraph::from_config(building)?;
        Self::new(network, &building.participants(), ctx, config)
    }
}

impl<N: ThermalNetwork, C: ThermoContext> SimulationEngine<N, C> {
    /// `participants` lists the subsystems expected per room in each phase.
    pub fn new(
        network: N,
        participants: &BTreeMap<RoomId, Vec<Subsystem>>,
        ctx: Arc<C>,
        config: EngineConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let rooms = network.interior_ids();
        if let Some(unknown) = participants.keys().find(|r| !rooms.contains(r)) {
            return Err(ConfigError::UnknownRoom(unknown.clone()));
        }

        let state = SimulationState::new(&rooms, config.initial_setpoint);
        let view = TickView {
            timestep: 0,
            temperatures: network.temperatures(),
            setpoints: state.setpoints().clone(),
        };
        let (failures, _) = broadcast::channel(16);

        let shared = Arc::new(Shared {
            read: PhaseBarrier::new(Phase::Read, participants),
            update: PhaseBarrier::new(Phase::Update, participants),
            view: RwLock::new(view),
            pending: Mutex::new(BTreeMap::new()),
            control: watch::channel(Control::default()).0,
            status: watch::channel(EngineStatus {
                state: EngineState::AwaitStart,
                timestep: 0,
            })
            .0,
            timestep: watch::channel(0).0,
            failures,
        });

        Ok(Self {
            network,
            ctx,
            config,
            state,
            policy: Box::new(FixedSetpoint::default()),
            exterior: Box::new(ConstantExterior::default()),
            shared,
        })
    }

    pub fn with_setpoint_policy(mut self, policy: impl SetpointPolicy) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn with_exterior_driver(mut self, driver: impl ExteriorDriver) -> Self {
        self.exterior = Box::new(driver);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Waits for `EngineHandle::start`. Returns `false` if cancelled first.
    pub async fn wait_for_start(&self) -> bool {
        let mut rx = self.shared.control.subscribe();
        let started = match rx.wait_for(|c| c.started || c.cancelled).await {
            Ok(control) => !control.cancelled,
            Err(_) => false,
        };
        started
    }

    /// Runs ticks until cancelled or a fatal error.
    pub async fn run(&mut self) -> Result<u64, EngineError> {
        self.run_until(None).await
    }

    /// Runs at most `ticks` ticks, then stops the engine.
    pub async fn run_ticks(&mut self, ticks: u64) -> Result<u64, EngineError> {
        self.run_until(Some(ticks)).await
    }

    async fn run_until(&mut self, limit: Option<u64>) -> Result<u64, EngineError> {
        if !self.wait_for_start().await {
            self.stop();
            return Ok(0);
        }
        info!(
            "Engine started: {} rooms, dt={}s",
            self.network.interior_ids().len(),
            self.config.dt_secs
        );

        let mut completed = 0;
        while limit.map_or(true, |n| completed < n) {
            if self.shared.is_cancelled() {
                break;
            }
            match self.step().await {
                Ok(report) => {
                    completed += 1;
                    debug!(
                        "tick {} done: exterior={:.2}K stragglers={}",
                        report.timestep,
                        report.exterior_temperature,
                        report.stragglers.len()
                    );
                }
                Err(EngineError::Cancelled) => break,
                Err(e) => {
                    self.stop();
                    return Err(e);
                }
            }

            if limit.map_or(false, |n| completed >= n) {
                break;
            }
            let shared = self.shared.clone();
            tokio::select! {
                _ = self.ctx.sleep(self.config.tick_interval()) => {}
                _ = shared.cancelled() => break,
            }
        }

        self.stop();
        info!("Engine stopped after {} ticks", completed);
        Ok(completed)
    }

    fn stop(&self) {
        self.shared.shutdown();
        self.shared.set_state(EngineState::Stopped);
    }

    /// Executes exactly one tick.
    pub async fn step(&mut self) -> Result<TickReport, EngineError> {
        let timestep = self.state.timestep();
        let dt = self.config.dt_secs;

        let mut previous = self.network.temperatures();
        let exterior = self
            .exterior
            .exterior_temperature(timestep, timestep as f64 * dt);
        self.network.set_exterior_temperature(exterior);
        previous.insert(self.network.exterior_id().clone(), exterior);
        self.publish_view(&previous);

        let mut stragglers = Vec::new();

        self.shared.set_state(EngineState::ReadPhase);
        self.ctx.sleep(self.config.phase_settle()).await;
        for pair in self.run_phase(Phase::Read).await? {
            stragglers.push((Phase::Read, pair.0, pair.1));
        }

        for room in self.network.interior_ids() {
            let current = self.state.setpoint(&room).unwrap_or(self.config.initial_setpoint);
            let next = self.policy.setpoint(&room, timestep, current);
            self.state.set_setpoint(&room, next);
        }

        self.shared.set_state(EngineState::UpdatePhase);
        self.ctx.sleep(self.config.phase_settle()).await;

        let pending = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        let heat = match self.fold_actuations(pending) {
            Ok(heat) => heat,
            Err(e) => {
                error!("tick {}: {}", timestep, e);
                self.fail(EngineFailure::Consistency {
                    timestep,
                    error: e.clone(),
                });
                return Err(e.into());
            }
        };

        let next = match self.network.update_temperature(
            &previous,
            dt,
            self.config.diffusion_coefficient,
            &heat,
        ) {
            Ok(next) => next,
            Err(e) => {
                error!("tick {}: {}", timestep, e);
                self.fail(EngineFailure::Thermal {
                    timestep,
                    error: e.clone(),
                });
                return Err(e.into());
            }
        };
        self.publish_view(&next);

        for pair in self.run_phase(Phase::Update).await? {
            stragglers.push((Phase::Update, pair.0, pair.1));
        }

        let advanced = self.state.advance();
        self.shared.timestep.send_replace(advanced);
        self.shared.status.send_modify(|s| s.timestep = advanced);

        Ok(TickReport {
            timestep,
            exterior_temperature: exterior,
            temperatures: next,
            heat_input: heat,
            stragglers,
        })
    }

    fn fold_actuations(
        &mut self,
        pending: BTreeMap<(RoomId, Subsystem), f64>,
    ) -> Result<RoomMap, ConsistencyError> {
        for ((room, subsystem), value) in pending {
            self.state.apply_actuation(&room, subsystem, value)?;
        }
        self.state.net_heat_input()
    }

    fn publish_view(&self, temperatures: &RoomMap) {
        let mut view = self.shared.view.write().unwrap();
        view.timestep = self.state.timestep();
        view.temperatures = temperatures.clone();
        view.setpoints = self.state.setpoints().clone();
    }

    /// Releases one phase and waits for it to complete (or time out).
    /// Returns the pairs that never reported.
    async fn run_phase(&self, phase: Phase) -> Result<Vec<(RoomId, Subsystem)>, EngineError> {
        let barrier = self.shared.barrier(phase);
        barrier.release();

        let outcome = match self.config.phase_timeout() {
            None => barrier.wait_complete().await.map(|_| Vec::new()),
            Some(limit) => {
                tokio::select! {
                    done = barrier.wait_complete() => done.map(|_| Vec::new()),
                    _ = self.ctx.sleep(limit) => Ok(barrier.outstanding()),
                }
            }
        };
        barrier.reset();

        let stragglers = outcome.map_err(|_| EngineError::Cancelled)?;
        if !stragglers.is_empty() {
            match self.config.on_timeout {
                TimeoutAction::Proceed => {
                    warn!(
                        "tick {}: {} phase closed without {:?}",
                        self.state.timestep(),
                        phase,
                        stragglers
                    );
                }
                TimeoutAction::Fail => {
                    error!(
                        "tick {}: {} phase timed out waiting for {:?}",
                        self.state.timestep(),
                        phase,
                        stragglers
                    );
                    self.fail(EngineFailure::PhaseTimeout {
                        timestep: self.state.timestep(),
                        phase,
                        stragglers: stragglers.clone(),
                    });
                    return Err(EngineError::PhaseTimeout { phase, stragglers });
                }
            }
        }
        Ok(stragglers)
    }

    fn fail(&self, failure: EngineFailure) {
        // No subscriber is fine
        let _ = self.shared.failures.send(failure);
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::ExteriorSpec;
    use crate::reading::{Role, Unit};
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thermonet_env::TokioContext;

    /// Room graph that counts calls to `update_temperature`.
    struct CountingNetwork {
        inner: RoomGraph,
        updates: Arc<AtomicUsize>,
    }

    impl ThermalNetwork for CountingNetwork {
        fn exterior_id(&self) -> &RoomId {
            self.inner.exterior_id()
        }

        fn interior_ids(&self) -> Vec<RoomId> {
            self.inner.interior_ids()
        }

        fn temperatures(&self) -> RoomMap {
            self.inner.temperatures()
        }

        fn set_exterior_temperature(&mut self, kelvin: f64) {
            self.inner.set_exterior_temperature(kelvin)
        }

        fn update_temperature(
            &mut self,
            previous: &RoomMap,
            dt: f64,
            diffusion_coefficient: f64,
            heat_input: &RoomMap,
        ) -> Result<RoomMap, ThermalError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.inner
                .update_temperature(previous, dt, diffusion_coefficient, heat_input)
        }
    }

    fn counting_engine(
        building: &BuildingConfig,
        config: EngineConfig,
    ) -> (SimulationEngine<CountingNetwork, TokioContext>, Arc<AtomicUsize>) {
        let updates = Arc::new(AtomicUsize::new(0));
        let network = CountingNetwork {
            inner: RoomGraph::from_config(building).unwrap(),
            updates: updates.clone(),
        };
        let engine =
            SimulationEngine::new(network, &building.participants(), TokioContext::shared(), config)
                .unwrap();
        (engine, updates)
    }

    fn sensor_reading(subsystem: Subsystem) -> Reading {
        Reading {
            agent_id: format!("R1_temp_sensor_{}", subsystem),
            room_id: RoomId::new("R1"),
            role: Role::Sensor,
            subsystem: Some(subsystem),
            unit: Some(Unit::Kelvin),
            value: Some(290.0),
            timestep: Some(0),
            location: None,
        }
    }

    fn one_room(subsystems: &[Subsystem]) -> BuildingConfig {
        let mut building = BuildingConfig::new(ExteriorSpec {
            name: "OO".into(),
            position: [0.0, 0.0],
            initial_temperature: 280.0,
        });
        building.add_room("R1", [0.0, 0.0], 1000.0, 290.0);
        building.set_subsystems(&"R1".into(), subsystems);
        building
    }

    fn engine(
        building: &BuildingConfig,
        config: EngineConfig,
    ) -> SimulationEngine<RoomGraph, TokioContext> {
        SimulationEngine::from_building(building, TokioContext::shared(), config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_waits_for_start() {
        let mut engine = engine(&one_room(&[Subsystem::Heater]), EngineConfig::default());
        let handle = engine.handle();
        assert_eq!(handle.state(), EngineState::AwaitStart);

        let task = tokio::spawn(async move { engine.run_ticks(1).await });
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(handle.state(), EngineState::AwaitStart);

        handle.shutdown();
        assert_eq!(task.await.unwrap().unwrap(), 0);
        assert_eq!(handle.state(), EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_tick_folds_buffered_actuation() {
        let config = EngineConfig::default().with_diffusion(0.0);
        let mut engine = engine(&one_room(&[Subsystem::Heater]), config);
        let handle = engine.handle();
        handle.start();

        let device = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let room = RoomId::new("R1");
                let ack = handle
                    .submit_measurement(&room, Subsystem::Heater, &sensor_reading(Subsystem::Heater))
                    .await
                    .unwrap();
                let act = handle
                    .submit_actuation(&room, Subsystem::Heater, 500.0)
                    .await
                    .unwrap();
                (ack, act)
            })
        };

        assert_eq!(engine.run_ticks(1).await.unwrap(), 1);
        let (ack, act) = device.await.unwrap();

        assert_eq!(ack.temperature, 290.0);
        assert_eq!(ack.setpoint, DEFAULT_INITIAL_SETPOINT);
        assert_eq!(ack.timestep, 0);
        assert_eq!(act.timestep, 0);

        // 290 + 10 s * 500 W / 1000 J/K
        let r1 = engine.network().room(&RoomId::new("R1")).unwrap();
        assert_relative_eq!(r1.temperature, 295.0);
        assert_eq!(engine.state().timestep(), 1);
        assert_eq!(handle.timestep(), 1);
        assert_eq!(engine.state().setpoint(&RoomId::new("R1")), Some(298.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heating_and_cooling_aborts_run() {
        let (mut engine, updates) = counting_engine(
            &one_room(&[Subsystem::Heater, Subsystem::Cooler]),
            EngineConfig::default(),
        );
        let handle = engine.handle();
        let mut failures = handle.subscribe_failures();
        handle.start();

        let mut devices = Vec::new();
        for (subsystem, value) in [(Subsystem::Heater, 5.0), (Subsystem::Cooler, -3.0)] {
            let handle = handle.clone();
            devices.push(tokio::spawn(async move {
                let room = RoomId::new("R1");
                handle
                    .submit_measurement(&room, subsystem, &sensor_reading(subsystem))
                    .await?;
                handle.submit_actuation(&room, subsystem, value).await
            }));
        }

        let err = engine.run().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Consistency(ConsistencyError::SimultaneousHeatingAndCooling { .. })
        ));
        assert!(matches!(
            failures.recv().await.unwrap(),
            EngineFailure::Consistency { timestep: 0, .. }
        ));
        // Rejected before the thermal model saw the tick
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        assert_eq!(engine.state().timestep(), 0);

        // Sessions blocked on the update phase are released
        for device in devices {
            assert_eq!(device.await.unwrap(), Err(SubmitError::Cancelled));
        }
        assert_eq!(handle.state(), EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_thermal_update_waits_for_full_read_phase() {
        let (mut engine, updates) = counting_engine(
            &one_room(&[Subsystem::Heater, Subsystem::Cooler]),
            EngineConfig::default(),
        );
        let handle = engine.handle();
        handle.start();

        let device = |subsystem: Subsystem, value: f64| {
            let handle = handle.clone();
            tokio::spawn(async move {
                let room = RoomId::new("R1");
                handle
                    .submit_measurement(&room, subsystem, &sensor_reading(subsystem))
                    .await?;
                handle.submit_actuation(&room, subsystem, value).await
            })
        };
        let heater = device(Subsystem::Heater, 100.0);
        let leader = tokio::spawn(async move {
            let report = engine.step().await;
            (engine, report)
        });

        // The cooler pair has not reported yet
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        assert_eq!(handle.state(), EngineState::ReadPhase);
        assert!(!leader.is_finished());

        let cooler = device(Subsystem::Cooler, 0.0);
        let (engine, report) = leader.await.unwrap();
        assert_eq!(report.unwrap().timestep, 0);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(engine.state().timestep(), 1);
        assert!(heater.await.unwrap().is_ok());
        assert!(cooler.await.unwrap().is_ok());
    }

    #[test]
    fn test_engine_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let mut engine = engine(&one_room(&[Subsystem::Heater]), EngineConfig::default());
        assert_send(&engine.run());
    }

    #[test]
    fn test_phase_timeout_is_clamped() {
        let config = EngineConfig::default().with_phase_timeout(Duration::MAX, TimeoutAction::Fail);
        assert_eq!(config.phase_timeout_ms, Some(u64::MAX));

        let config = EngineConfig::default()
            .with_phase_timeout(Duration::from_millis(1500), TimeoutAction::Proceed);
        assert_eq!(config.phase_timeout(), Some(Duration::from_millis(1500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_proceed_closes_phase() {
        let config = EngineConfig::default()
            .with_phase_timeout(Duration::from_secs(5), TimeoutAction::Proceed);
        let mut engine = engine(&one_room(&[Subsystem::Heater]), config);
        engine.handle().start();

        let report = engine.step().await.unwrap();
        assert_eq!(
            report.stragglers,
            vec![
                (Phase::Read, RoomId::new("R1"), Subsystem::Heater),
                (Phase::Update, RoomId::new("R1"), Subsystem::Heater),
            ]
        );
        assert_eq!(engine.state().timestep(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_straggler_fail_ends_run() {
        let config = EngineConfig::default()
            .with_phase_timeout(Duration::from_secs(5), TimeoutAction::Fail);
        let mut engine = engine(&one_room(&[Subsystem::Heater]), config);
        engine.handle().start();

        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, EngineError::PhaseTimeout { phase: Phase::Read, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_blocked_sessions() {
        let engine = engine(&one_room(&[Subsystem::Heater]), EngineConfig::default());
        let handle = engine.handle();

        let session = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .submit_measurement(
                        &RoomId::new("R1"),
                        Subsystem::Heater,
                        &sensor_reading(Subsystem::Heater),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!session.is_finished());

        handle.shutdown();
        assert_eq!(session.await.unwrap(), Err(SubmitError::Cancelled));
    }

    #[tokio::test]
    async fn test_actuation_sign_and_room_are_checked() {
        let engine = engine(&one_room(&[Subsystem::Heater]), EngineConfig::default());
        let handle = engine.handle();
        let room = RoomId::new("R1");

        let err = handle
            .submit_actuation(&room, Subsystem::Heater, -10.0)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::Protocol(ProtocolError::InvalidActuation { .. })));

        let err = handle
            .submit_actuation(&room, Subsystem::Cooler, -10.0)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::UnknownEntity { .. }));
    }

    #[tokio::test]
    async fn test_query_setpoint() {
        let engine = engine(&one_room(&[Subsystem::Heater]), EngineConfig::default());
        let handle = engine.handle();

        assert_eq!(
            handle.query_setpoint(&RoomId::new("R1")),
            SetpointReply::Setpoint {
                setpoint: DEFAULT_INITIAL_SETPOINT,
                timestep: 0
            }
        );
        assert_eq!(
            handle.query_setpoint(&RoomId::new("B7")),
            SetpointReply::Rejected { timestep: 0 }
        );
    }

    #[test]
    fn test_participants_must_exist() {
        let building = one_room(&[Subsystem::Heater]);
        let network = RoomGraph::from_config(&building).unwrap();
        let participants = [(RoomId::new("Z9"), vec![Subsystem::Heater])].into_iter().collect();

        let result =
            SimulationEngine::new(network, &participants, TokioContext::shared(), EngineConfig::default());
        assert!(matches!(result, Err(ConfigError::UnknownRoom(_))));
    }
}
