//! PI control law with integral anti-windup, and the controller loop.
//!
//! The integral is clamped to `±10·kP` on every step. A step that cannot be
//! delivered is undone by restoring the [`ControllerSnapshot`] taken before
//! it, so retries never accumulate integral drift.

use crate::building::{RoomId, Subsystem};
use crate::devices::{ActuationService, DeviceFamily, MeasurementService, ServiceError, SetpointSource};
use crate::reading::{ProtocolError, ReadingNormalizer, Role, Unit};
use crate::wire::{encode_senml, SenmlRecord};
use std::sync::Arc;
use std::time::Duration;
use thermonet_env::ThermoContext;
use tracing::{debug, info, warn};

/// Initial setpoint and measurement of a fresh controller (K).
pub const INITIAL_CONTROLLER_TEMPERATURE: f64 = 293.15;

/// Integral bound as a multiple of kP.
pub const WINDUP_FACTOR: f64 = 10.0;

/// Output post-processing of the two deployed controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlVariant {
    /// Output floored at 0, in watts
    HeatingOnly,
    /// Output clamped to [-1, 1]; negative part is the cooling fraction
    HeatCool,
}

impl ControlVariant {
    pub fn apply(&self, output: f64) -> f64 {
        match self {
            ControlVariant::HeatingOnly => output.max(0.0),
            ControlVariant::HeatCool => output.clamp(-1.0, 1.0),
        }
    }
}

/// The part of a controller's state a failed step must not change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSnapshot {
    pub integral: f64,
    pub last_control: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PIController {
    kp: f64,
    ki: f64,
    integral: f64,
    last_control: f64,
    setpoint: f64,
    measurement: f64,
    variant: ControlVariant,
    room: RoomId,
}

impl PIController {
    pub fn new(room: RoomId, kp: f64, ki: f64, variant: ControlVariant) -> Self {
        Self {
            kp,
            ki,
            integral: 0.0,
            last_control: 0.0,
            setpoint: INITIAL_CONTROLLER_TEMPERATURE,
            measurement: INITIAL_CONTROLLER_TEMPERATURE,
            variant,
            room,
        }
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn gains(&self) -> (f64, f64) {
        (self.kp, self.ki)
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn last_control(&self) -> f64 {
        self.last_control
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn set_setpoint(&mut self, kelvin: f64) {
        self.setpoint = kelvin;
    }

    pub fn set_measurement(&mut self, kelvin: f64) {
        self.measurement = kelvin;
    }

    pub fn integral_bound(&self) -> f64 {
        WINDUP_FACTOR * self.kp.abs()
    }

    /// One PI step. Returns `(output, previous_integral)`.
    ///
    /// `output` is the raw control law; the variant's post-processing is
    /// stored as [`Self::last_control`].
    pub fn compute_step(&mut self, dt: f64) -> (f64, f64) {
        let error = self.setpoint - self.measurement;
        let previous = self.integral;
        let bound = self.integral_bound();
        self.integral = (self.integral + error * dt).max(-bound).min(bound);

        let output = self.kp * error + self.ki * self.integral;
        self.last_control = self.variant.apply(output);
        (output, previous)
    }

    /// Heating power (W) for [`ControlVariant::HeatingOnly`], otherwise the
    /// cooling fraction `-min(0, output)`.
    pub fn actuation(&self) -> f64 {
        match self.variant {
            ControlVariant::HeatingOnly => self.last_control.max(0.0),
            ControlVariant::HeatCool => (-self.last_control).max(0.0),
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            integral: self.integral,
            last_control: self.last_control,
        }
    }

    pub fn restore(&mut self, snapshot: ControllerSnapshot) {
        self.integral = snapshot.integral;
        self.last_control = snapshot.last_control;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    AwaitMeasurement,
    Compute,
    SubmitActuation,
    Backoff,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlStats {
    pub steps: u64,
    pub backoffs: u64,
    pub rollbacks: u64,
}

/// Loop tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlLoopConfig {
    /// Integration step handed to [`PIController::compute_step`]
    pub dt_secs: f64,
    pub backoff: Duration,
    /// Lon/Lat attached to SenML actuation payloads
    pub coordinate: [f64; 2],
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            dt_secs: 10.0,
            backoff: Duration::from_secs(10),
            coordinate: [0.0, 0.0],
        }
    }
}

/// A controller agent: measure, query the setpoint, compute, actuate.
pub struct ControlLoop<M, A, S, C>
where
    M: MeasurementService,
    A: ActuationService,
    S: SetpointSource,
    C: ThermoContext,
{
    system_name: String,
    family: DeviceFamily,
    controller: PIController,
    measurement: M,
    actuation: A,
    setpoints: S,
    ctx: Arc<C>,
    config: ControlLoopConfig,
    normalizer: ReadingNormalizer,
    state: ControlState,
    timestep: u64,
    stats: ControlStats,
}

impl<M, A, S, C> ControlLoop<M, A, S, C>
where
    M: MeasurementService,
    A: ActuationService,
    S: SetpointSource,
    C: ThermoContext,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        system_name: impl Into<String>,
        family: DeviceFamily,
        controller: PIController,
        measurement: M,
        actuation: A,
        setpoints: S,
        ctx: Arc<C>,
        config: ControlLoopConfig,
    ) -> Self {
        Self {
            system_name: system_name.into(),
            family,
            controller,
            measurement,
            actuation,
            setpoints,
            ctx,
            config,
            normalizer: ReadingNormalizer::new(),
            state: ControlState::AwaitMeasurement,
            timestep: 0,
            stats: ControlStats::default(),
        }
    }

    pub fn controller(&self) -> &PIController {
        &self.controller
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn stats(&self) -> ControlStats {
        self.stats
    }

    /// Runs until the engine connection closes.
    ///
    /// Unavailable services and rejected rooms back off and retry; a
    /// malformed measurement ends the loop with an error.
    pub async fn run(&mut self) -> Result<ControlStats, ServiceError> {
        info!("{}: control loop started", self.system_name);
        loop {
            match self.step().await {
                Ok(()) => {}
                Err(ServiceError::Closed) => {
                    info!(
                        "{}: engine closed after {} steps ({} rollbacks)",
                        self.system_name, self.stats.steps, self.stats.rollbacks
                    );
                    return Ok(self.stats);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One pass through the state machine, ending in `AwaitMeasurement`.
    pub async fn step(&mut self) -> Result<(), ServiceError> {
        self.state = ControlState::AwaitMeasurement;
        let payload = match self.measurement.read().await {
            Ok(payload) => payload,
            Err(ServiceError::Unavailable(service)) => {
                warn!("{}: no '{}' service available, backing off", self.system_name, service);
                return self.backoff().await;
            }
            Err(e) => return Err(e),
        };

        self.state = ControlState::Compute;
        let (setpoint, timestep) = match self.setpoints.setpoint(self.controller.room(), self.subsystem()).await {
            Ok(reply) => reply,
            Err(ServiceError::UnknownEntity(room)) => {
                warn!("{}: engine does not know room {}", self.system_name, room);
                return self.backoff().await;
            }
            Err(e) => return Err(e),
        };
        let temperature = self.read_temperature(&payload)?;

        let snapshot = self.controller.snapshot();
        self.controller.set_setpoint(setpoint);
        self.controller.set_measurement(temperature);
        self.timestep = timestep;
        self.controller.compute_step(self.config.dt_secs);

        self.state = ControlState::SubmitActuation;
        let message = self.control_message()?;
        match self.actuation.actuate(&message).await {
            Ok(()) => {
                self.stats.steps += 1;
                debug!(
                    "{}: t={} T={:.2}K sp={:.2}K u={:.3}",
                    self.system_name,
                    timestep,
                    temperature,
                    setpoint,
                    self.controller.actuation()
                );
                self.state = ControlState::AwaitMeasurement;
                Ok(())
            }
            Err(e) => {
                // Nothing was applied; undo the step
                self.controller.restore(snapshot);
                if matches!(e, ServiceError::Unavailable(_) | ServiceError::UnknownEntity(_)) {
                    warn!("{}: {}, rolling back and backing off", self.system_name, e);
                    self.stats.rollbacks += 1;
                    self.backoff().await
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn backoff(&mut self) -> Result<(), ServiceError> {
        self.state = ControlState::Backoff;
        self.stats.backoffs += 1;
        self.ctx.sleep(self.config.backoff).await;
        self.state = ControlState::AwaitMeasurement;
        Ok(())
    }

    fn subsystem(&self) -> Subsystem {
        self.family.subsystem()
    }

    /// Temperature (K) from a sensor payload addressed to this room.
    fn read_temperature(&self, payload: &[u8]) -> Result<f64, ServiceError> {
        let reading = self.normalizer.normalize(payload)?;
        if &reading.room_id != self.controller.room() {
            return Err(ProtocolError::UnexpectedSource {
                expected: self.controller.room().clone(),
                got: reading.room_id,
            }
            .into());
        }
        match (reading.role, reading.unit, reading.value) {
            (Role::Sensor, Some(Unit::Kelvin), Some(value)) => Ok(value),
            (Role::Sensor, _, None) => Err(ProtocolError::MissingField("v").into()),
            (role, unit, _) => Err(ProtocolError::UnitNotAllowed {
                unit: unit.map(|u| u.tag()).unwrap_or("none").to_string(),
                role,
            }
            .into()),
        }
    }

    fn control_message(&self) -> Result<Vec<u8>, ServiceError> {
        let value = self.controller.actuation();
        let records = match self.family {
            DeviceFamily::A => vec![SenmlRecord::named(&self.system_name, self.timestep, "W", value)],
            DeviceFamily::B => vec![
                SenmlRecord::base(&self.system_name, self.timestep),
                SenmlRecord::value("Lon", self.config.coordinate[0]),
                SenmlRecord::value("Lat", self.config.coordinate[1]),
                SenmlRecord::value("/", value),
            ],
        };
        Ok(encode_senml(&records)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn heating() -> PIController {
        PIController::new(RoomId::new("A11"), 40.0, 1.0, ControlVariant::HeatingOnly)
    }

    #[test]
    fn test_two_identical_steps() {
        let mut pi = heating();
        pi.set_setpoint(293.15);
        pi.set_measurement(283.15);

        let (output, previous) = pi.compute_step(10.0);
        assert_eq!(previous, 0.0);
        assert!((pi.integral() - 100.0).abs() < 1e-9);
        assert!((output - 500.0).abs() < 1e-9);

        let (output, previous) = pi.compute_step(10.0);
        assert!((previous - 100.0).abs() < 1e-9);
        assert!((pi.integral() - 200.0).abs() < 1e-9);
        assert!((output - 600.0).abs() < 1e-9);
    }

    #[test]
    fn test_integral_saturates_at_bound() {
        let mut pi = heating();
        pi.set_measurement(283.15);
        for _ in 0..10 {
            pi.compute_step(10.0);
        }
        assert_eq!(pi.integral(), 400.0);
    }

    #[test]
    fn test_rollback_restores_exact_state() {
        let mut pi = heating();
        pi.set_setpoint(293.15);
        pi.set_measurement(283.15);
        let before = pi.snapshot();

        let (output, previous) = pi.compute_step(10.0);
        assert!((output - 500.0).abs() < 1e-9);
        assert_eq!(previous, 0.0);
        assert_ne!(pi.snapshot(), before);

        pi.restore(before);
        assert_eq!(pi.snapshot(), before);
        assert_eq!(pi.integral(), 0.0);
        assert_eq!(pi.last_control(), 0.0);
    }

    #[test]
    fn test_heat_cool_reports_cooling_fraction() {
        let mut pi = PIController::new(RoomId::new("A21"), 0.1, 0.01, ControlVariant::HeatCool);
        pi.set_setpoint(293.15);
        pi.set_measurement(303.15);

        let (output, _) = pi.compute_step(10.0);
        // -1.0 + 0.01 * -1.0 (integral clamped to -1)
        assert!((output + 1.01).abs() < 1e-9);
        assert_eq!(pi.last_control(), -1.0);
        assert_eq!(pi.actuation(), 1.0);

        pi.set_measurement(283.15);
        pi.compute_step(10.0);
        assert_eq!(pi.actuation(), 0.0);
    }

    #[test]
    fn test_heating_only_floors_at_zero() {
        let mut pi = heating();
        pi.set_measurement(303.15);
        let (output, _) = pi.compute_step(10.0);
        assert!(output < 0.0);
        assert_eq!(pi.actuation(), 0.0);
    }

    mod control_loop {
        use super::*;
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Mutex;
        use thermonet_env::TokioContext;

        struct Sensor {
            available: AtomicBool,
        }

        #[async_trait]
        impl MeasurementService for Sensor {
            async fn read(&self) -> Result<Vec<u8>, ServiceError> {
                if !self.available.load(Ordering::SeqCst) {
                    return Err(ServiceError::Unavailable("temperature".into()));
                }
                Ok(br#"[{"n": "A11_temp_sensor", "t": 0, "u": "K", "v": 283.15}]"#.to_vec())
            }
        }

        #[derive(Default)]
        struct Heater {
            down: AtomicBool,
            rejecting: AtomicBool,
            received: Mutex<Vec<Vec<u8>>>,
        }

        #[async_trait]
        impl ActuationService for Heater {
            async fn actuate(&self, payload: &[u8]) -> Result<(), ServiceError> {
                if self.down.load(Ordering::SeqCst) {
                    return Err(ServiceError::Unavailable("actuator".into()));
                }
                if self.rejecting.load(Ordering::SeqCst) {
                    return Err(ServiceError::UnknownEntity(RoomId::new("A11")));
                }
                self.received.lock().unwrap().push(payload.to_vec());
                Ok(())
            }
        }

        struct Setpoints;

        #[async_trait]
        impl SetpointSource for Setpoints {
            async fn setpoint(&self, _room: &RoomId, _subsystem: Subsystem) -> Result<(f64, u64), ServiceError> {
                Ok((293.15, 7))
            }
        }

        fn control_loop(
            sensor: Arc<Sensor>,
            heater: Arc<Heater>,
        ) -> ControlLoop<Arc<Sensor>, Arc<Heater>, Setpoints, TokioContext> {
            ControlLoop::new(
                "A11_controller",
                DeviceFamily::A,
                heating(),
                sensor,
                heater,
                Setpoints,
                TokioContext::shared(),
                ControlLoopConfig::default(),
            )
        }

        #[tokio::test(start_paused = true)]
        async fn test_actuation_outage_rolls_back() {
            let sensor = Arc::new(Sensor { available: AtomicBool::new(true) });
            let heater = Arc::new(Heater::default());
            let mut agent = control_loop(sensor, heater.clone());

            heater.down.store(true, Ordering::SeqCst);
            let before = agent.controller().snapshot();
            agent.step().await.unwrap();

            assert_eq!(agent.controller().snapshot(), before);
            assert_eq!(agent.stats(), ControlStats { steps: 0, backoffs: 1, rollbacks: 1 });
            assert_eq!(agent.state(), ControlState::AwaitMeasurement);

            // Retry after the outage continues from the restored state
            heater.down.store(false, Ordering::SeqCst);
            agent.step().await.unwrap();
            assert!((agent.controller().integral() - 100.0).abs() < 1e-9);

            let sent = heater.received.lock().unwrap();
            let command: serde_json::Value = serde_json::from_slice(&sent[0]).unwrap();
            assert_eq!(command[0]["n"], "A11_controller");
            assert_eq!(command[0]["t"], 7.0);
            assert!((command[0]["v"].as_f64().unwrap() - 500.0).abs() < 1e-9);
        }

        #[tokio::test(start_paused = true)]
        async fn test_rejected_actuation_rolls_back_and_keeps_running() {
            let sensor = Arc::new(Sensor { available: AtomicBool::new(true) });
            let heater = Arc::new(Heater::default());
            let mut agent = control_loop(sensor, heater.clone());

            heater.rejecting.store(true, Ordering::SeqCst);
            let before = agent.controller().snapshot();
            for _ in 0..3 {
                agent.step().await.unwrap();
                assert_eq!(agent.controller().snapshot(), before);
            }
            assert_eq!(agent.stats(), ControlStats { steps: 0, backoffs: 3, rollbacks: 3 });
            assert_eq!(agent.state(), ControlState::AwaitMeasurement);

            heater.rejecting.store(false, Ordering::SeqCst);
            agent.step().await.unwrap();
            assert_eq!(agent.stats().steps, 1);
            assert!((agent.controller().integral() - 100.0).abs() < 1e-9);
        }

        #[tokio::test(start_paused = true)]
        async fn test_measurement_outage_backs_off_without_state_change() {
            let sensor = Arc::new(Sensor { available: AtomicBool::new(false) });
            let heater = Arc::new(Heater::default());
            let mut agent = control_loop(sensor, heater.clone());

            let started = tokio::time::Instant::now();
            agent.step().await.unwrap();

            assert!(started.elapsed() >= Duration::from_secs(10));
            assert_eq!(agent.stats().backoffs, 1);
            assert_eq!(agent.controller(), &heating());
            assert!(heater.received.lock().unwrap().is_empty());
        }
    }

    proptest! {
        #[test]
        fn prop_integral_stays_within_bound(
            kp in 0.01f64..100.0,
            ki in 0.0f64..10.0,
            steps in prop::collection::vec((250.0f64..350.0, 250.0f64..350.0, 0.1f64..60.0), 1..64),
        ) {
            let mut pi = PIController::new(RoomId::new("R"), kp, ki, ControlVariant::HeatingOnly);
            let bound = 10.0 * kp;
            for (setpoint, measurement, dt) in steps {
                pi.set_setpoint(setpoint);
                pi.set_measurement(measurement);
                pi.compute_step(dt);
                prop_assert!(pi.integral().abs() <= bound);
            }
        }
    }
}
