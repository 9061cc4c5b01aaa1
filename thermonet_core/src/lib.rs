//! thermonet Core - Building thermal simulation with a two-phase agent barrier
//!
//! A single engine task owns the building's thermal state and advances it in
//! fixed steps. Device agents (sensors, actuators, controllers) connect over
//! their own transports and interact with each tick through two barriers:
//! 1. **Read phase**: every sensor reads a consistent snapshot
//! 2. **Update phase**: buffered actuations are folded into the thermal step
//!
//! Both wire encodings (flat objects and SenML-like arrays) are normalized
//! into one [`Reading`] before dispatch.

pub mod barrier;
pub mod building;
pub mod controller;
pub mod devices;
pub mod engine;
pub mod policy;
pub mod reading;
pub mod registry;
pub mod session;
pub mod state;
pub mod thermal;
pub mod wire;

// Re-export key types for convenience
pub use barrier::{BarrierError, Phase, PhaseBarrier, PhaseCompletionSet};
pub use building::{BuildingConfig, ConfigError, RoomId, Subsystem};
pub use controller::{ControlLoop, ControlLoopConfig, ControlStats, ControlVariant, PIController};
pub use devices::{
    ActuationService, Actuator, DeviceConfig, DeviceFamily, DeviceKind, EngineClient,
    MeasurementService, ServiceError, SetpointSource, TemperatureSensor,
};
pub use engine::{
    EngineConfig, EngineError, EngineFailure, EngineHandle, EngineState, SimulationEngine,
    SubmitError, TickReport, TimeoutAction,
};
pub use reading::{ProtocolError, Reading, ReadingNormalizer, Role, Unit};
pub use registry::{LocalCloud, OrchestrationRule, RegistryError, ServiceRecord, SystemRecord};
pub use session::{AgentSession, SessionError};
pub use state::{ConsistencyError, SimulationState};
pub use thermal::{RoomGraph, ThermalNetwork};
