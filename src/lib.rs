//! `aion` is a discrete-event simulation kernel. The executive advances a logical clock by
//! firing timestamped [`Event`](event::Event)s in strict `(time, priority, sequence)` order,
//! optionally interleaved with fixed-step integration of [`Continuous`](continuous::Continuous)
//! variables. On top of it, [`Process`](process::Process)es are coroutines that can delay,
//! suspend and be resumed, and synchronize through [`Resource`](primitives::Resource)s,
//! [`Bin`](primitives::Bin)s and [`Condition`](primitives::Condition)s.
use thiserror::Error;

use crate::process::{ProcessId, ProcessState};

pub mod config;
pub mod continuous;
pub mod event;
pub mod eventlist;
pub mod logger;
pub mod primitives;
pub mod process;
pub mod simulator;
pub mod stats;

pub mod prelude {
    pub use crate::config::SimConfig;
    pub use crate::continuous::{Continuous, Integrator};
    pub use crate::event::{Actions, Event, EventId};
    pub use crate::primitives::{Bin, Condition, Policy, Resource};
    pub use crate::process::{Process, ProcessId, ProcessState, Transfer};
    pub use crate::simulator::Simulator;
    pub use crate::stats::{Accumulate, StatProbe, Tally};
    pub use crate::SimError;
}

/// Error enum for provide feedback on simulation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimError {
    #[error("delay must be finite and non-negative, got {0}")]
    InvalidDelay(f64),
    #[error("event is already scheduled")]
    AlreadyScheduled,
    #[error("reference event is not scheduled")]
    ReferenceNotScheduled,
    #[error("priority cannot change while the event is pending")]
    PendingPriority,
    #[error("{operation} is illegal for process {process} in state {state:?}")]
    IllegalProcessState {
        process: ProcessId,
        operation: &'static str,
        state: ProcessState,
    },
    #[error("process {0} is dead")]
    ProcessDead(ProcessId),
    #[error("no process is currently executing")]
    NoCurrentProcess,
    #[error("process {entering} cannot take control while process {holder} is executing")]
    ControlConflict {
        entering: ProcessId,
        holder: ProcessId,
    },
    #[error("release of {requested} units exceeds the {held} units held")]
    ReleaseExceedsHolding { requested: u64, held: u64 },
    #[error("cannot shrink capacity by {requested}, only {available} units are free")]
    CapacityShrink { requested: u64, available: u64 },
    #[error("cannot grow capacity {capacity} by {requested} units")]
    CapacityOverflow { capacity: u64, requested: u64 },
    #[error("integration step must be finite and positive, got {0}")]
    InvalidStep(f64),
    #[error("no integration method has been selected")]
    NoIntegrator,
    #[error("integration method cannot change while variables are integrating")]
    IntegratorBusy,
    #[error("simulator is already running")]
    AlreadyRunning,
    #[error("simulator has been dropped")]
    SimulatorDropped,
    #[error("configuration error: {0}")]
    ConfigError(String),
}
