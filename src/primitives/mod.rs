//! Synchronization primitives built on process suspension: a counted [`Resource`] with a
//! service list, an unbounded [`Bin`] of interchangeable units and a boolean [`Condition`].
//!
//! Blocking operations return a [`Transfer`](crate::process::Transfer) that the calling
//! process awaits. Waiters are woken with `resume`, so they re-enter at the current instant
//! ahead of default-priority events.
use std::collections::VecDeque;

use crate::{process::Process, simulator::Simulator, SimError};

pub mod bin;
pub mod condition;
pub mod resource;

pub use bin::{Bin, BinStats};
pub use condition::{Condition, ConditionStats};
pub use resource::{Resource, ResourceStats};

/// Where new waiters join a wait list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Policy {
    /// Join at the tail.
    #[default]
    Fifo,
    /// Join at the head.
    Lifo,
}

impl Policy {
    pub(crate) fn enqueue(self, list: &mut VecDeque<UserRecord>, record: UserRecord) {
        match self {
            Policy::Fifo => list.push_back(record),
            Policy::Lifo => list.push_front(record),
        }
    }
}

/// A process holding or waiting for units.
#[derive(Clone, Debug)]
pub struct UserRecord {
    pub process: Process,
    pub units: u64,
    pub request_time: f64,
}

pub(crate) fn calling_process(sim: &Simulator) -> Result<Process, SimError> {
    sim.current_process().ok_or(SimError::NoCurrentProcess)
}

/// Remove `process` from a wait list. Returns the removed record.
pub(crate) fn remove_waiter(
    list: &mut VecDeque<UserRecord>,
    process: &Process,
) -> Option<UserRecord> {
    let position = list.iter().position(|record| record.process == *process)?;
    list.remove(position)
}
