//! Schedulable units of discrete action. An [`Event`] is either unscheduled or pending in its
//! simulator's [`EventList`](crate::eventlist::EventList); while pending, its time and priority
//! are frozen in the list key.
use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::{Rc, Weak},
};

use tracing::trace;

use crate::{
    simulator::{SimCore, Simulator},
    SimError,
};

/// Priority given to events unless set otherwise. Lower priorities fire first.
pub const DEFAULT_PRIORITY: f64 = 1.0;

/// Priority used by [`Event::schedule_next`].
pub const NEXT_PRIORITY: f64 = 0.0;

/// Identity of an event within its simulator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub(crate) u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// The body of an event, run by the dispatch loop when the event fires.
pub trait Actions {
    fn actions(&mut self, sim: &Simulator) -> Result<(), SimError>;
}

impl<F> Actions for F
where
    F: FnMut(&Simulator) -> Result<(), SimError>,
{
    fn actions(&mut self, sim: &Simulator) -> Result<(), SimError> {
        self(sim)
    }
}

pub(crate) fn check_delay(delay: f64) -> Result<(), SimError> {
    if delay.is_finite() && delay >= 0.0 {
        Ok(())
    } else {
        Err(SimError::InvalidDelay(delay))
    }
}

/// A handle to a schedulable action. Cloning the handle does not clone the event.
#[derive(Clone)]
pub struct Event(Rc<EventInner>);

struct EventInner {
    id: EventId,
    core: Weak<SimCore>,
    priority: Cell<f64>,
    action: RefCell<Option<Box<dyn Actions>>>,
}

impl Event {
    /// Create an unscheduled event running `action` each time it fires.
    pub fn new<F>(sim: &Simulator, action: F) -> Self
    where
        F: FnMut(&Simulator) -> Result<(), SimError> + 'static,
    {
        Self::from_actions(sim, action)
    }

    /// Create an unscheduled event from any [`Actions`] implementor.
    pub fn from_actions<A: Actions + 'static>(sim: &Simulator, action: A) -> Self {
        Self(Rc::new(EventInner {
            id: sim.next_event_id(),
            core: sim.downgrade(),
            priority: Cell::new(DEFAULT_PRIORITY),
            action: RefCell::new(Some(Box::new(action))),
        }))
    }

    pub fn id(&self) -> EventId {
        self.0.id
    }

    fn simulator(&self) -> Result<Simulator, SimError> {
        Simulator::upgrade(&self.0.core)
    }

    /// The priority this event fires with. While pending this is the priority frozen in the
    /// list key, which differs from the configured one after `schedule_next` or
    /// `schedule_before`/`schedule_after`.
    pub fn priority(&self) -> f64 {
        self.simulator()
            .ok()
            .and_then(|sim| sim.core.events.borrow().key_of(self.id()))
            .map_or(self.0.priority.get(), |key| key.priority)
    }

    pub fn set_priority(&self, priority: f64) -> Result<(), SimError> {
        if self.is_pending() {
            return Err(SimError::PendingPriority);
        }
        self.0.priority.set(priority);
        Ok(())
    }

    /// Firing time, or `None` when unscheduled.
    pub fn time(&self) -> Option<f64> {
        let sim = self.simulator().ok()?;
        let key = sim.core.events.borrow().key_of(self.id());
        key.map(|key| key.time)
    }

    pub fn is_pending(&self) -> bool {
        self.simulator()
            .map(|sim| sim.core.events.borrow().contains(self.id()))
            .unwrap_or(false)
    }

    /// Schedule this event to fire `delay` time units from now.
    pub fn schedule(&self, delay: f64) -> Result<(), SimError> {
        check_delay(delay)?;
        let sim = self.simulator()?;
        let mut events = sim.core.events.borrow_mut();
        if events.contains(self.id()) {
            return Err(SimError::AlreadyScheduled);
        }
        let time = sim.time() + delay;
        let key = events.insert(self.clone(), time, self.0.priority.get());
        trace!(event = %self.id(), time, sequence = key.sequence, "scheduled");
        Ok(())
    }

    /// Schedule this event at the current time ahead of every default-priority event
    /// of the same instant.
    pub fn schedule_next(&self) -> Result<(), SimError> {
        let sim = self.simulator()?;
        let mut events = sim.core.events.borrow_mut();
        if events.contains(self.id()) {
            return Err(SimError::AlreadyScheduled);
        }
        let key = events.insert(self.clone(), sim.time(), NEXT_PRIORITY);
        trace!(event = %self.id(), time = key.time, sequence = key.sequence, "scheduled next");
        Ok(())
    }

    /// Schedule this event to fire immediately before `other`, which must be pending.
    pub fn schedule_before(&self, other: &Event) -> Result<(), SimError> {
        let sim = self.simulator()?;
        let mut events = sim.core.events.borrow_mut();
        if events.contains(self.id()) {
            return Err(SimError::AlreadyScheduled);
        }
        let key = events.insert_before(self.clone(), other)?;
        trace!(event = %self.id(), before = %other.id(), time = key.time, "scheduled");
        Ok(())
    }

    /// Schedule this event to fire immediately after `other`, which must be pending.
    pub fn schedule_after(&self, other: &Event) -> Result<(), SimError> {
        let sim = self.simulator()?;
        let mut events = sim.core.events.borrow_mut();
        if events.contains(self.id()) {
            return Err(SimError::AlreadyScheduled);
        }
        let key = events.insert_after(self.clone(), other)?;
        trace!(event = %self.id(), after = %other.id(), time = key.time, "scheduled");
        Ok(())
    }

    /// Remove this event from the list. Returns whether it was pending.
    pub fn cancel(&self) -> bool {
        let Ok(sim) = self.simulator() else {
            return false;
        };
        let removed = sim.core.events.borrow_mut().remove(self);
        if removed {
            trace!(event = %self.id(), "cancelled");
        }
        removed
    }

    pub fn reschedule(&self, delay: f64) -> Result<(), SimError> {
        check_delay(delay)?;
        self.cancel();
        self.schedule(delay)
    }

    /// Run the action. The action is lent out for the call so it may reschedule its own event.
    pub(crate) fn fire(&self, sim: &Simulator) -> Result<(), SimError> {
        let action = self.0.action.borrow_mut().take();
        let Some(mut action) = action else {
            return Ok(());
        };
        let outcome = action.actions(sim);
        *self.0.action.borrow_mut() = Some(action);
        outcome
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Event {}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id())
            .field("time", &self.time())
            .field("priority", &self.priority())
            .finish()
    }
}
