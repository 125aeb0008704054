//! Process-oriented simulation. A [`Process`] wraps an `async` body; the body is a coroutine
//! that the executive polls whenever the process's control event fires. Awaiting a
//! [`Transfer`] returned by [`Process::delay`], [`Process::suspend`] or a blocking call on a
//! synchronization primitive hands control back to the executive until the process is
//! re-entered.
//!
//! Only the dispatch loop ever polls a body, and a body is entered only when no other
//! process holds control, so at most one process is [`ProcessState::Executing`] at a time.
use std::{
    cell::{Cell, RefCell},
    fmt,
    future::Future,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use tracing::{debug, warn};

use crate::{
    event::{check_delay, Event},
    simulator::{SimCore, Simulator},
    SimError,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub(crate) u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// Created, never scheduled.
    Initial,
    /// Control event pending.
    Delayed,
    /// Parked without a pending control event; only `resume` brings it back.
    Suspended,
    /// In control of the simulator.
    Executing,
    /// Returned from its body or killed. Terminal.
    Dead,
}

type BodyFuture = Pin<Box<dyn Future<Output = Result<(), SimError>>>>;
type BodyFactory = Box<dyn FnOnce(Process) -> BodyFuture>;

enum Body {
    Unstarted(BodyFactory),
    Running(BodyFuture),
}

/// Handle to a simulated process. Clones refer to the same process.
#[derive(Clone)]
pub struct Process(Rc<ProcessInner>);

struct ProcessInner {
    id: ProcessId,
    name: String,
    core: Weak<SimCore>,
    state: Cell<ProcessState>,
    control: Event,
    body: RefCell<Option<Body>>,
    /// Bumped every time the process takes control; parked transfers compare against it.
    entries: Cell<u64>,
}

impl Process {
    /// Create a process in the [`Initial`](ProcessState::Initial) state. `body` receives the
    /// process's own handle the first time it is entered.
    pub fn new<F, Fut>(sim: &Simulator, name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(Process) -> Fut + 'static,
        Fut: Future<Output = Result<(), SimError>> + 'static,
    {
        let id = sim.next_process_id();
        let factory: BodyFactory =
            Box::new(move |process: Process| -> BodyFuture { Box::pin(body(process)) });
        let inner = Rc::new_cyclic(|weak: &Weak<ProcessInner>| {
            let handle = weak.clone();
            let control = Event::new(sim, move |sim: &Simulator| match handle.upgrade() {
                Some(inner) => Process(inner).enter(sim),
                None => Ok(()),
            });
            ProcessInner {
                id,
                name: name.into(),
                core: sim.downgrade(),
                state: Cell::new(ProcessState::Initial),
                control,
                body: RefCell::new(Some(Body::Unstarted(factory))),
                entries: Cell::new(0),
            }
        });
        let process = Self(inner);
        sim.register(&process);
        debug!(process = %id, name = %process.name(), "created");
        process
    }

    pub fn id(&self) -> ProcessId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn state(&self) -> ProcessState {
        self.0.state.get()
    }

    pub fn is_alive(&self) -> bool {
        self.state() != ProcessState::Dead
    }

    pub fn simulator(&self) -> Result<Simulator, SimError> {
        Simulator::upgrade(&self.0.core)
    }

    /// Time at which the control event will fire, if the process is delayed.
    pub fn wake_time(&self) -> Option<f64> {
        self.0.control.time()
    }

    fn illegal(&self, operation: &'static str) -> SimError {
        match self.state() {
            ProcessState::Dead => SimError::ProcessDead(self.id()),
            state => SimError::IllegalProcessState {
                process: self.id(),
                operation,
                state,
            },
        }
    }

    fn transition(&self, state: ProcessState) {
        let from = self.0.state.replace(state);
        debug!(process = %self.id(), ?from, to = ?state, "transition");
    }

    /// Schedule the first entry of an initial process `delay` time units from now.
    pub fn schedule(&self, delay: f64) -> Result<(), SimError> {
        if self.state() != ProcessState::Initial {
            return Err(self.illegal("schedule"));
        }
        check_delay(delay)?;
        self.0.control.schedule(delay)?;
        self.transition(ProcessState::Delayed);
        Ok(())
    }

    /// Schedule the first entry of an initial process at the current time.
    pub fn start(&self) -> Result<(), SimError> {
        self.schedule(0.0)
    }

    /// Re-enter this process `delay` time units from now. Only the executing process may delay
    /// itself; the returned transfer must be awaited.
    pub fn delay(&self, delay: f64) -> Result<Transfer, SimError> {
        if self.state() != ProcessState::Executing {
            return Err(self.illegal("delay"));
        }
        check_delay(delay)?;
        let sim = self.simulator()?;
        self.0.control.schedule(delay)?;
        self.transition(ProcessState::Delayed);
        sim.release_control(self);
        Ok(self.park())
    }

    /// Suspend this process until another process or event resumes it.
    ///
    /// Called by the executing process on itself, control transfers away once the returned
    /// transfer is awaited. Called on a delayed process, the pending wake-up is cancelled and
    /// the returned transfer is already complete.
    pub fn suspend(&self) -> Result<Transfer, SimError> {
        match self.state() {
            ProcessState::Executing => {
                let sim = self.simulator()?;
                self.transition(ProcessState::Suspended);
                sim.release_control(self);
                Ok(self.park())
            }
            ProcessState::Delayed => {
                self.0.control.cancel();
                self.transition(ProcessState::Suspended);
                Ok(Transfer::ready())
            }
            _ => Err(self.illegal("suspend")),
        }
    }

    /// Re-enter a delayed or suspended process at the current time, ahead of every
    /// default-priority event of this instant.
    pub fn resume(&self) -> Result<(), SimError> {
        match self.state() {
            ProcessState::Delayed | ProcessState::Suspended => {
                self.0.control.cancel();
                self.0.control.schedule_next()?;
                self.transition(ProcessState::Delayed);
                Ok(())
            }
            _ => Err(self.illegal("resume")),
        }
    }

    /// Terminate this process. Its body is dropped without running any further.
    ///
    /// A process killing itself gets a transfer that never completes: awaiting it hands
    /// control back for good and the executive drops the body (`me.kill()?.await`). Killing any
    /// other process returns a completed transfer.
    pub fn kill(&self) -> Result<Transfer, SimError> {
        match self.state() {
            ProcessState::Dead => Err(SimError::ProcessDead(self.id())),
            ProcessState::Executing => {
                self.0.control.cancel();
                self.transition(ProcessState::Dead);
                if let Ok(sim) = self.simulator() {
                    sim.release_control(self);
                }
                Ok(self.park())
            }
            _ => {
                self.0.control.cancel();
                self.discard();
                if let Ok(sim) = self.simulator() {
                    sim.unregister(self.id());
                }
                Ok(Transfer::ready())
            }
        }
    }

    /// Mark dead and drop the body without touching the simulator.
    pub(crate) fn discard(&self) {
        self.0.state.set(ProcessState::Dead);
        let body = self.0.body.borrow_mut().take();
        drop(body);
    }

    fn park(&self) -> Transfer {
        Transfer {
            parked: Some(Parked {
                process: Rc::downgrade(&self.0),
                entries: self.0.entries.get(),
            }),
        }
    }

    fn finish(&self, sim: &Simulator) {
        self.0.control.cancel();
        if self.0.state.replace(ProcessState::Dead) != ProcessState::Dead {
            debug!(process = %self.id(), time = sim.time(), "terminated");
        }
        sim.release_control(self);
        sim.unregister(self.id());
    }

    /// Action of the control event: take control and poll the body once.
    fn enter(&self, sim: &Simulator) -> Result<(), SimError> {
        if !self.is_alive() {
            return Ok(());
        }
        sim.take_control(self)?;
        let body = self.0.body.borrow_mut().take();
        let mut future = match body {
            Some(Body::Running(future)) => future,
            Some(Body::Unstarted(factory)) => factory(self.clone()),
            None => {
                sim.release_control(self);
                return Ok(());
            }
        };
        self.0.entries.set(self.0.entries.get() + 1);
        self.transition(ProcessState::Executing);

        let mut cx = Context::from_waker(Waker::noop());
        let poll = future.as_mut().poll(&mut cx);
        sim.release_control(self);

        match poll {
            Poll::Ready(outcome) => {
                drop(future);
                let killed = !self.is_alive();
                self.finish(sim);
                // a killed body that did not await its kill ends at its next failing call
                if killed {
                    if let Err(err) = &outcome {
                        debug!(process = %self.id(), error = %err, "killed process unwound");
                    }
                    return Ok(());
                }
                if let Err(err) = &outcome {
                    warn!(
                        process = %self.id(),
                        name = %self.name(),
                        error = %err,
                        "process body failed"
                    );
                }
                outcome
            }
            Poll::Pending => {
                match self.state() {
                    ProcessState::Dead => {
                        drop(future);
                        self.finish(sim);
                        return Ok(());
                    }
                    ProcessState::Executing => {
                        warn!(
                            process = %self.id(),
                            "process awaited a future the kernel does not drive; suspending it"
                        );
                        self.transition(ProcessState::Suspended);
                    }
                    _ => {}
                }
                *self.0.body.borrow_mut() = Some(Body::Running(future));
                Ok(())
            }
        }
    }
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Process {}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

struct Parked {
    process: Weak<ProcessInner>,
    entries: u64,
}

/// A pending hand-off of control. Awaiting it inside a process body completes once the
/// process has been re-entered by the executive; transfers for calls that did not block are
/// complete immediately.
#[must_use = "a transfer does nothing unless awaited by the process body"]
pub struct Transfer {
    parked: Option<Parked>,
}

impl Transfer {
    pub(crate) fn ready() -> Self {
        Self { parked: None }
    }

    /// Whether awaiting this transfer would yield control.
    pub fn is_blocking(&self) -> bool {
        self.parked.is_some()
    }
}

impl Future for Transfer {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let Some(parked) = &self.parked else {
            return Poll::Ready(());
        };
        match parked.process.upgrade() {
            Some(inner)
                if inner.entries.get() != parked.entries
                    && inner.state.get() == ProcessState::Executing =>
            {
                Poll::Ready(())
            }
            _ => Poll::Pending,
        }
    }
}
