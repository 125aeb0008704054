use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::{Rc, Weak},
};

use tracing::{debug, trace, warn};

use crate::{
    config::SimConfig,
    continuous::ContinuousState,
    event::{check_delay, Event, EventId},
    eventlist::EventList,
    logger::DispatchLog,
    process::{Process, ProcessId},
    SimError,
};

pub(crate) struct SimCore {
    pub(crate) clock: Cell<f64>,
    pub(crate) events: RefCell<EventList>,
    pub(crate) current: RefCell<Option<Process>>,
    pub(crate) processes: RefCell<BTreeMap<ProcessId, Process>>,
    pub(crate) continuous: RefCell<ContinuousState>,
    running: Cell<bool>,
    stop_requested: Cell<bool>,
    dispatched: Cell<u64>,
    next_event_id: Cell<u64>,
    next_process_id: Cell<u64>,
    log: RefCell<Option<DispatchLog>>,
    owners: Cell<usize>,
}

impl SimCore {
    /// Release every process body, pending event and continuous variable. Bodies and actions
    /// may hold handles to each other and to the simulator; dropping them breaks those cycles.
    fn teardown(&self) {
        let current = self.current.borrow_mut().take();
        drop(current);
        let processes = std::mem::take(&mut *self.processes.borrow_mut());
        for process in processes.into_values() {
            process.discard();
        }
        let drained = self.events.borrow_mut().drain();
        drop(drained);
        self.continuous.borrow_mut().reset();
    }
}

impl Drop for SimCore {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Owner of the logical clock and the pending-event list, and the executive that runs them.
///
/// `Simulator` is a cheap handle; clones refer to the same simulation. Events, processes,
/// continuous variables and synchronization primitives are all created against an explicit
/// simulator handle, so independent simulations never share state.
///
/// The handle returned by [`new`](Self::new) and its clones own the simulation. Handles
/// obtained from the kernel, such as [`Process::simulator`], do not: once the last owning
/// handle is dropped, every process body and pending event is released even if a parked body
/// still holds a handle of its own.
pub struct Simulator {
    pub(crate) core: Rc<SimCore>,
    owner: bool,
}

impl Clone for Simulator {
    fn clone(&self) -> Self {
        if self.owner {
            self.core.owners.set(self.core.owners.get() + 1);
        }
        Self {
            core: Rc::clone(&self.core),
            owner: self.owner,
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        if !self.owner {
            return;
        }
        let owners = self.core.owners.get().saturating_sub(1);
        self.core.owners.set(owners);
        if owners == 0 && !self.core.running.get() {
            debug!(processes = self.core.processes.borrow().len(), "releasing simulation");
            self.core.teardown();
        }
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            core: Rc::new(SimCore {
                clock: Cell::new(0.0),
                events: RefCell::new(EventList::new()),
                current: RefCell::new(None),
                processes: RefCell::new(BTreeMap::new()),
                continuous: RefCell::new(ContinuousState::default()),
                running: Cell::new(false),
                stop_requested: Cell::new(false),
                dispatched: Cell::new(0),
                next_event_id: Cell::new(0),
                next_process_id: Cell::new(0),
                log: RefCell::new(None),
                owners: Cell::new(1),
            }),
            owner: true,
        }
    }

    /// Build a simulator from a validated configuration.
    pub fn from_config(config: &SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        let sim = Self::new();
        if let Some(integrator) = config.integrator {
            sim.select_integrator(integrator)?;
        }
        if let Some(capacity) = config.dispatch_log_capacity {
            sim.enable_dispatch_log(capacity);
        }
        Ok(sim)
    }

    pub(crate) fn upgrade(core: &Weak<SimCore>) -> Result<Self, SimError> {
        core.upgrade()
            .map(|core| Self { core, owner: false })
            .ok_or(SimError::SimulatorDropped)
    }

    pub(crate) fn downgrade(&self) -> Weak<SimCore> {
        Rc::downgrade(&self.core)
    }

    pub(crate) fn next_event_id(&self) -> EventId {
        let id = self.core.next_event_id.get();
        self.core.next_event_id.set(id + 1);
        EventId(id)
    }

    pub(crate) fn next_process_id(&self) -> ProcessId {
        let id = self.core.next_process_id.get();
        self.core.next_process_id.set(id + 1);
        ProcessId(id)
    }

    /// Get the current time of the simulation.
    #[inline(always)]
    pub fn time(&self) -> f64 {
        self.core.clock.get()
    }

    /// Reset the clock to zero, kill every live process, discard pending events and stop all
    /// continuous integration.
    pub fn init(&self) {
        self.kill_all();
        let drained = self.core.events.borrow_mut().drain();
        drop(drained);
        self.core.continuous.borrow_mut().reset();
        self.core.clock.set(0.0);
        self.core.stop_requested.set(false);
        self.core.dispatched.set(0);
        if let Some(log) = self.core.log.borrow_mut().as_mut() {
            log.clear();
        }
        debug!("simulator initialized");
    }

    /// Run the dispatch loop until the event list is empty or [`stop`](Self::stop) is called.
    /// An error returned by an event action or a process body ends the run and is returned.
    pub fn start(&self) -> Result<(), SimError> {
        if self.core.running.replace(true) {
            return Err(SimError::AlreadyRunning);
        }
        self.core.stop_requested.set(false);
        debug!(time = self.time(), pending = self.pending_events(), "starting dispatch loop");
        let outcome = self.dispatch();
        self.core.running.set(false);
        match &outcome {
            Ok(()) => debug!(
                time = self.time(),
                dispatched = self.events_dispatched(),
                "dispatch loop ended"
            ),
            Err(err) => warn!(time = self.time(), error = %err, "dispatch loop aborted"),
        }
        outcome
    }

    fn dispatch(&self) -> Result<(), SimError> {
        while !self.core.stop_requested.get() {
            let next = self.core.events.borrow_mut().remove_min();
            let Some((key, event)) = next else {
                break;
            };
            self.core.clock.set(key.time);
            self.core.dispatched.set(self.core.dispatched.get() + 1);
            if let Some(log) = self.core.log.borrow_mut().as_mut() {
                log.record(&key, event.id());
            }
            trace!(
                event = %event.id(),
                time = key.time,
                priority = key.priority,
                sequence = key.sequence,
                "dispatching"
            );
            event.fire(self)?;
        }
        Ok(())
    }

    /// Ask the dispatch loop to return once the current action completes.
    pub fn stop(&self) {
        self.core.stop_requested.set(true);
    }

    /// Run until the clock reaches `end`. Events scheduled for exactly `end` after this call
    /// do not run.
    pub fn run_until(&self, end: f64) -> Result<(), SimError> {
        check_delay(end - self.time())?;
        let stopper = Event::new(self, |sim: &Simulator| {
            sim.stop();
            Ok(())
        });
        stopper.schedule(end - self.time())?;
        let outcome = self.start();
        stopper.cancel();
        outcome
    }

    pub fn is_running(&self) -> bool {
        self.core.running.get()
    }

    pub fn pending_events(&self) -> usize {
        self.core.events.borrow().len()
    }

    pub fn next_event_time(&self) -> Option<f64> {
        self.core.events.borrow().peek_min().map(|(key, _)| key.time)
    }

    pub fn events_dispatched(&self) -> u64 {
        self.core.dispatched.get()
    }

    /// Create an event running `action` and schedule it `delay` time units from now.
    pub fn schedule<F>(&self, delay: f64, action: F) -> Result<Event, SimError>
    where
        F: FnMut(&Simulator) -> Result<(), SimError> + 'static,
    {
        let event = Event::new(self, action);
        event.schedule(delay)?;
        Ok(event)
    }

    /// The process currently in control, if any.
    pub fn current_process(&self) -> Option<Process> {
        self.core.current.borrow().clone()
    }

    pub(crate) fn take_control(&self, process: &Process) -> Result<(), SimError> {
        let mut current = self.core.current.borrow_mut();
        if let Some(holder) = current.as_ref() {
            return Err(SimError::ControlConflict {
                entering: process.id(),
                holder: holder.id(),
            });
        }
        *current = Some(process.clone());
        Ok(())
    }

    pub(crate) fn release_control(&self, process: &Process) {
        let mut current = self.core.current.borrow_mut();
        if current.as_ref().is_some_and(|holder| holder.id() == process.id()) {
            *current = None;
        }
    }

    pub(crate) fn register(&self, process: &Process) {
        self.core
            .processes
            .borrow_mut()
            .insert(process.id(), process.clone());
    }

    pub(crate) fn unregister(&self, id: ProcessId) {
        let removed = self.core.processes.borrow_mut().remove(&id);
        drop(removed);
    }

    /// Processes that have been created and are not dead yet, in creation order.
    pub fn live_processes(&self) -> Vec<Process> {
        self.core.processes.borrow().values().cloned().collect()
    }

    pub fn kill_all(&self) {
        for process in self.live_processes() {
            if !process.is_alive() {
                continue;
            }
            if let Err(err) = process.kill() {
                warn!(process = %process.id(), error = %err, "failed to kill process");
            }
        }
    }

    /// Record every dispatched event, keeping at most `capacity` records.
    pub fn enable_dispatch_log(&self, capacity: usize) {
        *self.core.log.borrow_mut() = Some(DispatchLog::new(capacity));
    }

    pub fn dispatch_log(&self) -> Option<DispatchLog> {
        self.core.log.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn test_start_with_empty_list_returns_immediately() {
        let sim = Simulator::new();
        sim.start().unwrap();
        assert_eq!(sim.time(), 0.0);
        assert_eq!(sim.events_dispatched(), 0);
    }

    #[test]
    fn test_ties_fire_in_call_order() {
        let sim = Simulator::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        for (tag, delay) in [5.0, 3.0, 5.0, 5.0].into_iter().enumerate() {
            let fired = Rc::clone(&fired);
            sim.schedule(delay, move |sim| {
                fired.borrow_mut().push((tag, sim.time()));
                Ok(())
            })
            .unwrap();
        }
        sim.start().unwrap();
        assert_eq!(
            *fired.borrow(),
            vec![(1, 3.0), (0, 5.0), (2, 5.0), (3, 5.0)]
        );
    }

    #[test]
    fn test_stop_is_checked_between_actions() {
        let sim = Simulator::new();
        let fired = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..4 {
            let fired = Rc::clone(&fired);
            sim.schedule(tag as f64, move |sim| {
                fired.borrow_mut().push(tag);
                if tag == 1 {
                    sim.stop();
                }
                Ok(())
            })
            .unwrap();
        }
        sim.start().unwrap();
        assert_eq!(*fired.borrow(), vec![0, 1]);
        assert_eq!(sim.pending_events(), 2);
        assert_eq!(sim.next_event_time(), Some(2.0));

        // starting again continues where the loop stopped
        sim.start().unwrap();
        assert_eq!(*fired.borrow(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_action_error_aborts_run() {
        let sim = Simulator::new();
        sim.schedule(1.0, |sim| {
            sim.schedule(-2.0, |_| Ok(()))?;
            Ok(())
        })
        .unwrap();
        sim.schedule(2.0, |_| Ok(())).unwrap();
        assert_eq!(sim.start(), Err(SimError::InvalidDelay(-2.0)));
        assert_eq!(sim.time(), 1.0);
        assert!(!sim.is_running());
        assert_eq!(sim.pending_events(), 1);
    }

    #[test]
    fn test_nested_start_fails() {
        let sim = Simulator::new();
        sim.schedule(0.0, |sim| sim.start()).unwrap();
        assert_eq!(sim.start(), Err(SimError::AlreadyRunning));
    }

    #[test]
    fn test_run_until_leaves_later_events_pending() {
        let sim = Simulator::new();
        let count = Rc::new(Cell::new(0));
        for delay in [1.0, 2.0, 3.0, 7.0] {
            let count = Rc::clone(&count);
            sim.schedule(delay, move |_| {
                count.set(count.get() + 1);
                Ok(())
            })
            .unwrap();
        }
        sim.run_until(5.0).unwrap();
        assert_eq!(count.get(), 3);
        assert_eq!(sim.time(), 5.0);
        assert_eq!(sim.pending_events(), 1);
        assert_eq!(sim.run_until(1.0), Err(SimError::InvalidDelay(-4.0)));
    }

    #[test]
    fn test_init_resets_clock_and_list() {
        let sim = Simulator::new();
        let event = sim.schedule(4.0, |_| Ok(())).unwrap();
        sim.schedule(1.0, |_| Ok(())).unwrap();
        sim.run_until(2.0).unwrap();
        assert_eq!(sim.time(), 2.0);
        sim.init();
        assert_eq!(sim.time(), 0.0);
        assert_eq!(sim.pending_events(), 0);
        assert!(!event.is_pending());
        assert_eq!(sim.events_dispatched(), 0);
        event.schedule(1.0).unwrap();
        sim.start().unwrap();
        assert_eq!(sim.time(), 1.0);
    }

    #[test]
    fn test_events_outlive_dropped_simulator_gracefully() {
        let sim = Simulator::new();
        let event = Event::new(&sim, |_| Ok(()));
        drop(sim);
        assert_eq!(event.schedule(1.0), Err(SimError::SimulatorDropped));
        assert!(!event.cancel());
        assert!(!event.is_pending());
    }

    struct DropGuard(Rc<Cell<bool>>);

    impl Drop for DropGuard {
        fn drop(&mut self) {
            self.0.set(true);
        }
    }

    fn parked_forever(sim: &Simulator, dropped: &Rc<Cell<bool>>) -> Process {
        let guard = DropGuard(Rc::clone(dropped));
        let process = Process::new(sim, "parked", move |me| async move {
            let _guard = guard;
            let sim = me.simulator()?;
            me.suspend()?.await;
            assert!(sim.time() >= 0.0);
            Ok(())
        });
        process.start().unwrap();
        process
    }

    #[test]
    fn test_dropping_owner_releases_parked_bodies() {
        let dropped = Rc::new(Cell::new(false));
        let sim = Simulator::new();
        let process = parked_forever(&sim, &dropped);
        sim.start().unwrap();
        assert_eq!(process.state(), ProcessState::Suspended);
        assert!(!dropped.get());

        drop(sim);
        assert!(dropped.get());
        assert_eq!(process.state(), ProcessState::Dead);
        assert_eq!(process.simulator().err(), Some(SimError::SimulatorDropped));
    }

    #[test]
    fn test_owning_clones_keep_simulation_alive() {
        let dropped = Rc::new(Cell::new(false));
        let sim = Simulator::new();
        let process = parked_forever(&sim, &dropped);
        sim.start().unwrap();

        let owner = sim.clone();
        let borrowed = process.simulator().unwrap();
        drop(sim);
        assert!(!dropped.get());
        assert_eq!(owner.live_processes(), vec![process.clone()]);

        drop(owner);
        assert!(dropped.get());
        // a kernel-issued handle does not own the simulation
        assert!(borrowed.live_processes().is_empty());
        assert_eq!(borrowed.pending_events(), 0);
    }
}
