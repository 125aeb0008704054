use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt::Write,
    rc::{Rc, Weak},
};

use tracing::debug;

use crate::{
    primitives::{calling_process, remove_waiter, Policy, UserRecord},
    process::{Process, Transfer},
    simulator::{SimCore, Simulator},
    stats::{Accumulate, StatProbe, Tally},
    SimError,
};

#[derive(Clone, Debug)]
pub struct ResourceStats {
    pub capacity: Accumulate,
    /// Units in use.
    pub utilization: Accumulate,
    pub wait_list: Accumulate,
    pub waiting_time: Tally,
    /// Time from request to full release.
    pub sojourn: Tally,
}

impl ResourceStats {
    fn new(name: &str, now: f64, state: &ResourceState) -> Self {
        let mut stats = Self {
            capacity: Accumulate::new(format!("{name} capacity")),
            utilization: Accumulate::new(format!("{name} utilization")),
            wait_list: Accumulate::new(format!("{name} wait list")),
            waiting_time: Tally::new(format!("{name} waiting time")),
            sojourn: Tally::new(format!("{name} sojourn")),
        };
        stats.capacity.init_at(now, state.capacity as f64);
        stats.utilization.init_at(now, (state.capacity - state.available) as f64);
        stats.wait_list.init_at(now, state.waiting.len() as f64);
        stats
    }
}

struct ResourceState {
    capacity: u64,
    available: u64,
    serving: VecDeque<UserRecord>,
    waiting: VecDeque<UserRecord>,
    stats: Option<ResourceStats>,
}

impl ResourceState {
    fn sample(&mut self, now: f64) {
        if let Some(stats) = self.stats.as_mut() {
            stats.capacity.update(now, self.capacity as f64);
            stats
                .utilization
                .update(now, (self.capacity - self.available) as f64);
            stats.wait_list.update(now, self.waiting.len() as f64);
        }
    }
}

/// A pool of `capacity` identical units. Processes request units and hold them until they
/// release them; requests that cannot be met suspend the caller in the wait list.
///
/// At all times `available + held_units() == capacity`.
#[derive(Clone)]
pub struct Resource(Rc<ResourceInner>);

struct ResourceInner {
    core: Weak<SimCore>,
    name: String,
    policy: Policy,
    state: RefCell<ResourceState>,
}

impl Resource {
    pub fn new(sim: &Simulator, name: impl Into<String>, capacity: u64) -> Self {
        Self::with_policy(sim, name, capacity, Policy::Fifo)
    }

    pub fn with_policy(
        sim: &Simulator,
        name: impl Into<String>,
        capacity: u64,
        policy: Policy,
    ) -> Self {
        Self(Rc::new(ResourceInner {
            core: sim.downgrade(),
            name: name.into(),
            policy,
            state: RefCell::new(ResourceState {
                capacity,
                available: capacity,
                serving: VecDeque::new(),
                waiting: VecDeque::new(),
                stats: None,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn policy(&self) -> Policy {
        self.0.policy
    }

    fn simulator(&self) -> Result<Simulator, SimError> {
        Simulator::upgrade(&self.0.core)
    }

    pub fn capacity(&self) -> u64 {
        self.0.state.borrow().capacity
    }

    pub fn available(&self) -> u64 {
        self.0.state.borrow().available
    }

    /// Units currently held by all users.
    pub fn held_units(&self) -> u64 {
        let state = self.0.state.borrow();
        state.capacity - state.available
    }

    pub fn held_by(&self, process: &Process) -> u64 {
        self.0
            .state
            .borrow()
            .serving
            .iter()
            .filter(|record| record.process == *process)
            .map(|record| record.units)
            .sum()
    }

    /// Number of processes in the wait list.
    pub fn waiting(&self) -> usize {
        self.0.state.borrow().waiting.len()
    }

    /// Number of records in the service list.
    pub fn serving(&self) -> usize {
        self.0.state.borrow().serving.len()
    }

    pub fn waiting_processes(&self) -> Vec<Process> {
        self.0
            .state
            .borrow()
            .waiting
            .iter()
            .map(|record| record.process.clone())
            .collect()
    }

    /// Request `units` for the calling process. The returned transfer completes once the
    /// units have been granted; it is already complete if they were available.
    pub fn request(&self, units: u64) -> Result<Transfer, SimError> {
        if units == 0 {
            return Ok(Transfer::ready());
        }
        let sim = self.simulator()?;
        let process = calling_process(&sim)?;
        let now = sim.time();
        let mut state = self.0.state.borrow_mut();
        let record = UserRecord {
            process: process.clone(),
            units,
            request_time: now,
        };
        if units <= state.available {
            state.available -= units;
            state.serving.push_back(record);
            if let Some(stats) = state.stats.as_mut() {
                stats.waiting_time.add(0.0);
            }
            state.sample(now);
            debug!(resource = %self.name(), process = %process.id(), units, time = now, "granted");
            return Ok(Transfer::ready());
        }
        self.0.policy.enqueue(&mut state.waiting, record);
        state.sample(now);
        drop(state);
        debug!(resource = %self.name(), process = %process.id(), units, time = now, "waiting");
        process.suspend()
    }

    /// Return `units` held by the calling process and serve the wait list.
    pub fn release(&self, units: u64) -> Result<(), SimError> {
        let sim = self.simulator()?;
        let process = calling_process(&sim)?;
        let now = sim.time();
        {
            let mut state = self.0.state.borrow_mut();
            let held: u64 = state
                .serving
                .iter()
                .filter(|record| record.process == process)
                .map(|record| record.units)
                .sum();
            if held < units {
                return Err(SimError::ReleaseExceedsHolding {
                    requested: units,
                    held,
                });
            }
            let mut remaining = units;
            let mut finished = Vec::new();
            state.serving.retain_mut(|record| {
                if remaining == 0 || record.process != process {
                    return true;
                }
                let taken = remaining.min(record.units);
                record.units -= taken;
                remaining -= taken;
                if record.units == 0 {
                    finished.push(now - record.request_time);
                    false
                } else {
                    true
                }
            });
            state.available += units;
            if let Some(stats) = state.stats.as_mut() {
                for sojourn in finished {
                    stats.sojourn.add(sojourn);
                }
            }
            state.sample(now);
        }
        debug!(resource = %self.name(), process = %process.id(), units, time = now, "released");
        self.grant_waiting(&sim)
    }

    /// Satisfy waiters in list order while units remain, resuming each granted process.
    fn grant_waiting(&self, sim: &Simulator) -> Result<(), SimError> {
        let now = sim.time();
        let mut granted = Vec::new();
        {
            let mut state = self.0.state.borrow_mut();
            let mut index = 0;
            while index < state.waiting.len() && state.available > 0 {
                let (alive, units) = {
                    let record = &state.waiting[index];
                    (record.process.is_alive(), record.units)
                };
                if !alive {
                    state.waiting.remove(index);
                    continue;
                }
                if units > state.available {
                    index += 1;
                    continue;
                }
                let Some(record) = state.waiting.remove(index) else {
                    break;
                };
                state.available -= units;
                if let Some(stats) = state.stats.as_mut() {
                    stats.waiting_time.add(now - record.request_time);
                }
                granted.push(record.process.clone());
                state.serving.push_back(record);
            }
            state.sample(now);
        }
        for process in granted {
            debug!(
                resource = %self.name(),
                process = %process.id(),
                time = now,
                "granted to waiter"
            );
            process.resume()?;
        }
        Ok(())
    }

    /// Add (or with a negative `delta`, remove) units. Removing more than are available fails.
    pub fn change_capacity(&self, delta: i64) -> Result<(), SimError> {
        if delta < 0 {
            self.shrink(delta.unsigned_abs())
        } else {
            self.grow(delta.unsigned_abs())
        }
    }

    pub fn set_capacity(&self, capacity: u64) -> Result<(), SimError> {
        let current = self.capacity();
        if capacity >= current {
            self.grow(capacity - current)
        } else {
            self.shrink(current - capacity)
        }
    }

    fn grow(&self, amount: u64) -> Result<(), SimError> {
        let sim = self.simulator()?;
        let now = sim.time();
        {
            let mut state = self.0.state.borrow_mut();
            let capacity = state
                .capacity
                .checked_add(amount)
                .ok_or(SimError::CapacityOverflow {
                    capacity: state.capacity,
                    requested: amount,
                })?;
            state.capacity = capacity;
            state.available += amount;
            state.sample(now);
        }
        debug!(resource = %self.name(), grown = amount, time = now, "capacity changed");
        if amount > 0 {
            self.grant_waiting(&sim)?;
        }
        Ok(())
    }

    fn shrink(&self, amount: u64) -> Result<(), SimError> {
        let sim = self.simulator()?;
        let now = sim.time();
        let mut state = self.0.state.borrow_mut();
        if amount > state.available {
            return Err(SimError::CapacityShrink {
                requested: amount,
                available: state.available,
            });
        }
        state.capacity -= amount;
        state.available -= amount;
        state.sample(now);
        drop(state);
        debug!(resource = %self.name(), shrunk = amount, time = now, "capacity changed");
        Ok(())
    }

    /// Take `process` out of the wait list without granting it anything. Returns whether it
    /// was waiting.
    pub fn withdraw(&self, process: &Process) -> bool {
        let now = self.simulator().map(|sim| sim.time()).unwrap_or(0.0);
        let mut state = self.0.state.borrow_mut();
        let removed = remove_waiter(&mut state.waiting, process).is_some();
        if removed {
            state.sample(now);
        }
        removed
    }

    /// Empty both lists and make every unit available again.
    pub fn init(&self) {
        let now = self.simulator().map(|sim| sim.time()).unwrap_or(0.0);
        let mut state = self.0.state.borrow_mut();
        state.serving.clear();
        state.waiting.clear();
        state.available = state.capacity;
        if state.stats.is_some() {
            let fresh = ResourceStats::new(&self.0.name, now, &state);
            state.stats = Some(fresh);
        }
    }

    pub fn set_stat_collecting(&self, collect: bool) {
        let now = self.simulator().map(|sim| sim.time()).unwrap_or(0.0);
        let mut state = self.0.state.borrow_mut();
        state.stats = if collect {
            Some(ResourceStats::new(&self.0.name, now, &state))
        } else {
            None
        };
    }

    pub fn stats(&self) -> Option<ResourceStats> {
        self.0.state.borrow().stats.clone()
    }

    /// Summary of the collected statistics up to the current time.
    pub fn report(&self) -> String {
        let now = self.simulator().map(|sim| sim.time()).unwrap_or(0.0);
        let state = self.0.state.borrow();
        let mut out = format!("REPORT ON RESOURCE: {}\n", self.0.name);
        match &state.stats {
            None => out.push_str("  statistical collecting is off\n"),
            Some(stats) => {
                for accumulate in [&stats.capacity, &stats.utilization, &stats.wait_list] {
                    let _ = writeln!(
                        out,
                        "  {:<28} min {:>10.4} max {:>10.4} avg {:>10.4}",
                        accumulate.name(),
                        accumulate.min(),
                        accumulate.max(),
                        accumulate.average_at(now)
                    );
                }
                let _ = writeln!(out, "  {}", stats.waiting_time.report());
                let _ = writeln!(out, "  {}", stats.sojourn.report());
            }
        }
        out
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.0.state.borrow();
        f.debug_struct("Resource")
            .field("name", &self.0.name)
            .field("capacity", &state.capacity)
            .field("available", &state.available)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}
