use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt::{self, Write},
    rc::{Rc, Weak},
};

use tracing::debug;

use crate::{
    primitives::{calling_process, remove_waiter, UserRecord},
    process::{Process, Transfer},
    simulator::{SimCore, Simulator},
    stats::{Accumulate, StatProbe, Tally},
    SimError,
};

#[derive(Clone, Debug)]
pub struct ConditionStats {
    pub wait_list: Accumulate,
    pub waiting_time: Tally,
}

type Observer = Box<dyn FnMut(bool)>;

struct ConditionState {
    state: bool,
    broadcasting: bool,
    waiting: VecDeque<UserRecord>,
    observers: Vec<Observer>,
    stats: Option<ConditionStats>,
}

impl ConditionState {
    fn sample(&mut self, now: f64) {
        if let Some(stats) = self.stats.as_mut() {
            stats.wait_list.update(now, self.waiting.len() as f64);
        }
    }
}

/// A boolean that processes can wait on. Setting it to `true` wakes every waiter.
#[derive(Clone)]
pub struct Condition(Rc<ConditionInner>);

struct ConditionInner {
    core: Weak<SimCore>,
    name: String,
    inner: RefCell<ConditionState>,
}

impl Condition {
    pub fn new(sim: &Simulator, name: impl Into<String>, state: bool) -> Self {
        Self(Rc::new(ConditionInner {
            core: sim.downgrade(),
            name: name.into(),
            inner: RefCell::new(ConditionState {
                state,
                broadcasting: false,
                waiting: VecDeque::new(),
                observers: Vec::new(),
                stats: None,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    fn simulator(&self) -> Result<Simulator, SimError> {
        Simulator::upgrade(&self.0.core)
    }

    fn now(&self) -> f64 {
        self.simulator().map(|sim| sim.time()).unwrap_or(0.0)
    }

    pub fn state(&self) -> bool {
        self.0.inner.borrow().state
    }

    pub fn waiting(&self) -> usize {
        self.0.inner.borrow().waiting.len()
    }

    /// Observers are only notified while broadcasting is on. Off by default.
    pub fn set_broadcasting(&self, broadcasting: bool) {
        self.0.inner.borrow_mut().broadcasting = broadcasting;
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: FnMut(bool) + 'static,
    {
        self.0.inner.borrow_mut().observers.push(Box::new(observer));
    }

    /// Store `value`. Setting `true` resumes every waiting process in arrival order.
    pub fn set(&self, value: bool) -> Result<(), SimError> {
        let now = self.now();
        let (woken, broadcasting) = {
            let mut inner = self.0.inner.borrow_mut();
            inner.state = value;
            let mut woken = Vec::new();
            if value {
                let waiting = std::mem::take(&mut inner.waiting);
                for record in waiting {
                    if !record.process.is_alive() {
                        continue;
                    }
                    if let Some(stats) = inner.stats.as_mut() {
                        stats.waiting_time.add(now - record.request_time);
                    }
                    woken.push(record.process);
                }
                inner.sample(now);
            }
            (woken, inner.broadcasting)
        };
        debug!(condition = %self.name(), value, woken = woken.len(), time = now, "set");
        for process in woken {
            process.resume()?;
        }
        if broadcasting {
            let mut observers = std::mem::take(&mut self.0.inner.borrow_mut().observers);
            for observer in observers.iter_mut() {
                observer(value);
            }
            let mut inner = self.0.inner.borrow_mut();
            observers.append(&mut inner.observers);
            inner.observers = observers;
        }
        Ok(())
    }

    /// Block the calling process until the condition is `true`. Completes at once if it
    /// already is.
    pub fn wait_for(&self) -> Result<Transfer, SimError> {
        if self.state() {
            return Ok(Transfer::ready());
        }
        let sim = self.simulator()?;
        let process = calling_process(&sim)?;
        let now = sim.time();
        {
            let mut inner = self.0.inner.borrow_mut();
            inner.waiting.push_back(UserRecord {
                process: process.clone(),
                units: 0,
                request_time: now,
            });
            inner.sample(now);
        }
        debug!(condition = %self.name(), process = %process.id(), time = now, "waiting");
        process.suspend()
    }

    /// Take `process` out of the wait list. Returns whether it was waiting.
    pub fn withdraw(&self, process: &Process) -> bool {
        let now = self.now();
        let mut inner = self.0.inner.borrow_mut();
        let removed = remove_waiter(&mut inner.waiting, process).is_some();
        if removed {
            inner.sample(now);
        }
        removed
    }

    pub fn set_stat_collecting(&self, collect: bool) {
        let now = self.now();
        let mut inner = self.0.inner.borrow_mut();
        inner.stats = if collect {
            let mut wait_list = Accumulate::new(format!("{} wait list", self.0.name));
            wait_list.init_at(now, inner.waiting.len() as f64);
            Some(ConditionStats {
                wait_list,
                waiting_time: Tally::new(format!("{} waiting time", self.0.name)),
            })
        } else {
            None
        };
    }

    pub fn stats(&self) -> Option<ConditionStats> {
        self.0.inner.borrow().stats.clone()
    }

    pub fn report(&self) -> String {
        let now = self.now();
        let inner = self.0.inner.borrow();
        let mut out = format!("REPORT ON CONDITION: {}\n", self.0.name);
        match &inner.stats {
            None => out.push_str("  statistical collecting is off\n"),
            Some(stats) => {
                let _ = writeln!(
                    out,
                    "  {:<28} min {:>10.4} max {:>10.4} avg {:>10.4}",
                    stats.wait_list.name(),
                    stats.wait_list.min(),
                    stats.wait_list.max(),
                    stats.wait_list.average_at(now)
                );
                let _ = writeln!(out, "  {}", stats.waiting_time.report());
            }
        }
        out
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.inner.borrow();
        f.debug_struct("Condition")
            .field("name", &self.0.name)
            .field("state", &inner.state)
            .field("waiting", &inner.waiting.len())
            .finish()
    }
}
