use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt::{self, Write},
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
pub struct BinStats {
    pub available: Accumulate,
    pub wait_list: Accumulate,
    pub waiting_time: Tally,
}

impl BinStats {
    fn new(name: &str, now: f64, state: &BinState) -> Self {
        let mut stats = Self {
            available: Accumulate::new(format!("{name} available")),
            wait_list: Accumulate::new(format!("{name} wait list")),
            waiting_time: Tally::new(format!("{name} waiting time")),
        };
        stats.available.init_at(now, state.available as f64);
        stats.wait_list.init_at(now, state.waiting.len() as f64);
        stats
    }
}

struct BinState {
    available: u64,
    waiting: VecDeque<UserRecord>,
    stats: Option<BinStats>,
}

impl BinState {
    fn sample(&mut self, now: f64) {
        if let Some(stats) = self.stats.as_mut() {
            stats.available.update(now, self.available as f64);
            stats.wait_list.update(now, self.waiting.len() as f64);
        }
    }
}

/// An unbounded store of identical units: producers `put`, consumers `take` and block while
/// there are not enough units.
#[derive(Clone)]
pub struct Bin(Rc<BinInner>);

struct BinInner {
    core: Weak<SimCore>,
    name: String,
    policy: Policy,
    state: RefCell<BinState>,
}

impl Bin {
    pub fn new(sim: &Simulator, name: impl Into<String>) -> Self {
        Self::with_policy(sim, name, Policy::Fifo)
    }

    pub fn with_policy(sim: &Simulator, name: impl Into<String>, policy: Policy) -> Self {
        Self(Rc::new(BinInner {
            core: sim.downgrade(),
            name: name.into(),
            policy,
            state: RefCell::new(BinState {
                available: 0,
                waiting: VecDeque::new(),
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

    pub fn available(&self) -> u64 {
        self.0.state.borrow().available
    }

    pub fn waiting(&self) -> usize {
        self.0.state.borrow().waiting.len()
    }

    /// Remove `units`. The calling process blocks until they can be taken as a whole.
    pub fn take(&self, units: u64) -> Result<Transfer, SimError> {
        let sim = self.simulator()?;
        let now = sim.time();
        let mut state = self.0.state.borrow_mut();
        if units <= state.available {
            state.available -= units;
            if let Some(stats) = state.stats.as_mut() {
                stats.waiting_time.add(0.0);
            }
            state.sample(now);
            return Ok(Transfer::ready());
        }
        let process = calling_process(&sim)?;
        self.0.policy.enqueue(
            &mut state.waiting,
            UserRecord {
                process: process.clone(),
                units,
                request_time: now,
            },
        );
        state.sample(now);
        drop(state);
        debug!(bin = %self.name(), process = %process.id(), units, time = now, "waiting");
        process.suspend()
    }

    /// Add `units` and satisfy every waiter whose request now fits, in list order. Waiters whose
    /// process is dead are removed.
    pub fn put(&self, units: u64) -> Result<(), SimError> {
        let sim = self.simulator()?;
        let now = sim.time();
        let mut granted = Vec::new();
        {
            let mut state = self.0.state.borrow_mut();
            state.available += units;
            let waiting = std::mem::take(&mut state.waiting);
            for record in waiting {
                if !record.process.is_alive() {
                    continue;
                }
                if record.units <= state.available {
                    state.available -= record.units;
                    if let Some(stats) = state.stats.as_mut() {
                        stats.waiting_time.add(now - record.request_time);
                    }
                    granted.push(record.process);
                } else {
                    state.waiting.push_back(record);
                }
            }
            state.sample(now);
        }
        debug!(bin = %self.name(), units, granted = granted.len(), time = now, "put");
        for process in granted {
            process.resume()?;
        }
        Ok(())
    }

    /// Take `process` out of the wait list. Returns whether it was waiting.
    pub fn withdraw(&self, process: &Process) -> bool {
        let now = self.now();
        let mut state = self.0.state.borrow_mut();
        let removed = remove_waiter(&mut state.waiting, process).is_some();
        if removed {
            state.sample(now);
        }
        removed
    }

    /// Empty the bin and its wait list.
    pub fn init(&self) {
        let now = self.now();
        let mut state = self.0.state.borrow_mut();
        state.available = 0;
        state.waiting.clear();
        if state.stats.is_some() {
            let fresh = BinStats::new(&self.0.name, now, &state);
            state.stats = Some(fresh);
        }
    }

    pub fn set_stat_collecting(&self, collect: bool) {
        let now = self.now();
        let mut state = self.0.state.borrow_mut();
        state.stats = if collect {
            Some(BinStats::new(&self.0.name, now, &state))
        } else {
            None
        };
    }

    pub fn stats(&self) -> Option<BinStats> {
        self.0.state.borrow().stats.clone()
    }

    pub fn report(&self) -> String {
        let now = self.now();
        let state = self.0.state.borrow();
        let mut out = format!("REPORT ON BIN: {}\n", self.0.name);
        match &state.stats {
            None => out.push_str("  statistical collecting is off\n"),
            Some(stats) => {
                for accumulate in [&stats.available, &stats.wait_list] {
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
            }
        }
        out
    }
}

impl fmt::Debug for Bin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.borrow();
        f.debug_struct("Bin")
            .field("name", &self.0.name)
            .field("available", &state.available)
            .field("waiting", &state.waiting.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Rc<RefCell<Vec<(&'static str, f64)>>>;

    fn consumer(
        sim: &Simulator,
        bin: &Bin,
        log: &Log,
        tag: &'static str,
        arrive: f64,
        units: u64,
    ) -> Process {
        let bin = bin.clone();
        let log = Rc::clone(log);
        let process = Process::new(sim, tag, move |me| async move {
            bin.take(units)?.await;
            log.borrow_mut().push((tag, me.simulator()?.time()));
            Ok(())
        });
        process.schedule(arrive).unwrap();
        process
    }

    fn put_at(sim: &Simulator, bin: &Bin, time: f64, units: u64) {
        let bin = bin.clone();
        sim.schedule(time, move |_| bin.put(units)).unwrap();
    }

    #[test]
    fn test_take_blocks_until_put() {
        let sim = Simulator::new();
        let bin = Bin::new(&sim, "parts");
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        consumer(&sim, &bin, &log, "c", 1.0, 3);
        put_at(&sim, &bin, 2.0, 2);
        put_at(&sim, &bin, 4.0, 2);
        sim.start().unwrap();
        assert_eq!(*log.borrow(), vec![("c", 4.0)]);
        assert_eq!(bin.available(), 1);
    }

    #[test]
    fn test_put_serves_every_fitting_waiter() {
        let sim = Simulator::new();
        let bin = Bin::new(&sim, "parts");
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        consumer(&sim, &bin, &log, "big", 0.0, 5);
        consumer(&sim, &bin, &log, "small", 0.0, 1);
        consumer(&sim, &bin, &log, "medium", 0.0, 2);
        put_at(&sim, &bin, 1.0, 3);
        sim.start().unwrap();
        assert_eq!(*log.borrow(), vec![("small", 1.0), ("medium", 1.0)]);
        assert_eq!(bin.waiting(), 1);
        assert_eq!(bin.available(), 0);
    }

    #[test]
    fn test_take_without_blocking_needs_no_process() {
        let sim = Simulator::new();
        let bin = Bin::new(&sim, "parts");
        bin.put(4).unwrap();
        assert!(!bin.take(3).unwrap().is_blocking());
        assert!(matches!(bin.take(3), Err(SimError::NoCurrentProcess)));
        assert_eq!(bin.available(), 1);
    }

    #[test]
    fn test_dead_waiters_are_removed() {
        let sim = Simulator::new();
        let bin = Bin::new(&sim, "parts");
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        let doomed = consumer(&sim, &bin, &log, "doomed", 0.0, 1);
        consumer(&sim, &bin, &log, "alive", 0.0, 1);
        sim.schedule(1.0, move |_| doomed.kill().map(drop)).unwrap();
        put_at(&sim, &bin, 2.0, 1);
        sim.start().unwrap();
        assert_eq!(*log.borrow(), vec![("alive", 2.0)]);
        assert_eq!(bin.waiting(), 0);
        assert_eq!(bin.available(), 0);
    }

    #[test]
    fn test_statistics() {
        let sim = Simulator::new();
        let bin = Bin::new(&sim, "store");
        bin.set_stat_collecting(true);
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        consumer(&sim, &bin, &log, "c", 0.0, 2);
        put_at(&sim, &bin, 4.0, 2);
        put_at(&sim, &bin, 6.0, 4);
        sim.start().unwrap();
        let stats = bin.stats().unwrap();
        assert_eq!(stats.waiting_time.average(), 4.0);
        assert_eq!(stats.available.max(), 4.0);
        assert!((stats.wait_list.average_at(8.0) - 0.5).abs() < 1e-12);
        assert!(bin.report().starts_with("REPORT ON BIN: store"));
    }
}
