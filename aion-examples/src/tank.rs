use std::{cell::RefCell, rc::Rc};

use aion::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CAPACITY: f64 = 100.0;
const INFLOW: f64 = 4.0;
const LEAK: f64 = 0.02;
const CYCLES: usize = 5;

fn main() -> Result<(), SimError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = SimConfig::new()
        .with_integrator(Integrator::RungeKutta4 { step: 0.1 })
        .with_dispatch_log(1 << 16);
    config.validate()?;
    let sim = Simulator::from_config(&config)?;

    // level' = inflow - leak * level
    let level = Continuous::new(&sim, 0.0, |_, level| INFLOW - LEAK * level);
    let full = Condition::new(&sim, "tank full", false);
    full.set_stat_collecting(true);
    full.set_broadcasting(true);
    full.subscribe(|state| info!(state, "tank full flag changed"));

    {
        let full = full.clone();
        let me = level.clone();
        level.on_step(move |sim, value| {
            if value >= CAPACITY && !full.state() {
                info!(time = sim.time(), value, "tank reached capacity");
                me.stop_integ()?;
                full.set(true)?;
            }
            Ok(())
        });
    }

    let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(11)));
    let fill_times = Rc::new(RefCell::new(Vec::new()));
    let operator = {
        let level = level.clone();
        let full = full.clone();
        let fill_times = Rc::clone(&fill_times);
        Process::new(&sim, "operator", move |me| async move {
            let sim = me.simulator()?;
            for _ in 0..CYCLES {
                let started = sim.time();
                level.start_integ_from(0.0)?;
                full.wait_for()?.await;
                fill_times.borrow_mut().push(sim.time() - started);
                let drain = rng.borrow_mut().random_range(2.0..6.0);
                me.delay(drain)?.await;
                full.set(false)?;
            }
            Ok(())
        })
    };
    operator.start()?;

    sim.start()?;
    level.on_step(|_, _| Ok(()));

    for (cycle, time) in fill_times.borrow().iter().enumerate() {
        println!("cycle {cycle}: filled in {time:.2}");
    }
    println!("{}", full.report());
    if let Some(log) = sim.dispatch_log() {
        println!("dispatched {} events ({} bytes logged)", log.len(), log.as_bytes().len());
    }
    Ok(())
}
