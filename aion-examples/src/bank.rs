use std::{cell::RefCell, rc::Rc, time::Instant};

use aion::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Exp};
use tracing::info;
use tracing_subscriber::EnvFilter;

const TELLERS: u64 = 2;
const CLOSING_TIME: f64 = 480.0;
const MEAN_ARRIVAL: f64 = 1.2;
const MEAN_SERVICE: f64 = 2.0;

fn main() -> Result<(), SimError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let sim = Simulator::new();
    let tellers = Resource::new(&sim, "tellers", TELLERS);
    tellers.set_stat_collecting(true);
    let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(7)));
    let served = Rc::new(RefCell::new(0u64));

    let arrivals = Exp::new(1.0 / MEAN_ARRIVAL).map_err(|e| SimError::ConfigError(e.to_string()))?;
    let service = Exp::new(1.0 / MEAN_SERVICE).map_err(|e| SimError::ConfigError(e.to_string()))?;

    // the door spawns customers until closing time
    let door = {
        let tellers = tellers.clone();
        let rng = Rc::clone(&rng);
        let served = Rc::clone(&served);
        Process::new(&sim, "door", move |me| async move {
            let sim = me.simulator()?;
            let mut next = 0u64;
            loop {
                let gap = arrivals.sample(&mut *rng.borrow_mut());
                if sim.time() + gap > CLOSING_TIME {
                    return Ok(());
                }
                me.delay(gap)?.await;
                let hold = service.sample(&mut *rng.borrow_mut());
                let tellers = tellers.clone();
                let served = Rc::clone(&served);
                let customer = Process::new(&sim, format!("customer-{next}"), move |me| async move {
                    tellers.request(1)?.await;
                    me.delay(hold)?.await;
                    tellers.release(1)?;
                    *served.borrow_mut() += 1;
                    Ok(())
                });
                customer.start()?;
                next += 1;
            }
        })
    };
    door.start()?;

    let start = Instant::now();
    sim.start()?;
    let elapsed = start.elapsed();

    info!(
        served = *served.borrow(),
        closed_at = sim.time(),
        events = sim.events_dispatched(),
        "bank closed"
    );
    println!("{}", tellers.report());
    println!("Simulated {:.1} minutes in {:.2?}", sim.time(), elapsed);
    println!("Customers served: {}", served.borrow());
    Ok(())
}
