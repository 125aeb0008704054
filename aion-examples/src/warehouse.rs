use std::{cell::RefCell, rc::Rc};

use aion::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Exp};
use tracing::info;
use tracing_subscriber::EnvFilter;

const HORIZON: f64 = 1_000.0;
const SUPPLIERS: usize = 3;
const SHOPS: usize = 4;

fn main() -> Result<(), SimError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let sim = Simulator::new();
    let stock = Bin::new(&sim, "stock");
    stock.set_stat_collecting(true);
    let rng = Rc::new(RefCell::new(StdRng::seed_from_u64(3)));
    let gaps = Exp::new(0.1).map_err(|e| SimError::ConfigError(e.to_string()))?;

    for i in 0..SUPPLIERS {
        let stock = stock.clone();
        let rng = Rc::clone(&rng);
        let supplier = Process::new(&sim, format!("supplier-{i}"), move |me| async move {
            loop {
                let gap = gaps.sample(&mut *rng.borrow_mut());
                me.delay(gap)?.await;
                let lot = rng.borrow_mut().random_range(5..=15);
                stock.put(lot)?;
            }
        });
        supplier.start()?;
    }

    let shipped = Rc::new(RefCell::new(vec![0u64; SHOPS]));
    for i in 0..SHOPS {
        let stock = stock.clone();
        let rng = Rc::clone(&rng);
        let shipped = Rc::clone(&shipped);
        let shop = Process::new(&sim, format!("shop-{i}"), move |me| async move {
            loop {
                let order = rng.borrow_mut().random_range(3..=12);
                stock.take(order)?.await;
                shipped.borrow_mut()[i] += order;
                let gap = rng.borrow_mut().random_range(4.0..12.0);
                me.delay(gap)?.await;
            }
        });
        shop.start()?;
    }

    sim.run_until(HORIZON)?;
    info!(time = sim.time(), waiting = stock.waiting(), "horizon reached");

    println!("{}", stock.report());
    for (shop, units) in shipped.borrow().iter().enumerate() {
        println!("shop-{shop} received {units} units");
    }
    Ok(())
}
