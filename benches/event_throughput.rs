use std::{cell::RefCell, rc::Rc};

use aion::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

// Recurring event that reschedules itself one time unit later until its budget runs out
fn spawn_ticker(sim: &Simulator, steps: usize) -> Rc<RefCell<Option<Event>>> {
    let slot: Rc<RefCell<Option<Event>>> = Rc::new(RefCell::new(None));
    let me = Rc::clone(&slot);
    let mut remaining = steps;
    let event = Event::new(sim, move |_| {
        if remaining > 0 {
            remaining -= 1;
            if let Some(event) = me.borrow().as_ref() {
                event.schedule(1.0)?;
            }
        }
        Ok(())
    });
    event.schedule(1.0).unwrap();
    *slot.borrow_mut() = Some(event);
    slot
}

fn bench_event_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("event_throughput");

    // Test different numbers of concurrent tickers
    for num_tickers in [1, 10, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::new("tickers", num_tickers),
            num_tickers,
            |b, &num_tickers| {
                b.iter_with_setup(
                    || {
                        let sim = Simulator::new();
                        let slots: Vec<_> = (0..num_tickers)
                            .map(|_| spawn_ticker(&sim, 1000))
                            .collect();
                        (sim, slots)
                    },
                    |(sim, slots)| {
                        sim.start().unwrap();
                        for slot in &slots {
                            slot.borrow_mut().take();
                        }
                        black_box(sim.events_dispatched());
                    },
                );
            },
        );
    }

    group.finish();
}

// Events scheduled at identical times stress the sequence tie-break
fn bench_same_time_ties(c: &mut Criterion) {
    let mut group = c.benchmark_group("same_time_ties");

    for &count in [1_000u64, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("events", count), &count, |b, &count| {
            b.iter_with_setup(
                || {
                    let sim = Simulator::new();
                    for _ in 0..count {
                        sim.schedule(5.0, |_| Ok(())).unwrap();
                    }
                    sim
                },
                |sim| {
                    sim.start().unwrap();
                    black_box(sim.time());
                },
            );
        });
    }

    group.finish();
}

// Reports events per second for a fixed horizon
fn bench_events_per_second(c: &mut Criterion) {
    let mut group = c.benchmark_group("events_per_second");
    group.sample_size(10);

    let horizon = 100_000usize;

    for &num_tickers in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements((horizon * num_tickers) as u64));
        group.bench_with_input(
            BenchmarkId::new("tickers", num_tickers),
            &num_tickers,
            |b, &num_tickers| {
                b.iter_with_setup(
                    || {
                        let sim = Simulator::new();
                        let slots: Vec<_> = (0..num_tickers)
                            .map(|_| spawn_ticker(&sim, horizon))
                            .collect();
                        (sim, slots)
                    },
                    |(sim, slots)| {
                        sim.start().unwrap();
                        for slot in &slots {
                            slot.borrow_mut().take();
                        }
                        black_box(sim.events_dispatched());
                    },
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_event_throughput,
    bench_same_time_ties,
    bench_events_per_second
);
criterion_main!(benches);
