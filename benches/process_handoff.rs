use aion::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

// Each worker repeatedly delays itself, so every step is one control transfer in and out
fn bench_delay_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("process_delay_handoff");

    let rounds = 1_000u64;
    for &workers in [1u64, 10, 100].iter() {
        group.throughput(Throughput::Elements(rounds * workers));
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.iter_with_setup(
                    || {
                        let sim = Simulator::new();
                        for i in 0..workers {
                            let name = format!("worker-{i}");
                            let process = Process::new(&sim, name, move |me| async move {
                                for _ in 0..rounds {
                                    me.delay(1.0)?.await;
                                }
                                Ok(())
                            });
                            process.start().unwrap();
                        }
                        sim
                    },
                    |sim| {
                        sim.start().unwrap();
                        black_box(sim.events_dispatched());
                    },
                );
            },
        );
    }

    group.finish();
}

// Customers contend for a single-unit resource; every release hands it to the next waiter
fn bench_resource_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("resource_contention");
    group.sample_size(20);

    for &customers in [10u64, 100, 1000].iter() {
        group.throughput(Throughput::Elements(customers));
        group.bench_with_input(
            BenchmarkId::new("customers", customers),
            &customers,
            |b, &customers| {
                b.iter_with_setup(
                    || {
                        let sim = Simulator::new();
                        let server = Resource::new(&sim, "server", 1);
                        for i in 0..customers {
                            let server = server.clone();
                            let name = format!("customer-{i}");
                            let process = Process::new(&sim, name, move |me| async move {
                                server.request(1)?.await;
                                me.delay(1.0)?.await;
                                server.release(1)
                            });
                            process.schedule(i as f64 * 0.5).unwrap();
                        }
                        sim
                    },
                    |sim| {
                        sim.start().unwrap();
                        black_box(sim.time());
                    },
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_delay_handoff, bench_resource_contention);
criterion_main!(benches);
