//! Criterion benchmarks for whole steps through the public `Simulation` API.

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use plume_bench::{reference_profile, stress_profile, DT_SECONDS};
use plume_core::NoopSynchronizer;
use plume_engine::Simulation;
use plume_test_utils::{physics, RecordingMover};

const STEPS: i64 = 20;

fn run_steps(c: &mut Criterion, name: &str, sim: &Simulation<plume_test_utils::TestParticle>) {
    c.bench_function(name, |b| {
        b.iter(|| {
            sim.reset().unwrap();
            sim.start().unwrap();
            black_box(sim.wait_finished(Duration::from_secs(60)).unwrap());
            sim.step_count()
        });
    });
}

fn bench_reference(c: &mut Criterion) {
    let mut group = c.benchmark_group("20_steps_10k");
    for workers in [1usize, 4, 8] {
        let (mut config, pool) = reference_profile(42, workers);
        config.end_time_ms = STEPS * (DT_SECONDS * 1000.0) as i64;
        let sim = Simulation::new(
            config,
            pool,
            physics(Arc::new(RecordingMover::new())),
            Box::new(NoopSynchronizer),
        )
        .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, _| {
            b.iter(|| {
                sim.reset().unwrap();
                sim.start().unwrap();
                black_box(sim.wait_finished(Duration::from_secs(60)).unwrap());
            });
        });
    }
    group.finish();
}

fn bench_stress(c: &mut Criterion) {
    let (mut config, pool) = stress_profile(42, 8);
    config.end_time_ms = STEPS * (DT_SECONDS * 1000.0) as i64;
    let sim = Simulation::new(
        config,
        pool,
        physics(Arc::new(RecordingMover::new())),
        Box::new(NoopSynchronizer),
    )
    .unwrap();
    run_steps(c, "20_steps_100k_8_workers", &sim);
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(20);
    targets = bench_reference, bench_stress
}
criterion_main!(benches);
