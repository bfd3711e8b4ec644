//! Integration test: random draws are a function of the seed and the block
//! layout only, never of thread count or interleaving.

use std::sync::Arc;
use std::time::Duration;

use plume_core::{FinishReason, NoopSynchronizer};
use plume_engine::{Simulation, SimulationConfig, WatchdogConfig};
use plume_test_utils::{particles, physics, staggered_pool, RecordingMover, TestParticle};

fn run(workers: usize, block_size: usize, seed: u64) -> Vec<TestParticle> {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = staggered_pool(500, 700, 37);
    let cfg = SimulationConfig {
        worker_count: Some(workers),
        block_size,
        seed,
        dt_seconds: 0.25,
        end_time_ms: 12_000,
        watchdog: WatchdogConfig {
            enabled: false,
            ..WatchdogConfig::default()
        },
        ..SimulationConfig::default()
    };
    let sim = Simulation::new(
        cfg,
        Arc::clone(&pool),
        physics(Arc::new(RecordingMover::new().completing_after(30))),
        Box::new(NoopSynchronizer),
    )
    .unwrap();
    sim.start().unwrap();
    assert!(sim.wait_finished(Duration::from_secs(20)).is_some());
    drop(sim);
    particles(&pool)
}

#[test]
fn same_seed_same_traces_across_worker_counts() {
    let single = run(1, 16, 9);
    let quad = run(4, 16, 9);
    let many = run(8, 16, 9);
    assert_eq!(single, quad);
    assert_eq!(single, many);
    assert!(single.iter().any(|p| p.moves > 0));
}

#[test]
fn repeated_runs_are_identical() {
    assert_eq!(run(3, 10, 1234), run(3, 10, 1234));
}

#[test]
fn seed_changes_the_traces() {
    let a = run(2, 16, 1);
    let b = run(2, 16, 2);
    assert_ne!(
        a.iter().map(|p| p.trace).collect::<Vec<_>>(),
        b.iter().map(|p| p.trace).collect::<Vec<_>>()
    );
}

#[test]
fn finish_reason_does_not_depend_on_worker_count() {
    let _ = env_logger::builder().is_test(true).try_init();
    let reasons: Vec<FinishReason> = [1, 5]
        .into_iter()
        .map(|workers| {
            let cfg = SimulationConfig {
                worker_count: Some(workers),
                block_size: 8,
                end_time_ms: 1_000_000,
                watchdog: WatchdogConfig {
                    enabled: false,
                    ..WatchdogConfig::default()
                },
                ..SimulationConfig::default()
            };
            let sim = Simulation::new(
                cfg,
                staggered_pool(64, 1_000, 16),
                physics(Arc::new(RecordingMover::new().completing_after(2))),
                Box::new(NoopSynchronizer),
            )
            .unwrap();
            sim.start().unwrap();
            let reason = sim.wait_finished(Duration::from_secs(20)).unwrap();
            assert_eq!(sim.step_count(), 5);
            reason
        })
        .collect();
    assert_eq!(
        reasons,
        vec![FinishReason::AllParticlesCompleted; 2]
    );
}
