//! Integration test: the particle and sync phases never overlap.
//!
//! Every move of step *k* happens before the sync call of step *k*, and
//! that sync call happens before any move of step *k+1*.

use std::sync::Arc;
use std::time::Duration;

use plume_core::FinishReason;
use plume_engine::{Simulation, SimulationConfig, WatchdogConfig};
use plume_test_utils::{
    physics, uniform_pool, CountingSynchronizer, PhaseEvent, PhaseLog, RecordingMover,
};

fn run_logged(workers: usize, particles: usize, steps: i64) -> Vec<PhaseEvent> {
    let _ = env_logger::builder().is_test(true).try_init();
    let log = PhaseLog::new();
    let cfg = SimulationConfig {
        worker_count: Some(workers),
        block_size: 3,
        end_time_ms: steps * 1_000,
        watchdog: WatchdogConfig {
            enabled: false,
            ..WatchdogConfig::default()
        },
        ..SimulationConfig::default()
    };
    let sim = Simulation::new(
        cfg,
        uniform_pool(particles),
        physics(Arc::new(RecordingMover::new().logging_to(log.clone()))),
        Box::new(CountingSynchronizer::new().logging_to(log.clone())),
    )
    .unwrap();
    sim.start().unwrap();
    assert_eq!(
        sim.wait_finished(Duration::from_secs(10)),
        Some(FinishReason::EndTimeReached)
    );
    log.events()
}

fn assert_strictly_phased(events: &[PhaseEvent], particles: usize, steps: u64) {
    let mut step = 0u64;
    let mut moves_in_step = 0usize;
    for (i, event) in events.iter().enumerate() {
        match *event {
            PhaseEvent::Move { step: s } => {
                assert_eq!(s, step, "event {i}: move of step {s} during step {step}");
                moves_in_step += 1;
            }
            PhaseEvent::Sync { step: s } => {
                assert_eq!(s, step, "event {i}: sync of step {s} during step {step}");
                assert_eq!(
                    moves_in_step, particles,
                    "step {step}: sync ran before every particle moved"
                );
                step += 1;
                moves_in_step = 0;
            }
        }
    }
    assert_eq!(step, steps);
    assert_eq!(moves_in_step, 0);
}

#[test]
fn phases_alternate_with_one_worker() {
    let events = run_logged(1, 10, 6);
    assert_strictly_phased(&events, 10, 6);
}

#[test]
fn phases_alternate_with_many_workers() {
    let events = run_logged(6, 97, 25);
    assert_strictly_phased(&events, 97, 25);
}
