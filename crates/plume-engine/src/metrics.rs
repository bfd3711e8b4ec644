//! Per-step performance metrics and run-health counters.
//!
//! [`StepMetrics`] captures timing and work-distribution data for a single
//! step. [`SimulationHealth`] is a snapshot of the counters that workers,
//! the sync thread and the supervisor bump when something goes wrong.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use plume_core::StepId;

/// Timing and work metrics collected during a single step.
///
/// All durations are in microseconds of wall-clock time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepMetrics {
    /// 0-based id of the completed step.
    pub step: StepId,
    /// Time from arming the particle phase to its completion.
    pub particle_phase_us: u64,
    /// Time from arming the sync phase to its completion.
    pub sync_phase_us: u64,
    /// Wall-clock time for the entire step.
    pub total_us: u64,
    /// Work blocks handed out during the particle phase.
    pub blocks_issued: u64,
    /// Particle indices covered by those blocks.
    pub particles_assigned: u64,
}

/// Snapshot of run-health counters.
///
/// `consistency_risk` is set whenever the step results may not match an
/// undisturbed run: a block was abandoned, a particle was skipped because
/// a wedged thread held it, a random stream had to be re-derived, or a
/// thread was replaced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimulationHealth {
    /// Results of the current run may be incomplete or non-reproducible.
    pub consistency_risk: bool,
    /// Blocks abandoned after a collaborator error or panic.
    pub block_failures: u64,
    /// Sync phases whose synchronizer failed, panicked or was unavailable.
    pub sync_failures: u64,
    /// Active particles skipped because their domain was undefined.
    pub undefined_domain: u64,
    /// Particles skipped because a wedged thread still held them.
    pub quarantined_particles: u64,
    /// Random streams re-derived because a wedged thread held them.
    pub replaced_streams: u64,
    /// Recoveries performed by the supervisor.
    pub recoveries: u64,
    /// Recoveries refused by the restart policy.
    pub recoveries_refused: u64,
}

/// Shared atomic counters behind [`SimulationHealth`].
#[derive(Debug, Default)]
pub(crate) struct RunHealth {
    consistency_risk: AtomicBool,
    block_failures: AtomicU64,
    sync_failures: AtomicU64,
    undefined_domain: AtomicU64,
    quarantined_particles: AtomicU64,
    replaced_streams: AtomicU64,
    recoveries: AtomicU64,
    recoveries_refused: AtomicU64,
}

// Compile-time assertion: RunHealth must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<RunHealth>();
};

impl RunHealth {
    pub fn flag_consistency_risk(&self) {
        self.consistency_risk.store(true, Ordering::Release);
    }

    pub fn record_block_failure(&self) {
        self.block_failures.fetch_add(1, Ordering::Relaxed);
        self.flag_consistency_risk();
    }

    pub fn record_sync_failure(&self) {
        self.sync_failures.fetch_add(1, Ordering::Relaxed);
        self.flag_consistency_risk();
    }

    pub fn record_undefined_domain(&self) {
        self.undefined_domain.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_quarantined(&self) {
        self.quarantined_particles.fetch_add(1, Ordering::Relaxed);
        self.flag_consistency_risk();
    }

    pub fn record_replaced_stream(&self) {
        self.replaced_streams.fetch_add(1, Ordering::Relaxed);
        self.flag_consistency_risk();
    }

    pub fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refused_recovery(&self) {
        self.recoveries_refused.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear the per-run counters. Recovery counters span the lifetime
    /// of the simulation and are kept.
    pub fn clear_run(&self) {
        self.consistency_risk.store(false, Ordering::Release);
        self.block_failures.store(0, Ordering::Relaxed);
        self.sync_failures.store(0, Ordering::Relaxed);
        self.undefined_domain.store(0, Ordering::Relaxed);
        self.quarantined_particles.store(0, Ordering::Relaxed);
        self.replaced_streams.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SimulationHealth {
        SimulationHealth {
            consistency_risk: self.consistency_risk.load(Ordering::Acquire),
            block_failures: self.block_failures.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
            undefined_domain: self.undefined_domain.load(Ordering::Relaxed),
            quarantined_particles: self.quarantined_particles.load(Ordering::Relaxed),
            replaced_streams: self.replaced_streams.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            recoveries_refused: self.recoveries_refused.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics_are_zero() {
        let m = StepMetrics::default();
        assert_eq!(m.step, StepId(0));
        assert_eq!(m.total_us, 0);
        assert_eq!(m.blocks_issued, 0);
        assert_eq!(m.particles_assigned, 0);
    }

    #[test]
    fn failures_flag_consistency_risk() {
        let health = RunHealth::default();
        assert!(!health.snapshot().consistency_risk);
        health.record_undefined_domain();
        assert!(!health.snapshot().consistency_risk);
        health.record_block_failure();
        let snap = health.snapshot();
        assert!(snap.consistency_risk);
        assert_eq!(snap.block_failures, 1);
        assert_eq!(snap.undefined_domain, 1);
    }

    #[test]
    fn clear_run_keeps_recovery_counters() {
        let health = RunHealth::default();
        health.record_quarantined();
        health.record_replaced_stream();
        health.record_recovery();
        health.record_refused_recovery();
        health.clear_run();
        let snap = health.snapshot();
        assert_eq!(
            snap,
            SimulationHealth {
                recoveries: 1,
                recoveries_refused: 1,
                ..Default::default()
            }
        );
    }
}
