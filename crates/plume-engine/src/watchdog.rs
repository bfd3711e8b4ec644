//! Periodic liveness checker.
//!
//! Every poll interval, while the simulation is running, the watchdog
//! compares the step counter, the scheduler's and every member's progress
//! counter with the previous tick. Any movement means the run is alive.
//! No movement at all means it is wedged:
//!
//! - a scheduler busy with one message (a slow listener) is left alone.
//!   Restarting it would only race the thread still inside the listener.
//! - members busy without progress are *stuck*. The first wedged tick
//!   requests cooperative cancellation on them; if the same members are
//!   still stuck on the next wedged tick they are replaced.
//! - with nobody stuck (everyone parked) a completion was lost; only the
//!   scheduler is restarted.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use plume_core::Particle;

use crate::barrier::{spawn_named, Barrier};
use crate::config::ConfigError;
use crate::gate::PhaseToken;
use crate::heartbeat::{Heartbeat, MemberState};
use crate::recovery::{RecoveryPlan, StuckMember, StuckMembers, Supervisor};
use crate::scheduler::SchedulerCore;
use crate::simulation::SimulationStatus;

/// Outcome of one watchdog tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Not running; nothing checked.
    Idle,
    /// Something moved since the previous tick.
    Alive,
    /// No movement, but the scheduler is still handling a message.
    SchedulerBusy,
    /// Wedged; cancellation requested on these members.
    CancelRequested(StuckMembers),
    /// Wedged; a recovery was handed to the supervisor.
    Recovery { plan: RecoveryPlan, launched: bool },
}

pub(crate) struct Watchdog<P> {
    core: Arc<SchedulerCore<P>>,
    supervisor: Arc<Supervisor<P>>,
    last_steps: Option<u64>,
    last_progress: Vec<u64>,
    pending_cancel: StuckMembers,
}

impl<P: Particle> Watchdog<P> {
    pub fn new(core: Arc<SchedulerCore<P>>, supervisor: Arc<Supervisor<P>>) -> Self {
        Self {
            core,
            supervisor,
            last_steps: None,
            last_progress: Vec::new(),
            pending_cancel: StuckMembers::new(),
        }
    }

    fn heartbeat(&self, member: &StuckMember) -> Option<&Heartbeat> {
        match member.token {
            PhaseToken::Particle => self.core.particles.heartbeats().get(member.slot),
            PhaseToken::Sync => self.core.sync.heartbeats().get(member.slot),
        }
    }

    fn forget(&mut self) {
        self.last_steps = None;
        self.last_progress.clear();
        self.pending_cancel.clear();
    }

    pub fn tick(&mut self) -> Verdict {
        if self.core.control().status != SimulationStatus::Running
            || self.supervisor.is_recovering()
        {
            self.forget();
            return Verdict::Idle;
        }

        let steps = self.core.steps();
        let progress: Vec<u64> = std::iter::once(self.core.heartbeat())
            .chain(self.core.particles.heartbeats())
            .chain(self.core.sync.heartbeats())
            .map(Heartbeat::progress)
            .collect();
        let moved = self.last_steps != Some(steps) || progress != self.last_progress;
        self.last_steps = Some(steps);
        self.last_progress = progress;
        if moved {
            self.pending_cancel.clear();
            return Verdict::Alive;
        }

        let scheduler = self.core.heartbeat().snapshot();
        if scheduler.state == MemberState::Busy {
            log::warn!(
                "scheduler busy for {}ms on one message; not restarting it",
                scheduler.busy_ms.unwrap_or(0)
            );
            return Verdict::SchedulerBusy;
        }

        log::warn!(
            "no progress since the last watchdog check\n{}",
            self.core.diagnostics()
        );

        let stuck: StuckMembers = busy_members(PhaseToken::Particle, self.core.particles.heartbeats())
            .chain(busy_members(PhaseToken::Sync, self.core.sync.heartbeats()))
            .collect();

        if stuck.is_empty() {
            self.pending_cancel.clear();
            let plan = RecoveryPlan::RestartScheduler;
            let launched = self.supervisor.recover(plan.clone());
            return Verdict::Recovery { plan, launched };
        }

        if stuck == self.pending_cancel {
            self.pending_cancel.clear();
            let plan = RecoveryPlan::ReplaceMembers(stuck);
            let launched = self.supervisor.recover(plan.clone());
            return Verdict::Recovery { plan, launched };
        }

        for member in &stuck {
            if let Some(hb) = self.heartbeat(member) {
                hb.request_cancel();
            }
        }
        log::warn!("requested cancellation of {} stuck members", stuck.len());
        self.pending_cancel = stuck.clone();
        Verdict::CancelRequested(stuck)
    }
}

fn busy_members(
    token: PhaseToken,
    heartbeats: &[Heartbeat],
) -> impl Iterator<Item = StuckMember> + '_ {
    heartbeats
        .iter()
        .enumerate()
        .filter(|(_, hb)| hb.state() == MemberState::Busy)
        .map(move |(slot, _)| StuckMember { token, slot })
}

/// Spawn the watchdog thread. Dropping (or sending on) the returned
/// sender stops it.
pub(crate) fn spawn_watchdog<P: Particle>(
    mut watchdog: Watchdog<P>,
    poll: Duration,
) -> Result<(Sender<()>, JoinHandle<()>), ConfigError> {
    let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);
    let handle = spawn_named("plume-watchdog".to_string(), move || loop {
        match stop_rx.recv_timeout(poll) {
            Err(RecvTimeoutError::Timeout) => match watchdog.tick() {
                Verdict::Idle | Verdict::Alive => {}
                verdict => log::debug!("watchdog verdict: {verdict:?}"),
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    })?;
    log::debug!("watchdog polling every {poll:?}");
    Ok((stop_tx, handle))
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use plume_core::{FinishReason, NoopSynchronizer};
    use plume_test_utils::{physics, uniform_pool, HangingMover, RecordingMover, TestParticle};

    use super::*;
    use crate::config::{SimulationConfig, WatchdogConfig};
    use crate::simulation::Simulation;

    const WAIT: Duration = Duration::from_secs(10);

    /// A simulation whose watchdog thread is off, so ticks are driven by
    /// the test.
    fn simulation(
        physics: plume_core::Physics<TestParticle>,
        end_time_ms: i64,
        max_restarts: u32,
    ) -> Simulation<TestParticle> {
        let cfg = SimulationConfig {
            worker_count: Some(2),
            block_size: 4,
            end_time_ms,
            watchdog: WatchdogConfig {
                enabled: false,
                max_restarts,
                restart_window_ms: 60_000,
                ..WatchdogConfig::default()
            },
            ..SimulationConfig::default()
        };
        Simulation::new(cfg, uniform_pool(40), physics, Box::new(NoopSynchronizer)).unwrap()
    }

    fn watchdog(sim: &Simulation<TestParticle>) -> Watchdog<TestParticle> {
        let (core, supervisor) = sim.internals();
        Watchdog::new(core, supervisor)
    }

    /// Tick every 20ms until something other than `Alive` comes back.
    fn first_wedged_verdict(dog: &mut Watchdog<TestParticle>) -> Verdict {
        let deadline = Instant::now() + WAIT;
        loop {
            thread::sleep(Duration::from_millis(20));
            let verdict = dog.tick();
            if verdict != Verdict::Alive || Instant::now() >= deadline {
                return verdict;
            }
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn force_running(sim: &Simulation<TestParticle>) {
        let (core, _) = sim.internals();
        core.control().status = SimulationStatus::Running;
    }

    #[test]
    fn idle_until_running() {
        let mut sim = simulation(physics(Arc::new(RecordingMover::new())), 5_000, 3);
        let mut dog = watchdog(&sim);
        assert_eq!(dog.tick(), Verdict::Idle);
        assert_eq!(dog.tick(), Verdict::Idle);
        sim.shutdown();
    }

    #[test]
    fn busy_scheduler_is_left_alone() {
        let mut sim = simulation(physics(Arc::new(RecordingMover::new())), 5_000, 3);
        let (core, _) = sim.internals();
        let mut dog = watchdog(&sim);
        force_running(&sim);
        core.heartbeat().begin_block();

        assert_eq!(dog.tick(), Verdict::Alive);
        assert_eq!(dog.tick(), Verdict::SchedulerBusy);
        assert_eq!(dog.tick(), Verdict::SchedulerBusy);
        assert_eq!(sim.health().recoveries, 0);

        core.heartbeat().set_state(MemberState::Waiting);
        core.control().status = SimulationStatus::Ready;
        sim.shutdown();
    }

    #[test]
    fn lost_start_restarts_the_scheduler() {
        let mover = Arc::new(RecordingMover::new());
        let mut sim = simulation(physics(Arc::clone(&mover)), 5_000, 3);
        let mut dog = watchdog(&sim);
        // Running, but the scheduler never received `Start`.
        force_running(&sim);

        assert_eq!(dog.tick(), Verdict::Alive);
        assert_eq!(
            dog.tick(),
            Verdict::Recovery {
                plan: RecoveryPlan::RestartScheduler,
                launched: true
            }
        );

        // The replacement resyncs from an idle step and drives the run.
        assert_eq!(sim.wait_finished(WAIT), Some(FinishReason::EndTimeReached));
        assert_eq!(sim.step_count(), 5);
        assert_eq!(mover.total_moves(), 200);
        assert_eq!(sim.health().recoveries, 1);
        sim.shutdown();
    }

    #[test]
    fn stuck_worker_is_cancelled_then_replaced() {
        let mover = Arc::new(HangingMover::new(5, false));
        let mut sim = simulation(physics(Arc::clone(&mover)), i64::MAX / 2, 3);
        let (core, _) = sim.internals();
        let mut dog = watchdog(&sim);
        sim.start().unwrap();
        assert!(wait_until(|| mover.entered()));

        let stuck = match first_wedged_verdict(&mut dog) {
            Verdict::CancelRequested(stuck) => stuck,
            other => panic!("expected a cancel request, got {other:?}"),
        };
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].token, PhaseToken::Particle);
        assert!(core.particles.heartbeats()[stuck[0].slot].is_cancelled());

        // The mover ignores cancellation: the same member is replaced.
        assert_eq!(
            dog.tick(),
            Verdict::Recovery {
                plan: RecoveryPlan::ReplaceMembers(stuck),
                launched: true
            }
        );
        assert!(wait_until(|| sim.health().recoveries == 1));
        let before = sim.step_count();
        assert!(wait_until(|| sim.step_count() > before + 2));

        mover.release();
        sim.stop().unwrap();
        assert!(sim.wait_idle(WAIT));
        sim.shutdown();
    }

    #[test]
    fn spent_budget_refuses_recovery() {
        let mover = Arc::new(HangingMover::new(5, false));
        let mut sim = simulation(physics(Arc::clone(&mover)), i64::MAX / 2, 0);
        let mut dog = watchdog(&sim);
        sim.start().unwrap();
        assert!(wait_until(|| mover.entered()));

        let stuck = match first_wedged_verdict(&mut dog) {
            Verdict::CancelRequested(stuck) => stuck,
            other => panic!("expected a cancel request, got {other:?}"),
        };
        assert_eq!(
            dog.tick(),
            Verdict::Recovery {
                plan: RecoveryPlan::ReplaceMembers(stuck),
                launched: false
            }
        );
        let health = sim.health();
        assert_eq!(health.recoveries, 0);
        assert_eq!(health.recoveries_refused, 1);

        mover.release();
        sim.stop().unwrap();
        assert!(sim.wait_idle(WAIT));
        sim.shutdown();
    }
}
