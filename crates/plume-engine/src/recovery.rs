//! Bounded, best-effort recovery from wedged threads.
//!
//! The watchdog decides *that* something is wedged and hands a
//! [`RecoveryPlan`] to the [`Supervisor`]. The supervisor decides whether
//! a recovery is admitted (at most `max_restarts` within
//! `restart_window_ms`) and runs it on a one-shot `plume-recovery` thread:
//!
//! 1. supersede the scheduler thread,
//! 2. replace every stuck barrier member with a fresh thread,
//! 3. call every registered [`LockBreaker`],
//! 4. spawn a new scheduler that resynchronizes from the gates.
//!
//! Recovery is not transactional. The remainder of an abandoned block is
//! skipped and the run is flagged as a consistency risk.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use plume_core::{LockBreaker, Particle};
use smallvec::SmallVec;

use crate::barrier::{spawn_named, Barrier};
use crate::config::WatchdogConfig;
use crate::gate::PhaseToken;
use crate::scheduler::SchedulerCore;
use crate::simulation::SimulationStatus;
use crate::worker::panic_message;

/// A barrier member the watchdog found busy without progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StuckMember {
    pub token: PhaseToken,
    pub slot: usize,
}

pub(crate) type StuckMembers = SmallVec<[StuckMember; 8]>;

/// What a recovery has to do besides restarting the scheduler.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RecoveryPlan {
    /// Nobody is busy: a completion was lost. Restart the scheduler only.
    RestartScheduler,
    /// Replace these members, then restart the scheduler.
    ReplaceMembers(StuckMembers),
}

// ── RestartPolicy ──────────────────────────────────────────────────

/// Sliding-window restart budget.
#[derive(Debug)]
pub(crate) struct RestartPolicy {
    max_restarts: u32,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RestartPolicy {
    pub fn new(config: &WatchdogConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: config.restart_window(),
            history: VecDeque::new(),
        }
    }

    /// Admit a restart at `now` if the budget allows, recording it.
    pub fn admit(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.history.front() {
            if now.duration_since(oldest) >= self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }
        if self.history.len() >= self.max_restarts as usize {
            return false;
        }
        self.history.push_back(now);
        true
    }
}

// ── Supervisor ─────────────────────────────────────────────────────

pub(crate) struct Supervisor<P> {
    core: Arc<SchedulerCore<P>>,
    policy: Mutex<RestartPolicy>,
    in_flight: AtomicBool,
    lock_breakers: Mutex<Vec<Arc<dyn LockBreaker>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Particle> Supervisor<P> {
    pub fn new(core: Arc<SchedulerCore<P>>, config: &WatchdogConfig) -> Self {
        Self {
            core,
            policy: Mutex::new(RestartPolicy::new(config)),
            in_flight: AtomicBool::new(false),
            lock_breakers: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        }
    }

    fn breakers(&self) -> MutexGuard<'_, Vec<Arc<dyn LockBreaker>>> {
        self.lock_breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_lock_breaker(&self, breaker: Arc<dyn LockBreaker>) {
        self.breakers().push(breaker);
    }

    pub fn is_recovering(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Launch `plan` on a recovery thread. Returns `false` if a recovery
    /// is already running, the restart budget is spent, or the thread
    /// could not be spawned.
    pub fn recover(self: &Arc<Self>, plan: RecoveryPlan) -> bool {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            log::debug!("recovery already in progress; {plan:?} dropped");
            return false;
        }
        let admitted = self
            .policy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(Instant::now());
        if !admitted {
            log::error!("restart budget exhausted; recovery {plan:?} refused");
            self.core.health.record_refused_recovery();
            self.in_flight.store(false, Ordering::Release);
            return false;
        }

        let sup = Arc::clone(self);
        let spawned = spawn_named("plume-recovery".to_string(), move || {
            sup.execute(&plan);
            sup.in_flight.store(false, Ordering::Release);
        });
        match spawned {
            Ok(handle) => {
                let displaced = self
                    .handle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(handle);
                drop(displaced);
                true
            }
            Err(e) => {
                log::error!("could not start recovery: {e}");
                self.in_flight.store(false, Ordering::Release);
                false
            }
        }
    }

    fn execute(&self, plan: &RecoveryPlan) {
        if self.core.control().status == SimulationStatus::ShutDown {
            log::debug!("simulation shut down; recovery skipped");
            return;
        }
        let incarnation = self.core.supersede();
        log::warn!("recovery started: {plan:?} (scheduler incarnation {incarnation})");

        let mut replaced = 0usize;
        if let RecoveryPlan::ReplaceMembers(stuck) = plan {
            for member in stuck {
                let outcome = match member.token {
                    PhaseToken::Particle => self.core.particles.replace_member(member.slot),
                    PhaseToken::Sync => self.core.sync.replace_member(member.slot),
                };
                match outcome {
                    Ok(true) => replaced += 1,
                    Ok(false) => log::debug!(
                        "{} member {} not replaced: barrier closed",
                        member.token,
                        member.slot
                    ),
                    Err(e) => log::error!(
                        "could not replace {} member {}: {e}",
                        member.token,
                        member.slot
                    ),
                }
            }
        }
        if replaced > 0 {
            self.core.health.flag_consistency_risk();
        }

        let breakers: Vec<Arc<dyn LockBreaker>> = self.breakers().clone();
        for breaker in breakers {
            match panic::catch_unwind(AssertUnwindSafe(|| breaker.force_release())) {
                Ok(0) => {}
                Ok(n) => log::warn!("lock breaker {} released {n} locks", breaker.name()),
                Err(payload) => log::error!(
                    "lock breaker {} panicked: {}",
                    breaker.name(),
                    panic_message(&*payload)
                ),
            }
        }

        self.core.health.record_recovery();
        match self.core.resume() {
            Ok(()) => log::warn!("recovery finished: {replaced} members replaced"),
            Err(e) => log::error!("recovery could not restart the scheduler: {e}"),
        }
    }
}
