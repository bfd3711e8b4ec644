//! Reusable collaborator fixtures.
//!
//! - [`RecordingMover`]: moves every particle once per step, folding a
//!   random draw into its trace.
//! - [`FailingMover`]: errors (or panics) on one particle id.
//! - [`HangingMover`]: blocks on one particle until released, optionally
//!   honoring cooperative cancellation.
//! - [`RecordingListener`] / [`CountingSynchronizer`]: record lifecycle and
//!   sync-phase events.
//! - [`CountingLockBreaker`]: counts how often recovery asked it to act.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use plume_core::{
    FinishReason, LockBreaker, MoveContext, MoveError, ParticleStatus, PipeMover,
    SimulationListener, StepId, SurfaceMover, SyncContext, SyncError, Synchronizer,
};
use rand::RngCore;

use crate::TestParticle;

// ── PhaseLog ───────────────────────────────────────────────────────

/// One observed unit of work, tagged with the step it belonged to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseEvent {
    Move { step: u64 },
    Sync { step: u64 },
}

/// Shared, ordered record of moves and sync calls.
#[derive(Clone, Debug, Default)]
pub struct PhaseLog(Arc<Mutex<Vec<PhaseEvent>>>);

impl PhaseLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: PhaseEvent) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn events(&self) -> Vec<PhaseEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

// ── RecordingMover ─────────────────────────────────────────────────

/// Moves every particle it is handed and records the draw.
#[derive(Debug, Default)]
pub struct RecordingMover {
    moves: AtomicU64,
    complete_after: Option<u32>,
    log: Option<PhaseLog>,
}

impl RecordingMover {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark particles completed once they have moved `moves` times.
    pub fn completing_after(mut self, moves: u32) -> Self {
        self.complete_after = Some(moves);
        self
    }

    /// Record every move into `log`.
    pub fn logging_to(mut self, log: PhaseLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Total moves across all particles.
    pub fn total_moves(&self) -> u64 {
        self.moves.load(Ordering::SeqCst)
    }

    pub fn record(&self, p: &mut TestParticle, ctx: &mut MoveContext<'_>) {
        let draw = ctx.rng().next_u64();
        p.moves += 1;
        p.trace = p.trace.rotate_left(7) ^ draw ^ ctx.step().0;
        if self.complete_after.is_some_and(|n| p.moves >= n) {
            p.status = ParticleStatus::Completed;
        }
        self.moves.fetch_add(1, Ordering::SeqCst);
        if let Some(log) = &self.log {
            log.push(PhaseEvent::Move { step: ctx.step().0 });
        }
    }
}

impl PipeMover<TestParticle> for RecordingMover {
    fn move_particle(
        &self,
        p: &mut TestParticle,
        ctx: &mut MoveContext<'_>,
    ) -> Result<(), MoveError> {
        self.record(p, ctx);
        Ok(())
    }
}

impl SurfaceMover<TestParticle> for RecordingMover {
    fn move_particle(
        &self,
        p: &mut TestParticle,
        ctx: &mut MoveContext<'_>,
    ) -> Result<(), MoveError> {
        self.record(p, ctx);
        Ok(())
    }
}

// ── FailingMover ───────────────────────────────────────────────────

/// Like [`RecordingMover`], but fails every move of particle `fail_id`.
#[derive(Debug)]
pub struct FailingMover {
    fail_id: usize,
    panic: bool,
    failures: AtomicU64,
    inner: RecordingMover,
}

impl FailingMover {
    /// Return an error for `fail_id`.
    pub fn erroring_on(fail_id: usize) -> Self {
        Self {
            fail_id,
            panic: false,
            failures: AtomicU64::new(0),
            inner: RecordingMover::new(),
        }
    }

    /// Panic on `fail_id`.
    pub fn panicking_on(fail_id: usize) -> Self {
        Self {
            panic: true,
            ..Self::erroring_on(fail_id)
        }
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn total_moves(&self) -> u64 {
        self.inner.total_moves()
    }

    fn step(&self, p: &mut TestParticle, ctx: &mut MoveContext<'_>) -> Result<(), MoveError> {
        if p.id == self.fail_id {
            self.failures.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("injected panic on particle {}", p.id);
            }
            return Err(MoveError::ExecutionFailed {
                reason: format!("injected failure on particle {}", p.id),
            });
        }
        self.inner.record(p, ctx);
        Ok(())
    }
}

impl PipeMover<TestParticle> for FailingMover {
    fn move_particle(
        &self,
        p: &mut TestParticle,
        ctx: &mut MoveContext<'_>,
    ) -> Result<(), MoveError> {
        self.step(p, ctx)
    }
}

impl SurfaceMover<TestParticle> for FailingMover {
    fn move_particle(
        &self,
        p: &mut TestParticle,
        ctx: &mut MoveContext<'_>,
    ) -> Result<(), MoveError> {
        self.step(p, ctx)
    }
}

// ── HangingMover ───────────────────────────────────────────────────

/// Blocks the first time it sees particle `target`, until [`release`]
/// is called (or, if `cancel_aware`, until the engine requests
/// cancellation, in which case the move fails with `Cancelled`).
///
/// [`release`]: HangingMover::release
#[derive(Debug)]
pub struct HangingMover {
    target: usize,
    cancel_aware: bool,
    fired: AtomicBool,
    entered: AtomicBool,
    released: AtomicBool,
    cancelled: AtomicBool,
    inner: RecordingMover,
}

impl HangingMover {
    pub fn new(target: usize, cancel_aware: bool) -> Self {
        Self {
            target,
            cancel_aware,
            fired: AtomicBool::new(false),
            entered: AtomicBool::new(false),
            released: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            inner: RecordingMover::new(),
        }
    }

    /// Whether a worker is (or was) blocked on the target.
    pub fn entered(&self) -> bool {
        self.entered.load(Ordering::SeqCst)
    }

    /// Whether the hang ended through cooperative cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Let the blocked worker go.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub fn total_moves(&self) -> u64 {
        self.inner.total_moves()
    }

    fn step(&self, p: &mut TestParticle, ctx: &mut MoveContext<'_>) -> Result<(), MoveError> {
        if p.id == self.target && !self.fired.swap(true, Ordering::SeqCst) {
            self.entered.store(true, Ordering::SeqCst);
            while !self.released.load(Ordering::SeqCst) {
                if self.cancel_aware && ctx.is_cancelled() {
                    self.cancelled.store(true, Ordering::SeqCst);
                    return Err(MoveError::Cancelled);
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.inner.record(p, ctx);
        Ok(())
    }
}

impl PipeMover<TestParticle> for HangingMover {
    fn move_particle(
        &self,
        p: &mut TestParticle,
        ctx: &mut MoveContext<'_>,
    ) -> Result<(), MoveError> {
        self.step(p, ctx)
    }
}

impl SurfaceMover<TestParticle> for HangingMover {
    fn move_particle(
        &self,
        p: &mut TestParticle,
        ctx: &mut MoveContext<'_>,
    ) -> Result<(), MoveError> {
        self.step(p, ctx)
    }
}

// ── RecordingListener ──────────────────────────────────────────────

/// Lifecycle event seen by a [`RecordingListener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerEvent {
    Start,
    StepFinished(StepId),
    Reset,
    Finish(FinishReason),
}

/// Shared record of listener events.
#[derive(Clone, Debug, Default)]
pub struct EventLog(Arc<Mutex<Vec<ListenerEvent>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Step ids reported finished, in order.
    pub fn steps(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ListenerEvent::StepFinished(s) => Some(s.0),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ListenerEvent) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Appends every callback to an [`EventLog`].
#[derive(Debug)]
pub struct RecordingListener {
    log: EventLog,
}

impl RecordingListener {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl SimulationListener for RecordingListener {
    fn on_start(&mut self) {
        self.log.push(ListenerEvent::Start);
    }

    fn on_step_finished(&mut self, step: StepId) {
        self.log.push(ListenerEvent::StepFinished(step));
    }

    fn on_reset(&mut self) {
        self.log.push(ListenerEvent::Reset);
    }

    fn on_finish(&mut self, reason: FinishReason) {
        self.log.push(ListenerEvent::Finish(reason));
    }
}

// ── CountingSynchronizer ───────────────────────────────────────────

/// Counts sync calls, measuring calls and resets through shared
/// counters the test keeps a handle to.
#[derive(Clone, Debug, Default)]
pub struct CountingSynchronizer {
    pub calls: Arc<AtomicU64>,
    pub measured: Arc<AtomicU64>,
    pub resets: Arc<AtomicU64>,
    log: Option<PhaseLog>,
}

impl CountingSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every sync call into `log`.
    pub fn logging_to(mut self, log: PhaseLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn measured(&self) -> u64 {
        self.measured.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }
}

impl Synchronizer for CountingSynchronizer {
    fn synchronize(&mut self, ctx: &SyncContext<'_>) -> Result<(), SyncError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.measuring() {
            self.measured.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(log) = &self.log {
            log.push(PhaseEvent::Sync { step: ctx.step().0 });
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

// ── CountingLockBreaker ────────────────────────────────────────────

/// Pretends to hold `held` locks and counts `force_release` calls.
#[derive(Debug, Default)]
pub struct CountingLockBreaker {
    held: usize,
    calls: AtomicU64,
}

impl CountingLockBreaker {
    pub fn new(held: usize) -> Self {
        Self {
            held,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LockBreaker for CountingLockBreaker {
    fn name(&self) -> &str {
        "counting"
    }

    fn force_release(&self) -> usize {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.held
    }
}
