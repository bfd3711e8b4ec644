//! The phase scheduler thread.
//!
//! A single dedicated thread serializes every phase transition. It blocks
//! on the crossbeam mailbox that both barriers post into and, per message:
//!
//! - `Finished(Particle, g)`: arm the sync barrier with the same window.
//! - `Finished(Sync, g)`: close the step (advance the clock, bump the step
//!   counter, record metrics), fire step listeners, then finish, pause, or
//!   arm the next particle phase.
//! - `Start`: begin or resume a run once both barriers are ready.
//! - `Resync`: after recovery restarted the scheduler, re-derive progress
//!   from the gates' completed generations.
//!
//! The thread is identified by an incarnation number. Recovery bumps it
//! and spawns a fresh thread; a superseded thread hands back whatever
//! message it dequeued and leaves. A thread superseded while handling a
//! message never arms a phase or reports the finish: its replacement does.
//!
//! The scheduler publishes a [`Heartbeat`] that is busy for as long as it
//! handles a message (listener calls included), so the watchdog can tell
//! a slow listener from a lost completion.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use plume_core::{
    FinishReason, Particle, ParticlePool, SimTime, SimulationListener, StepId, StepWindow,
};

use crate::allocator::BatchAllocator;
use crate::barrier::{spawn_named, Barrier, ParticleBarrier};
use crate::clock::Clock;
use crate::config::ConfigError;
use crate::gate::{PhaseToken, SchedulerMsg};
use crate::heartbeat::{Heartbeat, MemberState};
use crate::metrics::{RunHealth, StepMetrics};
use crate::simulation::{Diagnostics, SimulationStatus};
use crate::sync::SyncBarrier;
use crate::worker::panic_message;

/// Where the step currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Particle { generation: u64 },
    Sync { generation: u64 },
}

struct SchedulerState {
    clock: Clock,
    phase: Phase,
    particle_ready: bool,
    sync_ready: bool,
    start_pending: bool,
    step_started: Option<Instant>,
    sync_started: Option<Instant>,
    particle_us: u64,
    blocks_issued: u64,
    particles_assigned: u64,
    last_metrics: Option<StepMetrics>,
    last_finished: Option<PhaseToken>,
    /// Set when a completed step ends the run.
    outcome: Option<FinishReason>,
    /// Whether listeners have been told about `outcome`.
    finish_reported: bool,
}

/// Run status plus the pending stop request, guarded together so that
/// `stop()` and the pause check cannot interleave.
pub(crate) struct ControlState {
    pub status: SimulationStatus,
    pub stop_requested: bool,
}

/// Everything the scheduler thread (and its replacements) share with the
/// simulation handle, the watchdog and recovery.
pub(crate) struct SchedulerCore<P> {
    state: Mutex<SchedulerState>,
    control: Mutex<ControlState>,
    control_changed: Condvar,
    listeners: Mutex<Vec<Box<dyn SimulationListener>>>,
    pub particles: Arc<ParticleBarrier<P>>,
    pub sync: Arc<SyncBarrier>,
    pub allocator: Arc<BatchAllocator>,
    pub pool: Arc<ParticlePool<P>>,
    pub health: Arc<RunHealth>,
    beat: Heartbeat,
    steps: AtomicU64,
    incarnation: AtomicU64,
    end_time: SimTime,
    stop_on_completion: bool,
    tx: Sender<SchedulerMsg>,
    rx: Receiver<SchedulerMsg>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Construction parameters for [`SchedulerCore`].
pub(crate) struct CoreParts<P> {
    pub clock: Clock,
    pub particles: Arc<ParticleBarrier<P>>,
    pub sync: Arc<SyncBarrier>,
    pub allocator: Arc<BatchAllocator>,
    pub pool: Arc<ParticlePool<P>>,
    pub health: Arc<RunHealth>,
    pub end_time: SimTime,
    pub stop_on_completion: bool,
    pub tx: Sender<SchedulerMsg>,
    pub rx: Receiver<SchedulerMsg>,
}

impl<P: Particle> SchedulerCore<P> {
    pub fn new(parts: CoreParts<P>) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                clock: parts.clock,
                phase: Phase::Idle,
                particle_ready: false,
                sync_ready: false,
                start_pending: false,
                step_started: None,
                sync_started: None,
                particle_us: 0,
                blocks_issued: 0,
                particles_assigned: 0,
                last_metrics: None,
                last_finished: None,
                outcome: None,
                finish_reported: false,
            }),
            control: Mutex::new(ControlState {
                status: SimulationStatus::Ready,
                stop_requested: false,
            }),
            control_changed: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
            particles: parts.particles,
            sync: parts.sync,
            allocator: parts.allocator,
            pool: parts.pool,
            health: parts.health,
            beat: Heartbeat::new(0),
            steps: AtomicU64::new(0),
            incarnation: AtomicU64::new(0),
            end_time: parts.end_time,
            stop_on_completion: parts.stop_on_completion,
            tx: parts.tx,
            rx: parts.rx,
            handle: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn control(&self) -> MutexGuard<'_, ControlState> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify_control(&self) {
        self.control_changed.notify_all();
    }

    /// Block until `done` holds for the control state or `timeout`
    /// elapses. Returns the final status and whether `done` held.
    pub fn wait_control(
        &self,
        timeout: Duration,
        mut done: impl FnMut(&ControlState) -> bool,
    ) -> (SimulationStatus, bool) {
        let deadline = Instant::now() + timeout;
        let mut ctl = self.control();
        loop {
            if done(&ctl) {
                return (ctl.status, true);
            }
            let now = Instant::now();
            if now >= deadline {
                return (ctl.status, false);
            }
            ctl = self
                .control_changed
                .wait_timeout(ctl, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn send(&self, msg: SchedulerMsg) {
        let _ = self.tx.send(msg);
    }

    /// Liveness of the current scheduler thread.
    pub fn heartbeat(&self) -> &Heartbeat {
        &self.beat
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Acquire)
    }

    pub fn window(&self) -> StepWindow {
        self.state().clock.window()
    }

    pub fn last_metrics(&self) -> Option<StepMetrics> {
        self.state().last_metrics.clone()
    }

    pub fn add_listener(&self, listener: Box<dyn SimulationListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Invoke `event` on every listener. A panicking listener is logged
    /// and skipped.
    pub fn fire(&self, mut event: impl FnMut(&mut dyn SimulationListener)) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter_mut() {
            let call = panic::catch_unwind(AssertUnwindSafe(|| event(listener.as_mut())));
            if let Err(payload) = call {
                log::error!("simulation listener panicked: {}", panic_message(&*payload));
            }
        }
    }

    /// Like [`fire`](Self::fire), but gives up if the listeners are held
    /// by a wedged scheduler thread. Returns whether the event was fired.
    pub fn try_fire(&self, mut event: impl FnMut(&mut dyn SimulationListener)) -> bool {
        let mut listeners = match self.listeners.try_lock() {
            Ok(l) => l,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        for listener in listeners.iter_mut() {
            let call = panic::catch_unwind(AssertUnwindSafe(|| event(listener.as_mut())));
            if let Err(payload) = call {
                log::error!("simulation listener panicked: {}", panic_message(&*payload));
            }
        }
        true
    }

    /// Take the right to report how this run ended. Only the first
    /// caller per run gets `true`.
    pub fn claim_finish(&self) -> bool {
        let mut st = self.state();
        !std::mem::replace(&mut st.finish_reported, true)
    }

    /// Change delta-time for the pending window.
    pub fn set_dt(&self, dt_seconds: f64) -> Result<(), ConfigError> {
        let mut st = self.state();
        st.clock.set_dt(dt_seconds)?;
        log::info!("delta-time set to {}ms", st.clock.dt_ms());
        Ok(())
    }

    /// Back to step zero. Only called while no phase is running.
    pub fn reset_run(&self) {
        let mut st = self.state();
        st.clock.reset();
        st.phase = Phase::Idle;
        st.start_pending = false;
        st.step_started = None;
        st.sync_started = None;
        st.particle_us = 0;
        st.blocks_issued = 0;
        st.particles_assigned = 0;
        st.last_metrics = None;
        st.last_finished = None;
        st.outcome = None;
        st.finish_reported = false;
        self.steps.store(0, Ordering::Release);
    }

    pub fn diagnostics(&self) -> Diagnostics {
        let (window, last_finished, phase) = {
            let st = self.state();
            (st.clock.window(), st.last_finished, st.phase)
        };
        Diagnostics {
            status: self.control().status,
            steps: self.steps(),
            window,
            in_phase: match phase {
                Phase::Idle => None,
                Phase::Particle { .. } => Some(PhaseToken::Particle),
                Phase::Sync { .. } => Some(PhaseToken::Sync),
            },
            last_finished,
            scheduler_thread: self.beat.snapshot(),
            workers: self.particles.heartbeat_snapshots(),
            sync_thread: self.sync.heartbeat_snapshots(),
            particle_gate: self.particles.snapshot(),
            sync_gate: self.sync.snapshot(),
            health: self.health.snapshot(),
        }
    }

    // ── Thread management ────────────────────────────────────────

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::Acquire)
    }

    fn is_stale(&self, me: u64) -> bool {
        self.incarnation() != me
    }

    /// Spawn the scheduler thread for the current incarnation. A handle
    /// it displaces belongs to a superseded thread and is detached.
    pub fn spawn(self: &Arc<Self>) -> Result<(), ConfigError> {
        let me = self.incarnation();
        let core = Arc::clone(self);
        let handle = spawn_named("plume-scheduler".to_string(), move || core.run(me))?;
        let displaced = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        drop(displaced);
        Ok(())
    }

    /// Stop the running scheduler thread from acting on anything further.
    /// It leaves the next time it wakes. Returns the new incarnation.
    pub fn supersede(&self) -> u64 {
        self.incarnation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Spawn a scheduler for the current incarnation and make it
    /// resynchronize with the gates.
    pub fn resume(self: &Arc<Self>) -> Result<(), ConfigError> {
        self.spawn()?;
        self.send(SchedulerMsg::Resync);
        log::info!("scheduler restarted (incarnation {})", self.incarnation());
        Ok(())
    }

    pub fn take_handle(&self) -> Option<JoinHandle<()>> {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn run(self: Arc<Self>, me: u64) {
        log::debug!("scheduler thread started (incarnation {me})");
        self.beat.set_incarnation(me);
        self.beat.set_state(MemberState::Waiting);
        while let Ok(msg) = self.rx.recv() {
            if self.is_stale(me) {
                self.send(msg);
                break;
            }
            if msg == SchedulerMsg::Shutdown {
                // Re-post for any other scheduler thread still blocked on
                // the mailbox.
                self.send(SchedulerMsg::Shutdown);
                break;
            }
            self.beat.begin_block();
            self.handle(msg, me);
            self.beat.record_progress();
            if !self.is_stale(me) {
                self.beat.set_state(MemberState::Waiting);
            }
        }
        if !self.is_stale(me) {
            self.beat.set_state(MemberState::Exited);
        }
        log::debug!("scheduler thread exiting (incarnation {me})");
    }

    fn handle(&self, msg: SchedulerMsg, me: u64) {
        match msg {
            SchedulerMsg::Shutdown => {}
            SchedulerMsg::Ready(token) => self.on_ready(token, me),
            SchedulerMsg::Start => self.on_start(me),
            SchedulerMsg::Finished { token, generation } => {
                self.on_finished(token, generation, me)
            }
            SchedulerMsg::Resync => self.on_resync(me),
        }
    }

    // ── Message handlers ─────────────────────────────────────────

    fn on_ready(&self, token: PhaseToken, me: u64) {
        let begin = {
            let mut st = self.state();
            match token {
                PhaseToken::Particle => st.particle_ready = true,
                PhaseToken::Sync => st.sync_ready = true,
            }
            log::debug!("{token} barrier reported ready");
            st.start_pending && st.particle_ready && st.sync_ready
        };
        if begin {
            self.on_start(me);
        }
    }

    fn on_start(&self, me: u64) {
        {
            let mut st = self.state();
            if !(st.particle_ready && st.sync_ready) {
                st.start_pending = true;
                return;
            }
            st.start_pending = false;
            if st.phase != Phase::Idle {
                return;
            }
        }
        if self.pause_if_requested() {
            return;
        }
        log::info!("simulation running from step {}", self.steps());
        self.fire(|l| l.on_start());
        self.arm_particle_phase(me);
    }

    fn on_finished(&self, token: PhaseToken, generation: u64, me: u64) {
        match token {
            PhaseToken::Particle => self.particle_finished(generation),
            PhaseToken::Sync => self.sync_finished(generation, me),
        }
    }

    fn particle_finished(&self, generation: u64) {
        let mut st = self.state();
        if st.phase != (Phase::Particle { generation }) {
            log::debug!("ignoring stale particle completion (generation {generation})");
            return;
        }
        st.last_finished = Some(PhaseToken::Particle);
        st.particle_us = elapsed_us(st.step_started);
        let (blocks, assigned) = self.allocator.phase_counters();
        st.blocks_issued = blocks;
        st.particles_assigned = assigned;

        let window = st.clock.window();
        let step = StepId(self.steps());
        st.sync_started = Some(Instant::now());
        st.phase = match self.sync.arm(window, step) {
            Some(generation) => {
                log::debug!("step {step}: sync phase armed (generation {generation})");
                Phase::Sync { generation }
            }
            None => {
                log::debug!("step {step}: sync barrier closed");
                Phase::Idle
            }
        };
    }

    fn sync_finished(&self, generation: u64, me: u64) {
        let (step, reason) = {
            let mut st = self.state();
            if st.phase != (Phase::Sync { generation }) {
                log::debug!("ignoring stale sync completion (generation {generation})");
                return;
            }
            st.last_finished = Some(PhaseToken::Sync);
            st.phase = Phase::Idle;

            let step = StepId(self.steps());
            let metrics = StepMetrics {
                step,
                particle_phase_us: st.particle_us,
                sync_phase_us: elapsed_us(st.sync_started),
                total_us: elapsed_us(st.step_started),
                blocks_issued: st.blocks_issued,
                particles_assigned: st.particles_assigned,
            };
            let advanced = st.clock.advance();
            self.steps.fetch_add(1, Ordering::AcqRel);
            log::debug!(
                "step {step} finished: {} blocks, {} particles, {}us",
                metrics.blocks_issued,
                metrics.particles_assigned,
                metrics.total_us
            );
            st.last_metrics = Some(metrics);

            // Recorded before listeners run; a resyncing replacement reads it.
            let reason = if !advanced || st.clock.window().start() >= self.end_time {
                Some(FinishReason::EndTimeReached)
            } else if self.stop_on_completion && self.pool.all_completed() {
                Some(FinishReason::AllParticlesCompleted)
            } else {
                None
            };
            st.outcome = reason;
            (step, reason)
        };

        self.fire(|l| l.on_step_finished(step));
        if self.is_stale(me) {
            log::debug!(
                "scheduler {me} superseded during step {step}; its replacement continues the run"
            );
            return;
        }
        if let Some(reason) = reason {
            self.finish(reason);
            return;
        }
        if self.pause_if_requested() {
            return;
        }
        self.arm_particle_phase(me);
    }

    fn on_resync(&self, me: u64) {
        let phase = self.state().phase;
        log::info!("scheduler resynchronizing from {phase:?}");
        match phase {
            Phase::Particle { generation }
                if self.particles.gate().completed_generation() >= generation =>
            {
                self.particle_finished(generation);
            }
            Phase::Sync { generation } if self.sync.gate().completed_generation() >= generation => {
                self.sync_finished(generation, me);
            }
            Phase::Idle => {
                // The previous thread stopped between two phases.
                let outcome = self.state().outcome;
                if let Some(reason) = outcome {
                    self.finish(reason);
                    return;
                }
                let running = self.control().status == SimulationStatus::Running;
                if running && !self.pause_if_requested() {
                    self.arm_particle_phase(me);
                }
            }
            _ => log::debug!("resync: {phase:?} still in progress"),
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Arm the next particle phase. Only an idle, undecided step of a
    /// current scheduler is armed, so two threads racing through a
    /// restart arm it once.
    fn arm_particle_phase(&self, me: u64) {
        let mut st = self.state();
        if self.is_stale(me) || st.phase != Phase::Idle || st.outcome.is_some() {
            return;
        }
        let window = st.clock.window();
        let step = StepId(self.steps());
        self.allocator.reset_cursor();
        let boundary = self
            .allocator
            .advance_releasable_boundary(self.pool.insertion_times(), window.start());
        st.step_started = Some(Instant::now());
        st.phase = match self.particles.arm(window, step) {
            Some(generation) => {
                log::debug!(
                    "step {step}: particle phase armed for {window} with {boundary} released (generation {generation})"
                );
                Phase::Particle { generation }
            }
            None => {
                log::debug!("step {step}: particle barrier closed");
                Phase::Idle
            }
        };
    }

    /// Honor a pending `stop()`. Returns `true` if the run paused.
    fn pause_if_requested(&self) -> bool {
        let mut ctl = self.control();
        if !ctl.stop_requested {
            return false;
        }
        ctl.stop_requested = false;
        if ctl.status == SimulationStatus::Running {
            ctl.status = SimulationStatus::Paused;
        }
        self.allocator.thaw();
        self.control_changed.notify_all();
        drop(ctl);
        log::info!("simulation paused after {} steps", self.steps());
        true
    }

    /// Report the outcome to listeners (once per run), then publish it.
    fn finish(&self, reason: FinishReason) {
        if !self.claim_finish() {
            return;
        }
        self.fire(|l| l.on_finish(reason));
        let mut ctl = self.control();
        ctl.stop_requested = false;
        if matches!(
            ctl.status,
            SimulationStatus::Running | SimulationStatus::Paused
        ) {
            ctl.status = SimulationStatus::Finished(reason);
        }
        self.allocator.thaw();
        self.control_changed.notify_all();
        drop(ctl);
        log::info!("simulation finished after {} steps: {reason}", self.steps());
    }
}

fn elapsed_us(since: Option<Instant>) -> u64 {
    since.map_or(0, |t| t.elapsed().as_micros() as u64)
}
