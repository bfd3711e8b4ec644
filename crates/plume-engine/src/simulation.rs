//! The user-facing simulation handle.
//!
//! [`Simulation`] owns every thread of a run: N particle workers, the
//! sync thread, the scheduler and (optionally) the watchdog. Construction
//! spawns them all and waits until both barriers are ready; from then on
//! the handle only sends control messages and reads shared state.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──> Ready ──start()──> Running ──stop()──> Paused ──start()──> Running
//!                                 │
//!                                 └── end time / all completed ──> Finished
//!
//! reset(): any state except ShutDown ──> Ready
//! shutdown() / Drop: ──> ShutDown
//! ```

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use plume_core::{
    FinishReason, LockBreaker, Particle, ParticlePool, Physics, SimulationListener, StepWindow,
    Synchronizer,
};

use crate::allocator::BatchAllocator;
use crate::barrier::{Barrier, ParticleBarrier};
use crate::clock::Clock;
use crate::config::{ConfigError, ControlError, SimulationConfig};
use crate::gate::{GateSnapshot, PhaseGate, PhaseToken, SchedulerMsg};
use crate::heartbeat::{Heartbeat, HeartbeatSnapshot};
use crate::metrics::{RunHealth, SimulationHealth, StepMetrics};
use crate::recovery::Supervisor;
use crate::scheduler::{CoreParts, SchedulerCore};
use crate::sync::SyncBarrier;
use crate::watchdog::{spawn_watchdog, Watchdog};
use crate::worker::WorkerContext;

/// Budget for joining threads during shutdown; stragglers are detached.
const SHUTDOWN_JOIN_BUDGET: Duration = Duration::from_secs(2);

/// How long `reset()` waits for a running step to reach its pause point.
const RESET_PAUSE_TIMEOUT: Duration = Duration::from_secs(30);

// ── SimulationStatus ─────────────────────────────────────────────

/// Run status of a [`Simulation`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimulationStatus {
    /// Constructed or reset; not started.
    Ready,
    /// Steps are being executed.
    Running,
    /// Stopped between two steps; `start()` resumes.
    Paused,
    /// The run ended; `reset()` before starting again.
    Finished(FinishReason),
    /// Threads are gone; every control call fails.
    ShutDown,
}

impl fmt::Display for SimulationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Finished(reason) => write!(f, "finished ({reason})"),
            Self::ShutDown => write!(f, "shut down"),
        }
    }
}

// ── Diagnostics ──────────────────────────────────────────────────

/// Point-in-time view of every thread and barrier, as dumped by the
/// watchdog when a run stops making progress.
#[derive(Clone, Debug)]
pub struct Diagnostics {
    /// Run status.
    pub status: SimulationStatus,
    /// Completed steps.
    pub steps: u64,
    /// Window of the current (or next) step.
    pub window: StepWindow,
    /// Phase the scheduler is waiting on, if any.
    pub in_phase: Option<PhaseToken>,
    /// Barrier that reported completion most recently.
    pub last_finished: Option<PhaseToken>,
    /// Scheduler thread heartbeat.
    pub scheduler_thread: HeartbeatSnapshot,
    /// Particle worker heartbeats, by slot.
    pub workers: Vec<HeartbeatSnapshot>,
    /// Sync thread heartbeat.
    pub sync_thread: Vec<HeartbeatSnapshot>,
    /// Particle barrier state.
    pub particle_gate: GateSnapshot,
    /// Sync barrier state.
    pub sync_gate: GateSnapshot,
    /// Health counters.
    pub health: SimulationHealth,
}

fn token_name(token: Option<PhaseToken>) -> String {
    token.map_or_else(|| "none".to_string(), |t| t.to_string())
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "simulation {} after {} steps, window {}",
            self.status, self.steps, self.window
        )?;
        writeln!(
            f,
            "  waiting on: {}, last finished: {}",
            token_name(self.in_phase),
            token_name(self.last_finished)
        )?;
        writeln!(f, "  scheduler {}", self.scheduler_thread)?;
        writeln!(f, "  {}", self.particle_gate)?;
        writeln!(f, "  {}", self.sync_gate)?;
        for hb in &self.workers {
            writeln!(f, "  worker {hb}")?;
        }
        for hb in &self.sync_thread {
            writeln!(f, "  sync {hb}")?;
        }
        let h = &self.health;
        write!(
            f,
            "  health: risk={} block_failures={} sync_failures={} quarantined={} recoveries={} refused={}",
            h.consistency_risk,
            h.block_failures,
            h.sync_failures,
            h.quarantined_particles,
            h.recoveries,
            h.recoveries_refused
        )
    }
}

// ── ShutdownReport ───────────────────────────────────────────────

/// Report from [`Simulation::shutdown`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Total time spent in the shutdown sequence.
    pub total_ms: u64,
    /// Whether the scheduler thread was joined.
    pub scheduler_joined: bool,
    /// Number of particle worker threads joined.
    pub workers_joined: usize,
    /// Whether the sync thread was joined.
    pub sync_joined: bool,
    /// Whether the watchdog thread was joined (true if it never ran).
    pub watchdog_joined: bool,
    /// Threads still running at the deadline, left detached.
    pub detached: usize,
}

// ── Simulation ───────────────────────────────────────────────────

/// A particle-transport run and all of its threads.
pub struct Simulation<P: Particle> {
    core: Arc<SchedulerCore<P>>,
    supervisor: Arc<Supervisor<P>>,
    watchdog: Option<(Sender<()>, JoinHandle<()>)>,
    worker_count: usize,
    shut_down: bool,
}

impl<P: Particle> Simulation<P> {
    /// Validate `config`, spawn every thread and wait until both barriers
    /// are ready.
    pub fn new(
        config: SimulationConfig,
        pool: Arc<ParticlePool<P>>,
        physics: Physics<P>,
        synchronizer: Box<dyn Synchronizer>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let worker_count = config.resolved_worker_count();
        let clock = Clock::new(config.start_time(), config.dt_seconds)?;
        let allocator = Arc::new(BatchAllocator::new(
            pool.len(),
            config.block_size,
            config.seed,
        )?);
        let health = Arc::new(RunHealth::default());

        // Unbounded: gates post while holding their lock.
        let (tx, rx) = crossbeam_channel::unbounded();

        let heartbeats: Arc<[Heartbeat]> = (0..worker_count as u32)
            .map(Heartbeat::new)
            .collect::<Vec<_>>()
            .into();
        let particles = Arc::new(ParticleBarrier::new(WorkerContext {
            pool: Arc::clone(&pool),
            allocator: Arc::clone(&allocator),
            physics,
            gate: Arc::new(PhaseGate::new(
                PhaseToken::Particle,
                worker_count,
                tx.clone(),
            )),
            heartbeats,
            health: Arc::clone(&health),
        }));
        let sync = Arc::new(SyncBarrier::new(
            Arc::new(PhaseGate::new(PhaseToken::Sync, 1, tx.clone())),
            synchronizer,
            config.measurement_window,
            Arc::clone(&health),
        ));

        let core = Arc::new(SchedulerCore::new(CoreParts {
            clock,
            particles,
            sync,
            allocator,
            pool,
            health,
            end_time: config.end_time(),
            stop_on_completion: config.stop_on_completion,
            tx,
            rx,
        }));
        let supervisor = Arc::new(Supervisor::new(Arc::clone(&core), &config.watchdog));

        // From here on, an early return drops `sim`, which shuts down
        // whatever was already spawned.
        let mut sim = Self {
            core,
            supervisor,
            watchdog: None,
            worker_count,
            shut_down: false,
        };
        sim.core.particles.initialize(config.init_timeout())?;
        sim.core.sync.initialize(config.init_timeout())?;
        sim.core.spawn()?;
        if config.watchdog.enabled {
            let watchdog = Watchdog::new(Arc::clone(&sim.core), Arc::clone(&sim.supervisor));
            sim.watchdog = Some(spawn_watchdog(watchdog, config.watchdog.poll_interval())?);
        }

        log::info!(
            "simulation ready: {} workers, {} particles, block size {}, {} streams",
            worker_count,
            sim.core.pool.len(),
            sim.core.allocator.block_size(),
            sim.core.allocator.stream_count()
        );
        Ok(sim)
    }

    // ── Control ──────────────────────────────────────────────────

    /// Start the run, or resume it after [`stop`](Self::stop).
    pub fn start(&self) -> Result<(), ControlError> {
        let mut ctl = self.core.control();
        match ctl.status {
            SimulationStatus::ShutDown => Err(ControlError::ShutDown),
            SimulationStatus::Finished(reason) => Err(ControlError::Finished(reason)),
            SimulationStatus::Running => {
                // Withdraw a stop that has not taken effect yet.
                ctl.stop_requested = false;
                Ok(())
            }
            SimulationStatus::Ready | SimulationStatus::Paused => {
                ctl.status = SimulationStatus::Running;
                ctl.stop_requested = false;
                self.core.allocator.freeze();
                drop(ctl);
                self.core.notify_control();
                self.core.send(SchedulerMsg::Start);
                log::info!("simulation started at step {}", self.core.steps());
                Ok(())
            }
        }
    }

    /// Ask the run to pause before its next step. The step in flight
    /// completes first; use [`wait_idle`](Self::wait_idle) to wait for it.
    pub fn stop(&self) -> Result<(), ControlError> {
        let mut ctl = self.core.control();
        match ctl.status {
            SimulationStatus::ShutDown => Err(ControlError::ShutDown),
            SimulationStatus::Running => {
                ctl.stop_requested = true;
                log::info!("stop requested at step {}", self.core.steps());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Block until the simulation is not running, or `timeout` elapses.
    /// Returns `true` if it is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.core
            .wait_control(timeout, |c| c.status != SimulationStatus::Running)
            .1
    }

    /// Block until the run finishes, or `timeout` elapses.
    pub fn wait_finished(&self, timeout: Duration) -> Option<FinishReason> {
        let (status, done) = self.core.wait_control(timeout, |c| {
            matches!(
                c.status,
                SimulationStatus::Finished(_) | SimulationStatus::ShutDown
            )
        });
        match (status, done) {
            (SimulationStatus::Finished(reason), true) => Some(reason),
            (SimulationStatus::ShutDown, true) => Some(FinishReason::Shutdown),
            _ => None,
        }
    }

    /// Return to step zero: particles, allocator, random streams, clock,
    /// synchronizer and per-run health. A running simulation is stopped
    /// first. Listeners get `on_reset` on the calling thread.
    pub fn reset(&self) -> Result<(), ControlError> {
        match self.status() {
            SimulationStatus::ShutDown => return Err(ControlError::ShutDown),
            SimulationStatus::Running => {
                self.stop()?;
                if !self.wait_idle(RESET_PAUSE_TIMEOUT) {
                    return Err(ControlError::Busy);
                }
            }
            _ => {}
        }

        let mut ctl = self.core.control();
        match ctl.status {
            SimulationStatus::ShutDown => return Err(ControlError::ShutDown),
            SimulationStatus::Running => return Err(ControlError::Busy),
            _ => {}
        }
        self.core.health.clear_run();
        let busy = self.core.pool.reset();
        if !busy.is_empty() {
            log::warn!(
                "{} particles held by wedged threads were not reset",
                busy.len()
            );
            self.core.health.flag_consistency_risk();
        }
        self.core.allocator.reset();
        self.core.reset_run();
        if !self.core.sync.reset_synchronizer() {
            self.core.health.flag_consistency_risk();
        }
        ctl.status = SimulationStatus::Ready;
        ctl.stop_requested = false;
        drop(ctl);
        self.core.notify_control();

        self.core.fire(|l| l.on_reset());
        log::info!("simulation reset");
        Ok(())
    }

    // ── Reconfiguration ──────────────────────────────────────────

    /// Change the block size (regenerates the random streams).
    pub fn set_block_size(&self, block_size: usize) -> Result<(), ConfigError> {
        let ctl = self.core.control();
        if ctl.status == SimulationStatus::Running {
            return Err(ConfigError::Running);
        }
        self.core.allocator.configure_block_size(block_size)?;
        log::info!("block size set to {block_size}");
        Ok(())
    }

    /// Change the global seed (regenerates the random streams).
    pub fn set_seed(&self, seed: u64) -> Result<(), ConfigError> {
        let ctl = self.core.control();
        if ctl.status == SimulationStatus::Running {
            return Err(ConfigError::Running);
        }
        self.core.allocator.reseed(seed)?;
        log::info!("seed set to {seed}");
        Ok(())
    }

    /// Change delta-time. The next step keeps its start time.
    pub fn set_dt(&self, dt_seconds: f64) -> Result<(), ConfigError> {
        let ctl = self.core.control();
        if ctl.status == SimulationStatus::Running {
            return Err(ConfigError::Running);
        }
        self.core.set_dt(dt_seconds)
    }

    /// Register a listener for start, step, reset and finish events.
    pub fn add_listener(&self, listener: Box<dyn SimulationListener>) {
        self.core.add_listener(listener);
    }

    /// Register a lock breaker for recovery to call.
    pub fn add_lock_breaker(&self, breaker: Arc<dyn LockBreaker>) {
        self.supervisor.add_lock_breaker(breaker);
    }

    // ── Inspection ───────────────────────────────────────────────

    /// Current run status.
    pub fn status(&self) -> SimulationStatus {
        self.core.control().status
    }

    /// Number of completed steps.
    pub fn step_count(&self) -> u64 {
        self.core.steps()
    }

    /// Window of the current (or next) step.
    pub fn window(&self) -> StepWindow {
        self.core.window()
    }

    /// Metrics of the most recently completed step.
    pub fn last_metrics(&self) -> Option<StepMetrics> {
        self.core.last_metrics()
    }

    /// Health counters of the current run.
    pub fn health(&self) -> SimulationHealth {
        self.core.health.snapshot()
    }

    /// Snapshot of every thread and barrier.
    pub fn diagnostics(&self) -> Diagnostics {
        self.core.diagnostics()
    }

    /// The particle pool.
    pub fn pool(&self) -> &Arc<ParticlePool<P>> {
        &self.core.pool
    }

    /// Number of particle worker threads.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Current block size.
    pub fn block_size(&self) -> usize {
        self.core.allocator.block_size()
    }

    /// Current global seed.
    pub fn seed(&self) -> u64 {
        self.core.allocator.seed()
    }

    // ── Shutdown ─────────────────────────────────────────────────

    /// Stop every thread.
    ///
    /// Phases: stop the watchdog, tell the scheduler to exit, close both
    /// barriers (which cancels members mid-block), then join everything
    /// that exits within the budget and detach the rest. Listeners get
    /// `on_finish(Shutdown)` if the run was active.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.shut_down {
            return ShutdownReport {
                scheduler_joined: true,
                sync_joined: true,
                watchdog_joined: true,
                ..ShutdownReport::default()
            };
        }
        self.shut_down = true;
        let start = Instant::now();

        let was_active = {
            let mut ctl = self.core.control();
            let active = matches!(
                ctl.status,
                SimulationStatus::Running | SimulationStatus::Paused
            );
            ctl.status = SimulationStatus::ShutDown;
            ctl.stop_requested = false;
            active
        };
        self.core.notify_control();

        // Phase 1: watchdog.
        let watchdog_joined = match self.watchdog.take() {
            Some((stop_tx, handle)) => {
                let _ = stop_tx.send(());
                drop(stop_tx);
                handle.join().is_ok()
            }
            None => true,
        };

        // Phase 2: scheduler and barriers.
        self.core.send(SchedulerMsg::Shutdown);
        self.core.particles.close();
        self.core.sync.close();
        self.core.allocator.thaw();

        // Phase 3: join within the budget.
        let deadline = start + SHUTDOWN_JOIN_BUDGET;
        let scheduler = self.core.take_handle();
        let workers = self.core.particles.handles().take_all();
        let sync = self.core.sync.handles().take_all();
        let recovery = self.supervisor.take_handle();
        loop {
            let all_done = scheduler.iter().all(JoinHandle::is_finished)
                && workers.iter().all(JoinHandle::is_finished)
                && sync.iter().all(JoinHandle::is_finished)
                && recovery.iter().all(JoinHandle::is_finished);
            if all_done || Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        let mut detached = 0;
        let mut join = |handle: JoinHandle<()>| -> bool {
            if handle.is_finished() {
                handle.join().is_ok()
            } else {
                detached += 1;
                false
            }
        };
        let scheduler_joined = scheduler.map_or(true, &mut join);
        let workers_joined = workers.into_iter().map(&mut join).filter(|ok| *ok).count();
        let sync_joined = sync.into_iter().map(&mut join).fold(true, |all, ok| all && ok);
        if let Some(handle) = recovery {
            join(handle);
        }

        if was_active
            && self.core.claim_finish()
            && !self.core.try_fire(|l| l.on_finish(FinishReason::Shutdown))
        {
            log::warn!("listeners held by a wedged scheduler; shutdown not reported to them");
        }

        let total_ms = start.elapsed().as_millis() as u64;
        if detached > 0 {
            log::warn!("shutdown detached {detached} threads that did not exit in time");
        }
        log::info!("simulation shut down in {total_ms}ms");
        ShutdownReport {
            total_ms,
            scheduler_joined,
            workers_joined,
            sync_joined,
            watchdog_joined,
            detached,
        }
    }
}

#[cfg(test)]
impl<P: Particle> Simulation<P> {
    /// The shared scheduler state and the recovery supervisor, for driving
    /// the watchdog by hand.
    pub(crate) fn internals(&self) -> (Arc<SchedulerCore<P>>, Arc<Supervisor<P>>) {
        (Arc::clone(&self.core), Arc::clone(&self.supervisor))
    }
}

impl<P: Particle> Drop for Simulation<P> {
    fn drop(&mut self) {
        if !self.shut_down {
            self.shutdown();
        }
    }
}

impl<P: Particle> fmt::Debug for Simulation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("status", &self.status())
            .field("steps", &self.step_count())
            .field("workers", &self.worker_count)
            .field("pool", &self.core.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display() {
        assert_eq!(SimulationStatus::Ready.to_string(), "ready");
        assert_eq!(
            SimulationStatus::Finished(FinishReason::EndTimeReached).to_string(),
            format!("finished ({})", FinishReason::EndTimeReached)
        );
        assert_eq!(SimulationStatus::ShutDown.to_string(), "shut down");
    }

    #[test]
    fn default_report_is_empty() {
        let r = ShutdownReport::default();
        assert_eq!(r.workers_joined, 0);
        assert_eq!(r.detached, 0);
    }
}
