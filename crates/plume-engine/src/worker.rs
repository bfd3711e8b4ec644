//! Particle worker threads.
//!
//! Each worker is a long-lived thread that, once per particle phase,
//! pulls [`WorkAssignment`]s from the shared allocator until it is
//! exhausted and then reports to the particle barrier. Load balancing is
//! pull-based: fast workers simply take more blocks.
//!
//! Failures are contained at block granularity. A [`MoveError`] or a
//! panic from a collaborator abandons the rest of the block, never the
//! phase, and never the thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use plume_core::{
    Domain, MoveContext, MoveError, Particle, ParticlePool, ParticleStatus, Physics, WorkerId,
};

use crate::allocator::{BatchAllocator, WorkAssignment};
use crate::gate::{PhaseGate, Release, Ticket};
use crate::heartbeat::{Heartbeat, MemberState};
use crate::metrics::RunHealth;

/// Everything a worker needs besides its identity. Shared by the whole
/// crew and cloned into replacements.
pub(crate) struct WorkerContext<P> {
    pub pool: Arc<ParticlePool<P>>,
    pub allocator: Arc<BatchAllocator>,
    pub physics: Physics<P>,
    pub gate: Arc<PhaseGate>,
    pub heartbeats: Arc<[Heartbeat]>,
    pub health: Arc<RunHealth>,
}

impl<P> Clone for WorkerContext<P> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            allocator: Arc::clone(&self.allocator),
            physics: self.physics.clone(),
            gate: Arc::clone(&self.gate),
            heartbeats: Arc::clone(&self.heartbeats),
            health: Arc::clone(&self.health),
        }
    }
}

/// Why a block ended before its last index.
#[derive(Debug)]
enum BlockAbort {
    /// A collaborator returned an error for the particle at `index`.
    Failed { index: usize, error: MoveError },
    /// This thread was replaced by recovery; stop touching shared state.
    Superseded,
}

/// Outcome of one particle phase from this worker's point of view.
#[derive(Debug, PartialEq, Eq)]
enum PhaseEnd {
    Exhausted,
    /// The barrier closed mid-phase (shutdown).
    Closed,
    Superseded,
}

pub(crate) struct Worker<P> {
    ctx: WorkerContext<P>,
    ticket: Ticket,
}

impl<P: Particle> Worker<P> {
    pub fn new(ctx: WorkerContext<P>, ticket: Ticket) -> Self {
        Self { ctx, ticket }
    }

    fn heartbeat(&self) -> &Heartbeat {
        &self.ctx.heartbeats[self.ticket.slot]
    }

    fn id(&self) -> WorkerId {
        WorkerId(self.ticket.slot as u32)
    }

    fn superseded(&self) -> bool {
        self.heartbeat().incarnation() != self.ticket.incarnation
    }

    /// Thread body: register, then alternate between running a phase and
    /// parking in the barrier until the gate closes or the worker is
    /// replaced.
    pub fn run(self) {
        self.heartbeat().set_state(MemberState::Registering);
        let Some(mut release) = self.ctx.gate.register(&self.ticket) else {
            self.exit();
            return;
        };
        loop {
            match self.run_phase(&release) {
                PhaseEnd::Exhausted => {}
                PhaseEnd::Closed => break,
                PhaseEnd::Superseded => {
                    log::info!(
                        "worker {} (incarnation {}) superseded, leaving",
                        self.id(),
                        self.ticket.incarnation
                    );
                    return;
                }
            }
            self.heartbeat().set_state(MemberState::Waiting);
            match self.ctx.gate.finish_phase(&self.ticket) {
                Some(next) => release = next,
                None => break,
            }
        }
        self.exit();
    }

    fn exit(&self) {
        if !self.superseded() {
            self.heartbeat().set_state(MemberState::Exited);
        }
        log::debug!("worker {} exiting", self.id());
    }

    /// Pull blocks until the allocator is exhausted or the barrier closes.
    fn run_phase(&self, release: &Release) -> PhaseEnd {
        loop {
            if self.superseded() {
                return PhaseEnd::Superseded;
            }
            if self.ctx.gate.is_closed() {
                return PhaseEnd::Closed;
            }
            self.heartbeat().set_state(MemberState::Pulling);
            let Some(assignment) = self.ctx.allocator.next_batch() else {
                return PhaseEnd::Exhausted;
            };
            if self.run_block(assignment, release) == PhaseEnd::Superseded {
                return PhaseEnd::Superseded;
            }
        }
    }

    /// Run one block under `catch_unwind`. Returns `Superseded` only if
    /// this thread was replaced while inside the block.
    fn run_block(&self, assignment: WorkAssignment, release: &Release) -> PhaseEnd {
        let heartbeat = self.heartbeat();
        heartbeat.begin_block();
        let mut lease = self.ctx.allocator.lease(assignment.stream);
        if lease.replaced() {
            log::warn!(
                "worker {}: stream {} was still held by a wedged thread; using a re-derived stream",
                self.id(),
                lease.index()
            );
            self.ctx.health.record_replaced_stream();
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.move_block(assignment, release, lease.rng())
        }));

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(BlockAbort::Superseded)) => return PhaseEnd::Superseded,
            Ok(Err(BlockAbort::Failed { index, error })) => {
                log::warn!(
                    "worker {}: block {}..{} abandoned at particle {index}: {error}",
                    self.id(),
                    assignment.start,
                    assignment.end
                );
                self.ctx.health.record_block_failure();
            }
            Err(payload) => {
                log::warn!(
                    "worker {}: block {}..{} abandoned after panic: {}",
                    self.id(),
                    assignment.start,
                    assignment.end,
                    panic_message(&*payload)
                );
                self.ctx.health.record_block_failure();
            }
        }
        if self.superseded() {
            return PhaseEnd::Superseded;
        }
        PhaseEnd::Exhausted
    }

    fn move_block(
        &self,
        assignment: WorkAssignment,
        release: &Release,
        rng: &mut plume_core::ChaCha8Rng,
    ) -> Result<(), BlockAbort> {
        let pool = &*self.ctx.pool;
        let physics = &self.ctx.physics;
        let heartbeat = self.heartbeat();
        let window = release.window;

        for index in assignment.range() {
            if self.superseded() {
                return Err(BlockAbort::Superseded);
            }
            heartbeat.record_progress();

            let mut particle = match pool.try_lock(index) {
                Ok(p) => p,
                Err(busy) => {
                    log::warn!("worker {}: skipping particle: {busy}", self.id());
                    self.ctx.health.record_quarantined();
                    continue;
                }
            };

            let mut ctx = MoveContext::new(
                &mut *rng,
                window,
                release.step,
                self.id(),
                assignment.stream,
                heartbeat.cancel_flag(),
            );

            match particle.status() {
                ParticleStatus::Completed => continue,
                ParticleStatus::Waiting => {
                    // Sorted pool: nothing after this one has arrived either.
                    if pool.insertion_times()[index] > window.start() {
                        break;
                    }
                    let placement = physics
                        .injection
                        .materialize(particle.injection(), &mut ctx)
                        .map_err(|error| {
                            log::debug!(
                                "worker {}: {} injection of particle {index} failed",
                                self.id(),
                                particle.injection().kind()
                            );
                            BlockAbort::Failed { index, error }
                        })?;
                    particle.activate(placement);
                }
                ParticleStatus::Active => {}
            }

            let moved = match particle.domain() {
                Domain::Pipe => physics.pipe.move_particle(&mut particle, &mut ctx),
                Domain::Surface => physics.surface.move_particle(&mut particle, &mut ctx),
                Domain::Undefined => {
                    log::warn!(
                        "worker {}: particle {index} is active with an undefined domain; skipped",
                        self.id()
                    );
                    self.ctx.health.record_undefined_domain();
                    Ok(())
                }
            };
            moved.map_err(|error| BlockAbort::Failed { index, error })?;
        }
        Ok(())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
