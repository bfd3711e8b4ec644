//! Collaborator contracts consumed by the scheduling core.
//!
//! Physics, injection resolution, measurement and lock management live
//! outside the core. The engine reaches them only through these traits.

use std::fmt;
use std::sync::Arc;

use crate::context::{MoveContext, SyncContext};
use crate::error::{MoveError, SyncError};
use crate::id::StepId;
use crate::particle::{Injection, Placement};

/// Advances a particle that is inside the pipe network by one step.
///
/// Called concurrently from several workers on disjoint particles, hence
/// `Send + Sync`. May return an error or panic; either way the worker
/// abandons the rest of its current block.
pub trait PipeMover<P>: Send + Sync {
    /// Move one particle through the network for `ctx.dt()` seconds.
    fn move_particle(&self, particle: &mut P, ctx: &mut MoveContext<'_>) -> Result<(), MoveError>;
}

/// Advances a particle that is on the surface mesh by one step.
pub trait SurfaceMover<P>: Send + Sync {
    /// Move one particle across the surface for `ctx.dt()` seconds.
    fn move_particle(&self, particle: &mut P, ctx: &mut MoveContext<'_>) -> Result<(), MoveError>;
}

/// Turns an injection point into an initial placement.
///
/// Dispatch on the injection kind is an exhaustive `match` over
/// [`Injection`]; a manhole typically resolves to a pipe placement on one
/// of its outgoing pipes.
pub trait InjectionResolver: Send + Sync {
    /// Resolve where a particle released at `injection` starts.
    fn materialize(
        &self,
        injection: &Injection,
        ctx: &mut MoveContext<'_>,
    ) -> Result<Placement, MoveError>;
}

/// Per-step bookkeeping run on the dedicated synchronization thread.
///
/// Runs strictly after every worker has finished the particle phase of
/// the step and strictly before any worker sees the next step's window.
pub trait Synchronizer: Send {
    /// Measure / accumulate for the step described by `ctx`.
    fn synchronize(&mut self, ctx: &SyncContext<'_>) -> Result<(), SyncError>;

    /// Drop accumulated state (simulation reset).
    fn reset(&mut self) {}
}

/// A synchronizer that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSynchronizer;

impl Synchronizer for NoopSynchronizer {
    fn synchronize(&mut self, _ctx: &SyncContext<'_>) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Why a simulation run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// Simulated time reached the configured end time.
    EndTimeReached,
    /// Every particle completed and stop-on-completion is enabled.
    AllParticlesCompleted,
    /// The simulation was shut down while running.
    Shutdown,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EndTimeReached => write!(f, "end time reached"),
            Self::AllParticlesCompleted => write!(f, "all particles completed"),
            Self::Shutdown => write!(f, "shut down"),
        }
    }
}

/// Lifecycle callbacks.
///
/// `on_start`, `on_step_finished` and `on_finish` fire synchronously on the
/// scheduler thread; `on_reset` fires on the thread that calls reset. A
/// slow listener delays the next phase, so keep them short.
pub trait SimulationListener: Send {
    /// A run started or resumed.
    fn on_start(&mut self) {}

    /// A step completed; `step` is its 0-based id.
    fn on_step_finished(&mut self, _step: StepId) {}

    /// The simulation was reset to step zero.
    fn on_reset(&mut self) {}

    /// The run ended.
    fn on_finish(&mut self, _reason: FinishReason) {}
}

/// Externally owned locks that recovery may forcibly release.
///
/// Collaborators that guard shared structures (e.g. measurement cells)
/// with their own locks register a breaker so that a wedged former owner
/// cannot keep its replacement blocked.
pub trait LockBreaker: Send + Sync {
    /// Name used in recovery logs.
    fn name(&self) -> &str;

    /// Release every lock still held. Returns how many were released.
    fn force_release(&self) -> usize;
}

/// The physics collaborators a worker dispatches to.
///
/// Cheap to clone: every collaborator is shared behind an `Arc`. A
/// replacement worker built during recovery receives a clone of the same
/// bundle as the worker it replaces.
pub struct Physics<P> {
    /// Mover for particles in the pipe network.
    pub pipe: Arc<dyn PipeMover<P>>,
    /// Mover for particles on the surface mesh.
    pub surface: Arc<dyn SurfaceMover<P>>,
    /// Resolver for injection points of newly released particles.
    pub injection: Arc<dyn InjectionResolver>,
}

impl<P> Physics<P> {
    /// Bundle separate collaborators.
    pub fn new(
        pipe: Arc<dyn PipeMover<P>>,
        surface: Arc<dyn SurfaceMover<P>>,
        injection: Arc<dyn InjectionResolver>,
    ) -> Self {
        Self {
            pipe,
            surface,
            injection,
        }
    }

    /// Use one collaborator for both domains.
    pub fn shared<M>(mover: Arc<M>, injection: Arc<dyn InjectionResolver>) -> Self
    where
        M: PipeMover<P> + SurfaceMover<P> + 'static,
    {
        let pipe: Arc<dyn PipeMover<P>> = mover.clone();
        let surface: Arc<dyn SurfaceMover<P>> = mover;
        Self {
            pipe,
            surface,
            injection,
        }
    }
}

impl<P> Clone for Physics<P> {
    fn clone(&self) -> Self {
        Self {
            pipe: Arc::clone(&self.pipe),
            surface: Arc::clone(&self.surface),
            injection: Arc::clone(&self.injection),
        }
    }
}

impl<P> fmt::Debug for Physics<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Physics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_display() {
        assert_eq!(FinishReason::EndTimeReached.to_string(), "end time reached");
        assert_eq!(
            FinishReason::AllParticlesCompleted.to_string(),
            "all particles completed"
        );
    }

    #[test]
    fn listener_defaults_are_noops() {
        struct Quiet;
        impl SimulationListener for Quiet {}
        let mut l = Quiet;
        l.on_start();
        l.on_step_finished(StepId(1));
        l.on_reset();
        l.on_finish(FinishReason::Shutdown);
    }
}
