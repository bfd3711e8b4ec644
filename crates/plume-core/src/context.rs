//! Execution contexts passed to collaborators.
//!
//! [`MoveContext`] gives a physics collaborator the block's random stream,
//! the current step window and the cooperative cancel flag. [`SyncContext`]
//! is its counterpart for the synchronization thread.

use std::sync::atomic::{AtomicBool, Ordering};

use rand_chacha::ChaCha8Rng;

use crate::id::{StepId, StreamIndex, WorkerId};
use crate::window::StepWindow;

/// Context passed to movers and injection resolvers for one particle.
///
/// The random stream is exclusively owned by the worker for the duration
/// of the block, so draws made through [`rng()`](MoveContext::rng) depend
/// only on the global seed, the block and the particles in it, never on
/// thread interleaving.
pub struct MoveContext<'a> {
    rng: &'a mut ChaCha8Rng,
    window: StepWindow,
    step: StepId,
    worker: WorkerId,
    stream: StreamIndex,
    cancel: &'a AtomicBool,
}

impl<'a> MoveContext<'a> {
    /// Construct a move context.
    ///
    /// Typically called by the engine. Tests construct one directly around
    /// a seeded `ChaCha8Rng`.
    pub fn new(
        rng: &'a mut ChaCha8Rng,
        window: StepWindow,
        step: StepId,
        worker: WorkerId,
        stream: StreamIndex,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            rng,
            window,
            step,
            worker,
            stream,
            cancel,
        }
    }

    /// The block's deterministic random stream.
    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        self.rng
    }

    /// Simulated interval covered by this step.
    pub fn window(&self) -> StepWindow {
        self.window
    }

    /// Delta-time in seconds.
    pub fn dt(&self) -> f64 {
        self.window.dt_seconds()
    }

    /// Index of the step being computed (number of completed steps so far).
    pub fn step(&self) -> StepId {
        self.step
    }

    /// Worker slot executing this particle.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Random stream index assigned to the current block.
    pub fn stream(&self) -> StreamIndex {
        self.stream
    }

    /// Whether the watchdog has asked this worker to give up.
    ///
    /// Long-running collaborators should poll this and return
    /// [`MoveError::Cancelled`](crate::MoveError::Cancelled) when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// Context passed to the synchronizer once per step.
#[derive(Clone, Copy, Debug)]
pub struct SyncContext<'a> {
    window: StepWindow,
    step: StepId,
    measuring: bool,
    cancel: &'a AtomicBool,
}

impl<'a> SyncContext<'a> {
    /// Construct a sync context.
    pub fn new(window: StepWindow, step: StepId, measuring: bool, cancel: &'a AtomicBool) -> Self {
        Self {
            window,
            step,
            measuring,
            cancel,
        }
    }

    /// Simulated interval covered by this step.
    pub fn window(&self) -> StepWindow {
        self.window
    }

    /// Index of the step being synchronized.
    pub fn step(&self) -> StepId {
        self.step
    }

    /// Whether this step overlaps the configured measurement window.
    pub fn measuring(&self) -> bool {
        self.measuring
    }

    /// Whether the watchdog has asked the sync thread to give up.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}
