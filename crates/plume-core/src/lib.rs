//! Core types and collaborator traits for the Plume particle-transport
//! scheduler.
//!
//! This is the leaf crate of the workspace. It defines the identifiers,
//! the step window, the particle contract and pool, the collaborator
//! traits (movers, injection resolver, synchronizer, listeners, lock
//! breakers) and their execution contexts.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod context;
pub mod error;
pub mod id;
pub mod particle;
pub mod traits;
pub mod window;

pub use context::{MoveContext, SyncContext};
pub use error::{MoveError, SyncError};
pub use id::{SimTime, StepId, StreamIndex, WorkerId};
pub use particle::{
    Domain, Injection, Particle, ParticlePool, ParticleStatus, Placement, SlotBusy, StatusCounts,
};
pub use traits::{
    FinishReason, InjectionResolver, LockBreaker, NoopSynchronizer, Physics, PipeMover,
    SimulationListener, SurfaceMover, Synchronizer,
};
pub use window::{MeasurementWindow, StepWindow};

/// Random generator type used for every per-block stream.
pub use rand_chacha::ChaCha8Rng;
