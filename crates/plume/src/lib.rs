//! Plume: a deterministic, phase-synchronized scheduler for
//! particle-transport simulations.
//!
//! This is the top-level facade crate that re-exports the public API of
//! the Plume sub-crates. For most users, adding `plume` as a single
//! dependency is sufficient.
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use plume::prelude::*;
//! use plume_test_utils::{physics, uniform_pool, RecordingMover};
//!
//! let config = SimulationConfig {
//!     worker_count: Some(2),
//!     block_size: 16,
//!     end_time_ms: 5_000,
//!     ..SimulationConfig::default()
//! };
//! let mover = Arc::new(RecordingMover::new());
//! let mut sim = Simulation::new(
//!     config,
//!     uniform_pool(100),
//!     physics(Arc::clone(&mover)),
//!     Box::new(NoopSynchronizer),
//! )
//! .unwrap();
//!
//! sim.start().unwrap();
//! assert_eq!(
//!     sim.wait_finished(Duration::from_secs(10)),
//!     Some(FinishReason::EndTimeReached)
//! );
//! assert_eq!(sim.step_count(), 5);
//! assert_eq!(mover.total_moves(), 500);
//! sim.shutdown();
//! ```
//!
//! # Modules
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `plume-core` | IDs, step window, particle contract and pool, collaborator traits |
//! | [`engine`] | `plume-engine` | Allocator, random streams, `Simulation`, config, health |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types and collaborator traits (`plume-core`).
///
/// Implement [`types::Particle`] for your particle type and
/// [`types::PipeMover`], [`types::SurfaceMover`],
/// [`types::InjectionResolver`] and [`types::Synchronizer`] for your
/// physics.
pub use plume_core as types;

/// The scheduling engine (`plume-engine`).
///
/// [`engine::Simulation`] owns the worker pool, the sync thread, the
/// scheduler and the watchdog. [`engine::BatchAllocator`] and
/// [`engine::RandomStreams`] are usable on their own.
pub use plume_engine as engine;

/// Common imports for typical Plume usage.
///
/// ```rust
/// use plume::prelude::*;
/// ```
pub mod prelude {
    // Particles
    pub use plume_core::{
        Domain, Injection, MeasurementWindow, Particle, ParticlePool, ParticleStatus, Placement,
        SimTime, StepId, StepWindow,
    };

    // Collaborators
    pub use plume_core::{
        InjectionResolver, LockBreaker, MoveContext, NoopSynchronizer, Physics, PipeMover,
        SimulationListener, SurfaceMover, SyncContext, Synchronizer,
    };

    // Errors and outcomes
    pub use plume_core::{FinishReason, MoveError, SyncError};

    // Engine
    pub use plume_engine::{
        ConfigError, ControlError, Simulation, SimulationConfig, SimulationHealth,
        SimulationStatus, StepMetrics, WatchdogConfig,
    };
}
