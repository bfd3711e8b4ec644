//! Phase scheduler, worker pool, barriers and watchdog for Plume.
//!
//! A [`Simulation`] drives a [`ParticlePool`](plume_core::ParticlePool)
//! through fixed time steps. Each step is two strictly ordered phases:
//! N worker threads move every released particle (pulling blocks from a
//! shared [`BatchAllocator`]), then a single sync thread runs the
//! [`Synchronizer`](plume_core::Synchronizer). A dedicated scheduler thread
//! serializes the transitions, and a watchdog recovers from wedged
//! threads within a bounded restart budget.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod allocator;
pub mod config;
pub mod gate;
pub mod heartbeat;
pub mod metrics;
pub mod rng;
pub mod simulation;

pub(crate) mod barrier;
pub(crate) mod clock;
pub(crate) mod recovery;
pub(crate) mod scheduler;
pub(crate) mod sync;
pub(crate) mod watchdog;
pub(crate) mod worker;

pub use allocator::{AllocatorError, BatchAllocator, WorkAssignment};
pub use config::{ConfigError, ControlError, SimulationConfig, WatchdogConfig};
pub use gate::{BarrierLifecycle, GateSnapshot, PhaseToken};
pub use heartbeat::{HeartbeatSnapshot, MemberState};
pub use metrics::{SimulationHealth, StepMetrics};
pub use rng::{RandomStreams, StreamLease};
pub use simulation::{Diagnostics, ShutdownReport, Simulation, SimulationStatus};
