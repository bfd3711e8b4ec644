//! The particle contract and the insertion-time-ordered particle pool.
//!
//! The scheduling core never looks inside a particle beyond the narrow
//! [`Particle`] view: status, insertion time, current domain and the
//! injection tag. Everything else (position, mass, pipe offsets, ...) is
//! owned by the physics collaborators that move particles.

use std::fmt;
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::id::SimTime;

/// Lifecycle of a particle as seen by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParticleStatus {
    /// Not yet released into the model; waits for its insertion time.
    Waiting,
    /// Released and moving in some domain.
    Active,
    /// Left the model (outfall, deposition, ...). Never moved again.
    Completed,
}

/// Which physics collaborator currently owns an active particle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Domain {
    /// Moving through the pipe network.
    Pipe,
    /// Moving across the surface mesh.
    Surface,
    /// No domain assigned. Logged as an anomaly and skipped.
    Undefined,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe => write!(f, "pipe"),
            Self::Surface => write!(f, "surface"),
            Self::Undefined => write!(f, "undefined"),
        }
    }
}

/// Where a particle enters the model. Closed set, matched exhaustively.
#[derive(Clone, Debug, PartialEq)]
pub enum Injection {
    /// Directly into a pipe at a distance along it.
    Pipe {
        /// Opaque pipe identifier owned by the network model.
        pipe: u32,
        /// Distance from the pipe's upstream end, in metres.
        offset_m: f64,
    },
    /// Into a manhole node; the resolver picks the outgoing pipe.
    Manhole {
        /// Opaque node identifier owned by the network model.
        node: u32,
    },
    /// Onto the surface mesh at planar coordinates.
    Surface {
        /// Easting in model units.
        x: f64,
        /// Northing in model units.
        y: f64,
    },
}

impl Injection {
    /// Short tag used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pipe { .. } => "pipe",
            Self::Manhole { .. } => "manhole",
            Self::Surface { .. } => "surface",
        }
    }
}

/// Initial placement returned by an injection resolver.
///
/// The variant decides the particle's initial [`Domain`].
#[derive(Clone, Debug, PartialEq)]
pub enum Placement {
    /// Placed in a pipe.
    Pipe {
        /// Opaque pipe identifier.
        pipe: u32,
        /// Distance from the upstream end, in metres.
        offset_m: f64,
    },
    /// Placed on the surface mesh.
    Surface {
        /// Opaque surface cell identifier.
        cell: u32,
        /// Easting in model units.
        x: f64,
        /// Northing in model units.
        y: f64,
    },
}

impl Placement {
    /// The domain this placement puts a particle into.
    pub fn domain(&self) -> Domain {
        match self {
            Self::Pipe { .. } => Domain::Pipe,
            Self::Surface { .. } => Domain::Surface,
        }
    }
}

/// The view of a particle that the scheduling core relies on.
///
/// Implementors own all physical state. `insertion_time()` must not change
/// for the lifetime of the particle (the pool caches it at construction).
pub trait Particle: Send + 'static {
    /// Current lifecycle status.
    fn status(&self) -> ParticleStatus;

    /// Simulated time at which the particle enters the model.
    fn insertion_time(&self) -> SimTime;

    /// Domain of an active particle. Ignored for waiting/completed ones.
    fn domain(&self) -> Domain;

    /// Where the particle enters the model.
    fn injection(&self) -> &Injection;

    /// Transition from waiting to active at the given placement.
    fn activate(&mut self, placement: Placement);

    /// Return to the initial waiting state (simulation reset).
    fn reset(&mut self);
}

/// Returned by [`ParticlePool::try_lock`] when a particle is held elsewhere.
///
/// Particle ranges handed to workers never overlap, so a held lock means
/// the previous holder is wedged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotBusy {
    /// Index of the busy particle.
    pub index: usize,
}

impl fmt::Display for SlotBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "particle {} is locked by another thread", self.index)
    }
}

impl std::error::Error for SlotBusy {}

/// Per-status totals over the whole pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Particles still waiting.
    pub waiting: usize,
    /// Particles currently active.
    pub active: usize,
    /// Particles that have left the model.
    pub completed: usize,
}

/// Random-access particle storage ordered by insertion time.
///
/// Each particle sits behind its own mutex. Workers process disjoint index
/// ranges, so these locks are uncontended in normal operation; they exist
/// so that the pool can be shared as `Arc<ParticlePool<P>>` without unsafe
/// code.
pub struct ParticlePool<P> {
    slots: Vec<Mutex<P>>,
    insertion_times: Vec<SimTime>,
}

impl<P: Particle> ParticlePool<P> {
    /// Build a pool, stably sorting particles by insertion time.
    pub fn new(mut particles: Vec<P>) -> Self {
        particles.sort_by_key(|p| p.insertion_time());
        let insertion_times = particles.iter().map(|p| p.insertion_time()).collect();
        Self {
            slots: particles.into_iter().map(Mutex::new).collect(),
            insertion_times,
        }
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool holds no particles.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insertion times in pool order (non-decreasing).
    pub fn insertion_times(&self) -> &[SimTime] {
        &self.insertion_times
    }

    /// Lock a particle without blocking.
    ///
    /// A poisoned lock (a collaborator panicked mid-move) is recovered;
    /// the panic itself has already been reported by the worker.
    pub fn try_lock(&self, index: usize) -> Result<MutexGuard<'_, P>, SlotBusy> {
        match self.slots[index].try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => {
                self.slots[index].clear_poison();
                Ok(poisoned.into_inner())
            }
            Err(TryLockError::WouldBlock) => Err(SlotBusy { index }),
        }
    }

    /// Lock a particle, blocking until available.
    ///
    /// Only for use while no phase is running (inspection, reset).
    pub fn lock(&self, index: usize) -> MutexGuard<'_, P> {
        self.slots[index]
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Run `f` against a particle under its lock.
    pub fn with<R>(&self, index: usize, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.lock(index))
    }

    /// Count particles per status. Skips particles that are currently
    /// locked by a wedged thread.
    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for i in 0..self.slots.len() {
            let Ok(p) = self.try_lock(i) else { continue };
            match p.status() {
                ParticleStatus::Waiting => counts.waiting += 1,
                ParticleStatus::Active => counts.active += 1,
                ParticleStatus::Completed => counts.completed += 1,
            }
        }
        counts
    }

    /// Whether every particle has completed. `false` for an empty pool.
    pub fn all_completed(&self) -> bool {
        !self.slots.is_empty()
            && (0..self.slots.len()).all(|i| match self.try_lock(i) {
                Ok(p) => p.status() == ParticleStatus::Completed,
                Err(_) => false,
            })
    }

    /// Reset every particle to its initial waiting state.
    ///
    /// Returns the indices that could not be reset because a wedged thread
    /// still holds them.
    pub fn reset(&self) -> Vec<usize> {
        let mut busy = Vec::new();
        for i in 0..self.slots.len() {
            match self.try_lock(i) {
                Ok(mut p) => p.reset(),
                Err(SlotBusy { index }) => busy.push(index),
            }
        }
        busy
    }
}

impl<P> fmt::Debug for ParticlePool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParticlePool")
            .field("len", &self.slots.len())
            .finish()
    }
}

// Compile-time assertion: a pool of Send particles can be shared across threads.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn check<P: Particle>() {
        assert::<ParticlePool<P>>();
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dot {
        t: SimTime,
        status: ParticleStatus,
        domain: Domain,
        injection: Injection,
    }

    impl Dot {
        fn at(ms: i64) -> Self {
            Self {
                t: SimTime(ms),
                status: ParticleStatus::Waiting,
                domain: Domain::Undefined,
                injection: Injection::Manhole { node: ms as u32 },
            }
        }
    }

    impl Particle for Dot {
        fn status(&self) -> ParticleStatus {
            self.status
        }
        fn insertion_time(&self) -> SimTime {
            self.t
        }
        fn domain(&self) -> Domain {
            self.domain
        }
        fn injection(&self) -> &Injection {
            &self.injection
        }
        fn activate(&mut self, placement: Placement) {
            self.domain = placement.domain();
            self.status = ParticleStatus::Active;
        }
        fn reset(&mut self) {
            self.domain = Domain::Undefined;
            self.status = ParticleStatus::Waiting;
        }
    }

    #[test]
    fn pool_sorts_by_insertion_time_stably() {
        let pool = ParticlePool::new(vec![Dot::at(30), Dot::at(10), Dot::at(20), Dot::at(10)]);
        let times: Vec<i64> = pool.insertion_times().iter().map(|t| t.0).collect();
        assert_eq!(times, vec![10, 10, 20, 30]);
        // Stable: the first 10ms particle in input order stays first.
        assert!(matches!(
            pool.lock(0).injection(),
            Injection::Manhole { node: 10 }
        ));
    }

    #[test]
    fn try_lock_reports_busy_slot() {
        let pool = ParticlePool::new(vec![Dot::at(0), Dot::at(1)]);
        let held = pool.try_lock(0).unwrap();
        assert_eq!(pool.try_lock(0).unwrap_err(), SlotBusy { index: 0 });
        assert!(pool.try_lock(1).is_ok());
        drop(held);
        assert!(pool.try_lock(0).is_ok());
    }

    #[test]
    fn poisoned_slot_is_recovered() {
        let pool = std::sync::Arc::new(ParticlePool::new(vec![Dot::at(0)]));
        let p = std::sync::Arc::clone(&pool);
        let _ = std::thread::spawn(move || {
            let _g = p.lock(0);
            panic!("collaborator blew up");
        })
        .join();
        let guard = pool.try_lock(0).expect("poison should be recovered");
        assert_eq!(guard.status(), ParticleStatus::Waiting);
    }

    #[test]
    fn status_counts_and_reset() {
        let pool = ParticlePool::new(vec![Dot::at(0), Dot::at(1), Dot::at(2)]);
        pool.with(0, |p| {
            p.activate(Placement::Surface {
                cell: 0,
                x: 0.0,
                y: 0.0,
            })
        });
        pool.with(1, |p| p.status = ParticleStatus::Completed);
        assert_eq!(
            pool.status_counts(),
            StatusCounts {
                waiting: 1,
                active: 1,
                completed: 1
            }
        );
        assert!(!pool.all_completed());
        assert!(pool.reset().is_empty());
        assert_eq!(pool.status_counts().waiting, 3);
    }

    #[test]
    fn empty_pool_is_never_all_completed() {
        let pool: ParticlePool<Dot> = ParticlePool::new(Vec::new());
        assert!(pool.is_empty());
        assert!(!pool.all_completed());
    }

    #[test]
    fn placement_decides_domain() {
        assert_eq!(
            Placement::Pipe {
                pipe: 1,
                offset_m: 2.0
            }
            .domain(),
            Domain::Pipe
        );
        assert_eq!(Injection::Surface { x: 0.0, y: 0.0 }.kind(), "surface");
    }
}
