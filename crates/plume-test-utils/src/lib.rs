//! Test utilities and mock collaborators for Plume development.
//!
//! Provides a concrete [`TestParticle`], pool builders, an injection
//! resolver, and (in [`fixtures`]) movers, listeners and synchronizers
//! that record what the engine did to them.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;

use std::sync::Arc;

use plume_core::{
    Domain, Injection, InjectionResolver, MoveContext, MoveError, Particle, ParticlePool,
    ParticleStatus, Physics, Placement, PipeMover, SimTime, SurfaceMover,
};

pub use fixtures::{
    CountingLockBreaker, CountingSynchronizer, EventLog, FailingMover, HangingMover,
    ListenerEvent, PhaseEvent, PhaseLog, RecordingListener, RecordingMover,
};

/// A particle with just enough state to observe the engine.
///
/// `trace` folds in every random draw and step index a mover saw, so two
/// runs produced identical movement iff their traces match.
#[derive(Clone, Debug, PartialEq)]
pub struct TestParticle {
    pub id: usize,
    pub insertion_time: SimTime,
    pub status: ParticleStatus,
    pub domain: Domain,
    pub injection: Injection,
    pub placement: Option<Placement>,
    pub moves: u32,
    pub trace: u64,
}

impl TestParticle {
    /// A waiting particle entering at `insertion_ms`. The injection kind
    /// cycles pipe / manhole / surface by id.
    pub fn new(id: usize, insertion_ms: i64) -> Self {
        let injection = match id % 3 {
            0 => Injection::Pipe {
                pipe: id as u32,
                offset_m: 0.5,
            },
            1 => Injection::Manhole { node: id as u32 },
            _ => Injection::Surface {
                x: id as f64,
                y: 0.0,
            },
        };
        Self {
            id,
            insertion_time: SimTime(insertion_ms),
            status: ParticleStatus::Waiting,
            domain: Domain::Undefined,
            injection,
            placement: None,
            moves: 0,
            trace: 0,
        }
    }

    pub fn with_injection(mut self, injection: Injection) -> Self {
        self.injection = injection;
        self
    }
}

impl Particle for TestParticle {
    fn status(&self) -> ParticleStatus {
        self.status
    }

    fn insertion_time(&self) -> SimTime {
        self.insertion_time
    }

    fn domain(&self) -> Domain {
        self.domain
    }

    fn injection(&self) -> &Injection {
        &self.injection
    }

    fn activate(&mut self, placement: Placement) {
        self.domain = placement.domain();
        self.placement = Some(placement);
        self.status = ParticleStatus::Active;
    }

    fn reset(&mut self) {
        self.status = ParticleStatus::Waiting;
        self.domain = Domain::Undefined;
        self.placement = None;
        self.moves = 0;
        self.trace = 0;
    }
}

// ── Pool builders ──────────────────────────────────────────────────

/// `n` particles, all entering at time zero.
pub fn uniform_pool(n: usize) -> Arc<ParticlePool<TestParticle>> {
    Arc::new(ParticlePool::new(
        (0..n).map(|id| TestParticle::new(id, 0)).collect(),
    ))
}

/// `n` particles released in groups of `per_release`, one group every
/// `every_ms` starting at time zero.
pub fn staggered_pool(n: usize, every_ms: i64, per_release: usize) -> Arc<ParticlePool<TestParticle>> {
    let per_release = per_release.max(1);
    Arc::new(ParticlePool::new(
        (0..n)
            .map(|id| TestParticle::new(id, (id / per_release) as i64 * every_ms))
            .collect(),
    ))
}

/// Snapshot every particle of a pool, in pool order.
pub fn particles(pool: &ParticlePool<TestParticle>) -> Vec<TestParticle> {
    (0..pool.len()).map(|i| pool.lock(i).clone()).collect()
}

// ── Injection ──────────────────────────────────────────────────────

/// Resolves injections without any network: manholes feed pipe `node`,
/// surface points land in cell 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScriptedResolver;

impl InjectionResolver for ScriptedResolver {
    fn materialize(
        &self,
        injection: &Injection,
        _ctx: &mut MoveContext<'_>,
    ) -> Result<Placement, MoveError> {
        Ok(match injection {
            Injection::Pipe { pipe, offset_m } => Placement::Pipe {
                pipe: *pipe,
                offset_m: *offset_m,
            },
            Injection::Manhole { node } => Placement::Pipe {
                pipe: *node,
                offset_m: 0.0,
            },
            Injection::Surface { x, y } => Placement::Surface {
                cell: 0,
                x: *x,
                y: *y,
            },
        })
    }
}

/// Bundle one mover for both domains with the [`ScriptedResolver`].
pub fn physics<M>(mover: Arc<M>) -> Physics<TestParticle>
where
    M: PipeMover<TestParticle> + SurfaceMover<TestParticle> + 'static,
{
    Physics::shared(mover, Arc::new(ScriptedResolver))
}
