//! Plume Quickstart: a complete, minimal particle-transport run.
//!
//! Demonstrates:
//!   1. Implementing `Particle` for a tracer type
//!   2. Pipe and surface movers plus an injection resolver
//!   3. A synchronizer that aggregates per-step concentrations
//!   4. Building a `SimulationConfig` (here from TOML) and a `Simulation`
//!   5. Starting, waiting for the finish, inspecting health, resetting
//!
//! Run with:
//!   RUST_LOG=info cargo run --example quickstart

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use plume_core::{
    Domain, FinishReason, Injection, InjectionResolver, MoveContext, MoveError, Particle,
    ParticlePool, ParticleStatus, Physics, PipeMover, Placement, SimTime, SimulationListener,
    StepId, SurfaceMover, SyncContext, SyncError, Synchronizer,
};
use plume_engine::{Simulation, SimulationConfig};
use rand::Rng;

// ─── Network parameters ─────────────────────────────────────────

const PIPE_LENGTH_M: f64 = 120.0;
const FLOW_VELOCITY_MS: f64 = 0.8;
const RUNOFF_VELOCITY_MS: f64 = 0.05;
const OUTFALL_X: f64 = 40.0;

const CONFIG: &str = r#"
worker_count = 4
block_size = 64
dt_seconds = 5.0
seed = 7
end_time_ms = 600000

[measurement_window]
start_ms = 60000
end_ms = 300000

[watchdog]
enabled = true
poll_interval_ms = 500
"#;

// ─── Particle ───────────────────────────────────────────────────

struct Tracer {
    released_at: SimTime,
    status: ParticleStatus,
    domain: Domain,
    injection: Injection,
    position: (f64, f64),
}

impl Tracer {
    fn new(i: usize) -> Self {
        let injection = match i % 4 {
            0 => Injection::Manhole { node: (i % 7) as u32 },
            1 | 2 => Injection::Pipe {
                pipe: (i % 5) as u32,
                offset_m: (i % 10) as f64,
            },
            _ => Injection::Surface {
                x: (i % 13) as f64,
                y: 0.0,
            },
        };
        Self {
            // A new batch every 10 simulated seconds.
            released_at: SimTime((i / 50) as i64 * 10_000),
            status: ParticleStatus::Waiting,
            domain: Domain::Undefined,
            injection,
            position: (0.0, 0.0),
        }
    }
}

impl Particle for Tracer {
    fn status(&self) -> ParticleStatus {
        self.status
    }

    fn insertion_time(&self) -> SimTime {
        self.released_at
    }

    fn domain(&self) -> Domain {
        self.domain
    }

    fn injection(&self) -> &Injection {
        &self.injection
    }

    fn activate(&mut self, placement: Placement) {
        self.domain = placement.domain();
        self.position = match placement {
            Placement::Pipe { offset_m, .. } => (offset_m, 0.0),
            Placement::Surface { x, y, .. } => (x, y),
        };
        self.status = ParticleStatus::Active;
    }

    fn reset(&mut self) {
        self.status = ParticleStatus::Waiting;
        self.domain = Domain::Undefined;
        self.position = (0.0, 0.0);
    }
}

// ─── Physics ────────────────────────────────────────────────────

/// Advection along the pipe with a random dispersive kick. Particles
/// leaving the downstream end are done.
struct PipeFlow;

impl PipeMover<Tracer> for PipeFlow {
    fn move_particle(&self, p: &mut Tracer, ctx: &mut MoveContext<'_>) -> Result<(), MoveError> {
        let kick: f64 = ctx.rng().random_range(-0.5..0.5);
        p.position.0 += FLOW_VELOCITY_MS * ctx.dt() + kick;
        if p.position.0 >= PIPE_LENGTH_M {
            p.status = ParticleStatus::Completed;
        }
        Ok(())
    }
}

/// Overland runoff towards an inlet; reaching it moves the particle into
/// the pipe network.
struct Runoff;

impl SurfaceMover<Tracer> for Runoff {
    fn move_particle(&self, p: &mut Tracer, ctx: &mut MoveContext<'_>) -> Result<(), MoveError> {
        let drift: f64 = ctx.rng().random_range(0.0..1.0);
        p.position.0 += RUNOFF_VELOCITY_MS * ctx.dt() * (1.0 + drift);
        if p.position.0 >= OUTFALL_X {
            p.domain = Domain::Pipe;
            p.position = (0.0, 0.0);
        }
        Ok(())
    }
}

struct Inlets;

impl InjectionResolver for Inlets {
    fn materialize(
        &self,
        injection: &Injection,
        ctx: &mut MoveContext<'_>,
    ) -> Result<Placement, MoveError> {
        Ok(match injection {
            Injection::Pipe { pipe, offset_m } => Placement::Pipe {
                pipe: *pipe,
                offset_m: *offset_m,
            },
            Injection::Manhole { node } => Placement::Pipe {
                pipe: *node * 2 + ctx.rng().random_range(0..2),
                offset_m: 0.0,
            },
            Injection::Surface { x, y } => Placement::Surface { cell: 0, x: *x, y: *y },
        })
    }
}

// ─── Synchronizer and listener ──────────────────────────────────

/// Counts how many particles are in the network after every measured step.
struct Concentration {
    pool: Arc<ParticlePool<Tracer>>,
    peak: Arc<AtomicU64>,
}

impl Synchronizer for Concentration {
    fn synchronize(&mut self, ctx: &SyncContext<'_>) -> Result<(), SyncError> {
        if !ctx.measuring() {
            return Ok(());
        }
        let active = self.pool.status_counts().active as u64;
        self.peak.fetch_max(active, Ordering::Relaxed);
        Ok(())
    }
}

struct Progress;

impl SimulationListener for Progress {
    fn on_step_finished(&mut self, step: StepId) {
        if step.0 % 20 == 0 {
            log::info!("step {step} done");
        }
    }

    fn on_finish(&mut self, reason: FinishReason) {
        log::info!("run finished: {reason}");
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match SimulationConfig::from_toml_str(CONFIG) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("bad config: {e}");
            std::process::exit(1);
        }
    };

    let pool = Arc::new(ParticlePool::new((0..2_000).map(Tracer::new).collect()));
    let peak = Arc::new(AtomicU64::new(0));
    let physics: Physics<Tracer> =
        Physics::new(Arc::new(PipeFlow), Arc::new(Runoff), Arc::new(Inlets));
    let sync = Concentration {
        pool: Arc::clone(&pool),
        peak: Arc::clone(&peak),
    };

    let mut sim = match Simulation::new(config, Arc::clone(&pool), physics, Box::new(sync)) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("could not build simulation: {e}");
            std::process::exit(1);
        }
    };
    sim.add_listener(Box::new(Progress));

    if let Err(e) = sim.start() {
        eprintln!("start failed: {e}");
        std::process::exit(1);
    }
    let reason = sim.wait_finished(Duration::from_secs(60));
    println!("finish reason:   {reason:?}");
    println!("steps completed: {}", sim.step_count());
    println!("peak in network: {}", peak.load(Ordering::Relaxed));
    println!("particles:       {:?}", pool.status_counts());
    println!("health:          {:?}", sim.health());
    if let Some(m) = sim.last_metrics() {
        println!(
            "last step:       {} blocks, {} particles, {}us",
            m.blocks_issued, m.particles_assigned, m.total_us
        );
    }

    // Reset and run again: identical seed, identical outcome.
    if sim.reset().is_ok() && sim.start().is_ok() {
        sim.wait_finished(Duration::from_secs(60));
        println!("second run:      {} steps", sim.step_count());
    }

    let report = sim.shutdown();
    println!("shutdown:        {report:?}");
}
