//! Barrier variants over a shared [`PhaseGate`].
//!
//! A barrier owns the threads it coordinates: it spawns them in
//! [`initialize`](Barrier::initialize), stamps their phases through
//! [`arm`](Barrier::arm), and swaps in a fresh thread for a wedged one in
//! [`replace_member`](Barrier::replace_member). Two variants exist:
//! [`ParticleBarrier`] (N particle workers) and
//! [`SyncBarrier`](crate::sync::SyncBarrier) (the single synchronization
//! thread, which also carries the measurement-window logic).

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use plume_core::{Particle, StepId, StepWindow};

use crate::config::ConfigError;
use crate::gate::{GateSnapshot, PhaseGate, PhaseToken, Ticket};
use crate::heartbeat::{Heartbeat, HeartbeatSnapshot};
use crate::worker::{Worker, WorkerContext};

/// Common contract of both barrier variants.
pub(crate) trait Barrier: Send + Sync {
    fn gate(&self) -> &PhaseGate;

    fn heartbeats(&self) -> &[Heartbeat];

    fn handles(&self) -> &MemberHandles;

    /// Spawn every member and block until all registered.
    fn initialize(&self, timeout: Duration) -> Result<(), ConfigError>;

    /// Stamp the next phase and wake the members. Returns the generation,
    /// or `None` if the barrier is closed.
    fn arm(&self, window: StepWindow, step: StepId) -> Option<u64>;

    /// Spawn a replacement for the member in `slot`. Returns `Ok(false)` if
    /// the barrier is already closed.
    fn replace_member(&self, slot: usize) -> Result<bool, ConfigError>;

    fn token(&self) -> PhaseToken {
        self.gate().token()
    }

    fn snapshot(&self) -> GateSnapshot {
        self.gate().snapshot()
    }

    fn heartbeat_snapshots(&self) -> Vec<HeartbeatSnapshot> {
        self.heartbeats().iter().map(Heartbeat::snapshot).collect()
    }

    /// Close the gate and ask every member to give up its current block.
    fn close(&self) {
        self.gate().close();
        for hb in self.heartbeats() {
            hb.request_cancel();
        }
    }
}

/// Join handles of a barrier's member threads, one per slot.
pub(crate) struct MemberHandles {
    slots: Mutex<Vec<Option<JoinHandle<()>>>>,
}

impl MemberHandles {
    pub fn new(count: usize) -> Self {
        Self {
            slots: Mutex::new((0..count).map(|_| None).collect()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<JoinHandle<()>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `handle` in `slot`, returning the handle it displaces.
    pub fn put(&self, slot: usize, handle: JoinHandle<()>) -> Option<JoinHandle<()>> {
        self.lock().get_mut(slot).and_then(|s| s.replace(handle))
    }

    pub fn take_all(&self) -> Vec<JoinHandle<()>> {
        self.lock().iter_mut().filter_map(Option::take).collect()
    }
}

/// Spawn a named member thread.
pub(crate) fn spawn_named<F>(name: String, body: F) -> Result<JoinHandle<()>, ConfigError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(body)
        .map_err(|e| ConfigError::ThreadSpawnFailed {
            reason: format!("{name}: {e}"),
        })
}

/// Map a registration timeout to a config error.
pub(crate) fn init_timeout(gate: &PhaseGate, registered: usize) -> ConfigError {
    ConfigError::InitTimeout {
        barrier: match gate.token() {
            PhaseToken::Particle => "particle",
            PhaseToken::Sync => "sync",
        },
        registered,
        expected: gate.expected(),
    }
}

// ── ParticleBarrier ───────────────────────────────────────────────

/// Barrier over the N particle workers.
pub(crate) struct ParticleBarrier<P> {
    ctx: WorkerContext<P>,
    handles: MemberHandles,
}

impl<P: Particle> ParticleBarrier<P> {
    pub fn new(ctx: WorkerContext<P>) -> Self {
        let count = ctx.gate.expected();
        Self {
            ctx,
            handles: MemberHandles::new(count),
        }
    }

    fn spawn_worker(&self, ticket: Ticket) -> Result<JoinHandle<()>, ConfigError> {
        let worker = Worker::new(self.ctx.clone(), ticket);
        spawn_named(format!("plume-worker-{}", ticket.slot), move || worker.run())
    }
}

impl<P: Particle> Barrier for ParticleBarrier<P> {
    fn gate(&self) -> &PhaseGate {
        &self.ctx.gate
    }

    fn heartbeats(&self) -> &[Heartbeat] {
        &self.ctx.heartbeats
    }

    fn handles(&self) -> &MemberHandles {
        &self.handles
    }

    fn initialize(&self, timeout: Duration) -> Result<(), ConfigError> {
        for ticket in self.ctx.gate.begin_initialize() {
            match self.spawn_worker(ticket) {
                Ok(handle) => {
                    self.handles.put(ticket.slot, handle);
                }
                Err(e) => {
                    self.close();
                    return Err(e);
                }
            }
        }
        self.ctx
            .gate
            .await_ready(timeout)
            .map_err(|registered| init_timeout(&self.ctx.gate, registered))?;
        log::debug!("particle barrier ready with {} workers", self.ctx.gate.expected());
        Ok(())
    }

    fn arm(&self, window: StepWindow, step: StepId) -> Option<u64> {
        self.ctx.gate.go_next(window, step, false)
    }

    fn replace_member(&self, slot: usize) -> Result<bool, ConfigError> {
        let Some(heartbeat) = self.ctx.heartbeats.get(slot) else {
            return Ok(false);
        };
        heartbeat.request_cancel();
        let Some(ticket) = self.ctx.gate.replace_member(slot) else {
            return Ok(false);
        };
        heartbeat.set_incarnation(ticket.incarnation);
        let handle = self.spawn_worker(ticket)?;
        // The displaced thread is detached; it leaves on its own once it
        // notices the new incarnation.
        drop(self.handles.put(slot, handle));
        log::info!(
            "particle worker {slot} replaced (incarnation {})",
            ticket.incarnation
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_handles_swap_and_drain() {
        let handles = MemberHandles::new(2);
        let a = thread::spawn(|| {});
        let b = thread::spawn(|| {});
        assert!(handles.put(0, a).is_none());
        let displaced = handles.put(0, b).unwrap();
        displaced.join().unwrap();
        let rest = handles.take_all();
        assert_eq!(rest.len(), 1);
        for h in rest {
            h.join().unwrap();
        }
        assert!(handles.take_all().is_empty());
    }

    #[test]
    fn out_of_range_slot_is_ignored() {
        let handles = MemberHandles::new(1);
        let h = thread::spawn(|| {});
        assert!(handles.put(5, h).is_none());
        assert!(handles.take_all().is_empty());
    }

    #[test]
    fn spawn_named_sets_thread_name() {
        let handle = spawn_named("plume-test".to_string(), || {
            assert_eq!(thread::current().name(), Some("plume-test"));
        })
        .unwrap();
        handle.join().unwrap();
    }
}
