//! The synchronization barrier and its single member thread.
//!
//! The sync phase runs the [`Synchronizer`] collaborator once per step,
//! strictly between two particle phases. The barrier decides whether the
//! step is *measuring*: with a configured [`MeasurementWindow`] only steps
//! overlapping it are, and the barrier logs when measurement switches on
//! and off. Without one every step measures.
//!
//! The synchronizer sits behind a mutex that the sync thread only ever
//! `try_lock`s: a replacement thread must never block on a synchronizer
//! still held by the wedged thread it replaced.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::JoinHandle;
use std::time::Duration;

use plume_core::{MeasurementWindow, StepId, StepWindow, SyncContext, Synchronizer};

use crate::barrier::{init_timeout, spawn_named, Barrier, MemberHandles};
use crate::config::ConfigError;
use crate::gate::{PhaseGate, Release, Ticket};
use crate::heartbeat::{Heartbeat, MemberState};
use crate::metrics::RunHealth;
use crate::worker::panic_message;

type SharedSynchronizer = Arc<Mutex<Box<dyn Synchronizer>>>;

#[derive(Clone)]
struct SyncMemberContext {
    gate: Arc<PhaseGate>,
    heartbeats: Arc<[Heartbeat]>,
    synchronizer: SharedSynchronizer,
    health: Arc<RunHealth>,
}

/// Barrier over the single synchronization thread.
pub(crate) struct SyncBarrier {
    ctx: SyncMemberContext,
    measurement: Option<MeasurementWindow>,
    measuring: AtomicBool,
    handles: MemberHandles,
}

impl SyncBarrier {
    pub fn new(
        gate: Arc<PhaseGate>,
        synchronizer: Box<dyn Synchronizer>,
        measurement: Option<MeasurementWindow>,
        health: Arc<RunHealth>,
    ) -> Self {
        Self {
            ctx: SyncMemberContext {
                gate,
                heartbeats: vec![Heartbeat::new(0)].into(),
                synchronizer: Arc::new(Mutex::new(synchronizer)),
                health,
            },
            measurement,
            measuring: AtomicBool::new(measurement.is_none()),
            handles: MemberHandles::new(1),
        }
    }

    /// Whether a step covering `window` measures.
    pub fn is_measuring(&self, window: &StepWindow) -> bool {
        self.measurement.is_none_or(|m| window.overlaps(&m))
    }

    /// Reset the synchronizer. Returns `false` if a wedged thread still
    /// holds it.
    pub fn reset_synchronizer(&self) -> bool {
        match self.ctx.synchronizer.try_lock() {
            Ok(mut s) => {
                s.reset();
                true
            }
            Err(TryLockError::Poisoned(p)) => {
                self.ctx.synchronizer.clear_poison();
                p.into_inner().reset();
                true
            }
            Err(TryLockError::WouldBlock) => {
                log::warn!("synchronizer is held by a wedged thread; not reset");
                false
            }
        }
    }

    fn spawn_member(&self, ticket: Ticket) -> Result<JoinHandle<()>, ConfigError> {
        let member = SyncMember {
            ctx: self.ctx.clone(),
            ticket,
        };
        spawn_named("plume-sync".to_string(), move || member.run())
    }
}

impl Barrier for SyncBarrier {
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
            match self.spawn_member(ticket) {
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
        log::debug!("sync barrier ready");
        Ok(())
    }

    fn arm(&self, window: StepWindow, step: StepId) -> Option<u64> {
        let measuring = self.is_measuring(&window);
        let was = self.measuring.swap(measuring, Ordering::AcqRel);
        if was != measuring {
            if measuring {
                log::info!("measurement window activated at {window}");
            } else {
                log::info!("measurement window deactivated at {window}");
            }
        }
        self.ctx.gate.go_next(window, step, measuring)
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
        let handle = self.spawn_member(ticket)?;
        drop(self.handles.put(slot, handle));
        log::info!("sync thread replaced (incarnation {})", ticket.incarnation);
        Ok(true)
    }
}

struct SyncMember {
    ctx: SyncMemberContext,
    ticket: Ticket,
}

impl SyncMember {
    fn heartbeat(&self) -> &Heartbeat {
        &self.ctx.heartbeats[self.ticket.slot]
    }

    fn superseded(&self) -> bool {
        self.heartbeat().incarnation() != self.ticket.incarnation
    }

    fn run(self) {
        self.heartbeat().set_state(MemberState::Registering);
        let Some(mut release) = self.ctx.gate.register(&self.ticket) else {
            self.exit();
            return;
        };
        loop {
            self.synchronize(&release);
            if self.superseded() {
                log::info!(
                    "sync thread (incarnation {}) superseded, leaving",
                    self.ticket.incarnation
                );
                return;
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
        log::debug!("sync thread exiting");
    }

    fn synchronize(&self, release: &Release) {
        let heartbeat = self.heartbeat();
        heartbeat.begin_block();
        heartbeat.record_progress();

        let mut synchronizer = match self.ctx.synchronizer.try_lock() {
            Ok(s) => s,
            Err(TryLockError::Poisoned(p)) => {
                self.ctx.synchronizer.clear_poison();
                p.into_inner()
            }
            Err(TryLockError::WouldBlock) => {
                log::warn!(
                    "step {}: synchronizer is held by a wedged thread; sync skipped",
                    release.step
                );
                self.ctx.health.record_sync_failure();
                return;
            }
        };

        let ctx = SyncContext::new(
            release.window,
            release.step,
            release.measuring,
            heartbeat.cancel_flag(),
        );
        match panic::catch_unwind(AssertUnwindSafe(|| synchronizer.synchronize(&ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::warn!("step {}: synchronization failed: {e}", release.step);
                self.ctx.health.record_sync_failure();
            }
            Err(payload) => {
                log::warn!(
                    "step {}: synchronizer panicked: {}",
                    release.step,
                    panic_message(&*payload)
                );
                self.ctx.health.record_sync_failure();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use plume_core::{SimTime, SyncError};
    use std::sync::atomic::AtomicU64;

    use crate::gate::{PhaseToken, SchedulerMsg};

    struct Tally {
        calls: Arc<AtomicU64>,
        measured: Arc<AtomicU64>,
        fail: bool,
    }

    impl Synchronizer for Tally {
        fn synchronize(&mut self, ctx: &SyncContext<'_>) -> Result<(), SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if ctx.measuring() {
                self.measured.fetch_add(1, Ordering::SeqCst);
            }
            if self.fail {
                return Err(SyncError::MeasurementFailed {
                    reason: "cell locked".into(),
                });
            }
            Ok(())
        }

        fn reset(&mut self) {
            self.calls.store(0, Ordering::SeqCst);
        }
    }

    fn window(start: i64) -> StepWindow {
        StepWindow::starting_at(SimTime(start), 1_000).unwrap()
    }

    #[allow(clippy::type_complexity)]
    fn barrier(
        measurement: Option<MeasurementWindow>,
        fail: bool,
    ) -> (
        SyncBarrier,
        crossbeam_channel::Receiver<SchedulerMsg>,
        Arc<AtomicU64>,
        Arc<AtomicU64>,
        Arc<RunHealth>,
    ) {
        let (tx, rx) = unbounded();
        let calls = Arc::new(AtomicU64::new(0));
        let measured = Arc::new(AtomicU64::new(0));
        let health = Arc::new(RunHealth::default());
        let b = SyncBarrier::new(
            Arc::new(PhaseGate::new(PhaseToken::Sync, 1, tx)),
            Box::new(Tally {
                calls: Arc::clone(&calls),
                measured: Arc::clone(&measured),
                fail,
            }),
            measurement,
            Arc::clone(&health),
        );
        (b, rx, calls, measured, health)
    }

    #[test]
    fn measuring_follows_window_overlap() {
        let (b, _rx, _, _, _) = barrier(
            Some(MeasurementWindow {
                start_ms: 2_000,
                end_ms: 4_000,
            }),
            false,
        );
        assert!(!b.is_measuring(&window(1_000)));
        assert!(b.is_measuring(&window(2_000)));
        assert!(b.is_measuring(&window(3_000)));
        assert!(!b.is_measuring(&window(4_000)));
        let (always, _rx, _, _, _) = barrier(None, false);
        assert!(always.is_measuring(&window(-5_000)));
    }

    #[test]
    fn sync_thread_runs_once_per_go() {
        let (b, rx, calls, measured, _) = barrier(
            Some(MeasurementWindow {
                start_ms: 1_000,
                end_ms: 2_000,
            }),
            false,
        );
        b.initialize(Duration::from_secs(5)).unwrap();
        assert_eq!(rx.recv().unwrap(), SchedulerMsg::Ready(PhaseToken::Sync));
        for (i, start) in [0, 1_000, 2_000].into_iter().enumerate() {
            let g = b.arm(window(start), StepId(i as u64)).unwrap();
            assert_eq!(
                rx.recv_timeout(Duration::from_secs(5)).unwrap(),
                SchedulerMsg::Finished {
                    token: PhaseToken::Sync,
                    generation: g
                }
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(measured.load(Ordering::SeqCst), 1);
        b.close();
        for h in b.handles().take_all() {
            h.join().unwrap();
        }
        assert!(b.reset_synchronizer());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_synchronizer_still_completes_phase() {
        let (b, rx, calls, _, health) = barrier(None, true);
        b.initialize(Duration::from_secs(5)).unwrap();
        assert_eq!(rx.recv().unwrap(), SchedulerMsg::Ready(PhaseToken::Sync));
        let g = b.arm(window(0), StepId(0)).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            SchedulerMsg::Finished {
                token: PhaseToken::Sync,
                generation: g
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = health.snapshot();
        assert_eq!(snap.sync_failures, 1);
        assert!(snap.consistency_risk);
        b.close();
    }
}
