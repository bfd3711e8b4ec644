//! Generation-counted rendezvous shared by both barrier variants.
//!
//! A [`PhaseGate`] coordinates a fixed number of member threads with the
//! scheduler:
//!
//! ```text
//! Scheduler                 PhaseGate                     Members (N)
//!     |                         |                              |
//!     |                         |<---------register(ticket)----|
//!     |<--Ready(token)----------| (N-th registration)          | parked
//!     |--go_next(window)------->| generation += 1, stamp       |
//!     |                         |--notify_all----------------->| run phase
//!     |                         |<------finish_phase(ticket)---|
//!     |<--Finished{token, gen}--| (N-th finish)                | parked
//! ```
//!
//! The window is stamped and the generation bumped under the gate lock
//! before anyone is woken, so no member can run a phase with a stale
//! window. Each member slot remembers the last generation it finished,
//! which makes duplicate finishes harmless and lets a replacement member
//! either join a running phase or wait for the next one.

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use plume_core::{StepId, StepWindow};

/// Which phase a barrier drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PhaseToken {
    /// The particle-movement phase (N workers).
    Particle,
    /// The synchronization phase (one sync thread).
    Sync,
}

impl fmt::Display for PhaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Particle => write!(f, "particle"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// Lifecycle of a barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BarrierLifecycle {
    /// Created, members not yet spawned.
    Uninitialized,
    /// Members spawned, waiting for all of them to register.
    Initializing,
    /// Every member registered; no phase has run yet.
    Ready,
    /// A phase is in progress.
    Running,
    /// The last phase completed; members wait for the next go.
    Suspended,
    /// Shut down; every member operation returns immediately.
    Closed,
}

impl fmt::Display for BarrierLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Scheduler mailbox messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SchedulerMsg {
    /// Every member of a barrier registered.
    Ready(PhaseToken),
    /// Every member finished the given generation.
    Finished { token: PhaseToken, generation: u64 },
    /// The user asked to start or resume.
    Start,
    /// Recovery restarted the scheduler; re-derive progress from the gates.
    Resync,
    /// Stop the scheduler thread.
    Shutdown,
}

/// What a member needs to run one phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Release {
    pub window: StepWindow,
    pub step: StepId,
    pub measuring: bool,
    pub generation: u64,
}

/// A member's identity: its slot plus the incarnation of that slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Ticket {
    pub slot: usize,
    pub incarnation: u64,
}

#[derive(Clone, Copy, Debug)]
struct MemberSlot {
    incarnation: u64,
    registered: bool,
    finished_generation: u64,
}

struct GateState {
    lifecycle: BarrierLifecycle,
    generation: u64,
    release: Option<Release>,
    members: Vec<MemberSlot>,
    registered: usize,
    finished: usize,
    completed_generation: u64,
    waiting: usize,
}

impl GateState {
    fn is_current(&self, ticket: &Ticket) -> bool {
        self.members
            .get(ticket.slot)
            .is_some_and(|m| m.incarnation == ticket.incarnation)
    }
}

/// Point-in-time copy of a gate's bookkeeping, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GateSnapshot {
    /// Phase this gate drives.
    pub token: PhaseToken,
    /// Lifecycle state.
    pub lifecycle: BarrierLifecycle,
    /// Generation of the most recent go.
    pub generation: u64,
    /// Last generation every member finished.
    pub completed_generation: u64,
    /// Members that finished the current generation.
    pub finished: usize,
    /// Members that registered.
    pub registered: usize,
    /// Members the gate waits for.
    pub expected: usize,
    /// Members currently parked in the gate.
    pub waiting: usize,
}

impl fmt::Display for GateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} barrier [{}] generation={} completed={} finished={}/{} registered={} waiting={}",
            self.token,
            self.lifecycle,
            self.generation,
            self.completed_generation,
            self.finished,
            self.expected,
            self.registered,
            self.waiting,
        )
    }
}

pub(crate) struct PhaseGate {
    token: PhaseToken,
    expected: usize,
    state: Mutex<GateState>,
    /// Members wait here for the next go.
    turn: Condvar,
    /// `await_ready` waits here for the last registration.
    ready: Condvar,
    mailbox: Sender<SchedulerMsg>,
}

// Compile-time assertion: PhaseGate must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<PhaseGate>();
};

impl PhaseGate {
    pub fn new(token: PhaseToken, expected: usize, mailbox: Sender<SchedulerMsg>) -> Self {
        Self {
            token,
            expected,
            state: Mutex::new(GateState {
                lifecycle: BarrierLifecycle::Uninitialized,
                generation: 0,
                release: None,
                members: vec![
                    MemberSlot {
                        incarnation: 0,
                        registered: false,
                        finished_generation: 0,
                    };
                    expected
                ],
                registered: 0,
                finished: 0,
                completed_generation: 0,
                waiting: 0,
            }),
            turn: Condvar::new(),
            ready: Condvar::new(),
            mailbox,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token(&self) -> PhaseToken {
        self.token
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Move to `Initializing` and hand out one ticket per slot.
    pub fn begin_initialize(&self) -> Vec<Ticket> {
        let mut st = self.lock();
        if st.lifecycle == BarrierLifecycle::Uninitialized {
            st.lifecycle = BarrierLifecycle::Initializing;
        }
        st.members
            .iter()
            .enumerate()
            .map(|(slot, m)| Ticket {
                slot,
                incarnation: m.incarnation,
            })
            .collect()
    }

    /// Member → gate: "I exist". Parks until the member has a phase to
    /// run. Returns `None` if the gate closed or the ticket is stale.
    pub fn register(&self, ticket: &Ticket) -> Option<Release> {
        let mut st = self.lock();
        if st.lifecycle == BarrierLifecycle::Closed || !st.is_current(ticket) {
            return None;
        }
        if !st.members[ticket.slot].registered {
            st.members[ticket.slot].registered = true;
            st.registered += 1;
            if st.registered == self.expected && st.lifecycle == BarrierLifecycle::Initializing {
                st.lifecycle = BarrierLifecycle::Ready;
                let _ = self.mailbox.send(SchedulerMsg::Ready(self.token));
                self.ready.notify_all();
            }
        }
        self.wait_for_release(st, ticket)
    }

    /// Member → gate: "my work for this phase is exhausted". Parks until
    /// the next go. Returns `None` if the gate closed or the ticket is
    /// stale.
    pub fn finish_phase(&self, ticket: &Ticket) -> Option<Release> {
        let mut st = self.lock();
        if st.lifecycle == BarrierLifecycle::Closed || !st.is_current(ticket) {
            return None;
        }
        let generation = st.generation;
        if generation > 0 && st.members[ticket.slot].finished_generation < generation {
            st.members[ticket.slot].finished_generation = generation;
            st.finished += 1;
            if st.finished >= self.expected {
                st.finished = 0;
                st.completed_generation = generation;
                st.lifecycle = BarrierLifecycle::Suspended;
                let _ = self.mailbox.send(SchedulerMsg::Finished {
                    token: self.token,
                    generation,
                });
            }
        } else {
            log::debug!(
                "{} barrier: ignoring duplicate finish from slot {} in generation {}",
                self.token,
                ticket.slot,
                generation
            );
        }
        self.wait_for_release(st, ticket)
    }

    fn wait_for_release(
        &self,
        mut st: MutexGuard<'_, GateState>,
        ticket: &Ticket,
    ) -> Option<Release> {
        st.waiting += 1;
        let release = loop {
            if st.lifecycle == BarrierLifecycle::Closed || !st.is_current(ticket) {
                break None;
            }
            if st.generation > st.members[ticket.slot].finished_generation {
                break st.release;
            }
            st = self.turn.wait(st).unwrap_or_else(PoisonError::into_inner);
        };
        st.waiting -= 1;
        release
    }

    /// Scheduler → gate: stamp the next phase and wake every member.
    /// Returns the new generation, or `None` if the gate is closed.
    pub fn go_next(&self, window: StepWindow, step: StepId, measuring: bool) -> Option<u64> {
        let mut st = self.lock();
        if st.lifecycle == BarrierLifecycle::Closed {
            return None;
        }
        st.generation += 1;
        let generation = st.generation;
        st.release = Some(Release {
            window,
            step,
            measuring,
            generation,
        });
        st.finished = 0;
        st.lifecycle = BarrierLifecycle::Running;
        self.turn.notify_all();
        Some(generation)
    }

    /// Block until every member registered or `timeout` elapses. On
    /// timeout returns how many did register.
    pub fn await_ready(&self, timeout: Duration) -> Result<(), usize> {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        loop {
            match st.lifecycle {
                BarrierLifecycle::Uninitialized | BarrierLifecycle::Initializing => {}
                BarrierLifecycle::Closed => return Err(st.registered),
                _ => return Ok(()),
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(st.registered);
            }
            st = self
                .ready
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Supersede the member in `slot`. The old ticket becomes stale (its
    /// thread is woken if parked and leaves); the new ticket inherits the
    /// slot's progress in the current generation.
    pub fn replace_member(&self, slot: usize) -> Option<Ticket> {
        let mut st = self.lock();
        if st.lifecycle == BarrierLifecycle::Closed {
            return None;
        }
        let member = st.members.get_mut(slot)?;
        member.incarnation += 1;
        let ticket = Ticket {
            slot,
            incarnation: member.incarnation,
        };
        self.turn.notify_all();
        Some(ticket)
    }

    /// Close the gate; every parked member wakes and leaves.
    pub fn close(&self) {
        let mut st = self.lock();
        st.lifecycle = BarrierLifecycle::Closed;
        self.turn.notify_all();
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().lifecycle == BarrierLifecycle::Closed
    }

    pub fn completed_generation(&self) -> u64 {
        self.lock().completed_generation
    }

    pub fn snapshot(&self) -> GateSnapshot {
        let st = self.lock();
        GateSnapshot {
            token: self.token,
            lifecycle: st.lifecycle,
            generation: st.generation,
            completed_generation: st.completed_generation,
            finished: st.finished,
            registered: st.registered,
            expected: self.expected,
            waiting: st.waiting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use plume_core::SimTime;
    use std::sync::Arc;
    use std::thread;

    fn window(start: i64) -> StepWindow {
        StepWindow::starting_at(SimTime(start), 1_000).unwrap()
    }

    fn gate(expected: usize) -> (Arc<PhaseGate>, Receiver<SchedulerMsg>) {
        let (tx, rx) = unbounded();
        (Arc::new(PhaseGate::new(PhaseToken::Particle, expected, tx)), rx)
    }

    #[test]
    fn registration_posts_ready_once() {
        let (gate, rx) = gate(3);
        let tickets = gate.begin_initialize();
        let handles: Vec<_> = tickets
            .into_iter()
            .map(|t| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.register(&t))
            })
            .collect();
        gate.await_ready(Duration::from_secs(5)).unwrap();
        assert_eq!(rx.recv().unwrap(), SchedulerMsg::Ready(PhaseToken::Particle));
        assert_eq!(gate.snapshot().lifecycle, BarrierLifecycle::Ready);

        let g = gate.go_next(window(0), StepId(0), false).unwrap();
        assert_eq!(g, 1);
        for h in handles {
            let release = h.join().unwrap().unwrap();
            assert_eq!(release.window, window(0));
            assert_eq!(release.generation, 1);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn finish_counts_to_expected() {
        let (gate, rx) = gate(2);
        let tickets = gate.begin_initialize();
        let workers: Vec<_> = tickets
            .into_iter()
            .map(|t| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || {
                    let first = gate.register(&t).unwrap();
                    let second = gate.finish_phase(&t).unwrap();
                    (first.window, second.window)
                })
            })
            .collect();
        gate.await_ready(Duration::from_secs(5)).unwrap();
        assert_eq!(rx.recv().unwrap(), SchedulerMsg::Ready(PhaseToken::Particle));
        gate.go_next(window(0), StepId(0), false);
        assert_eq!(
            rx.recv().unwrap(),
            SchedulerMsg::Finished {
                token: PhaseToken::Particle,
                generation: 1
            }
        );
        assert_eq!(gate.completed_generation(), 1);
        assert_eq!(gate.snapshot().lifecycle, BarrierLifecycle::Suspended);
        gate.go_next(window(1_000), StepId(1), false);
        for w in workers {
            assert_eq!(w.join().unwrap(), (window(0), window(1_000)));
        }
    }

    #[test]
    fn duplicate_finish_is_ignored() {
        let (gate, rx) = gate(2);
        let tickets = gate.begin_initialize();
        gate.mark_registered(&tickets);
        gate.go_next(window(0), StepId(0), false);
        let t0 = tickets[0];
        // Slot 0 finishes twice from two threads; only one counts.
        let a = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.finish_phase(&t0))
        };
        let b = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.finish_phase(&t0))
        };
        while gate.snapshot().waiting < 2 {
            thread::yield_now();
        }
        assert_eq!(gate.snapshot().finished, 1);
        assert!(rx.try_recv().is_err());
        gate.close();
        assert_eq!(a.join().unwrap(), None);
        assert_eq!(b.join().unwrap(), None);
    }

    #[test]
    fn stale_ticket_is_rejected() {
        let (gate, _rx) = gate(1);
        let tickets = gate.begin_initialize();
        let old = tickets[0];
        let new = gate.replace_member(0).unwrap();
        assert_ne!(old, new);
        assert!(!gate.is_current(&old));
        assert_eq!(gate.register(&old), None);
        assert_eq!(gate.finish_phase(&old), None);
    }

    #[test]
    fn replacement_joins_running_phase() {
        let (gate, rx) = gate(2);
        let tickets = gate.begin_initialize();
        gate.mark_registered(&tickets);
        gate.go_next(window(0), StepId(0), false);

        // Slot 0 finishes; slot 1 is "wedged" and gets replaced.
        let t0 = tickets[0];
        let finisher = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.finish_phase(&t0))
        };
        let replacement = gate.replace_member(1).unwrap();
        let release = gate.register(&replacement).unwrap();
        assert_eq!(release.generation, 1);
        assert_eq!(release.window, window(0));

        // The replacement's finish completes the generation.
        let (tx_done, rx_done) = unbounded();
        {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                let _ = tx_done.send(gate.finish_phase(&replacement));
            });
        }
        assert_eq!(
            rx.recv().unwrap(),
            SchedulerMsg::Finished {
                token: PhaseToken::Particle,
                generation: 1
            }
        );
        // The wedged original cannot finish anymore.
        assert_eq!(gate.finish_phase(&tickets[1]), None);
        gate.close();
        assert_eq!(finisher.join().unwrap(), None);
        assert_eq!(rx_done.recv().unwrap(), None);
    }

    #[test]
    fn replacement_after_finish_waits_for_next_go() {
        let (gate, _rx) = gate(1);
        let tickets = gate.begin_initialize();
        gate.mark_registered(&tickets);
        gate.go_next(window(0), StepId(0), false);
        let t0 = tickets[0];
        let original = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.finish_phase(&t0))
        };
        while gate.completed_generation() < 1 {
            thread::yield_now();
        }
        let replacement = gate.replace_member(0).unwrap();
        assert_eq!(original.join().unwrap(), None);
        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.register(&replacement))
        };
        while gate.snapshot().waiting < 1 {
            thread::yield_now();
        }
        gate.go_next(window(1_000), StepId(1), true);
        let release = waiter.join().unwrap().unwrap();
        assert_eq!(release.generation, 2);
        assert!(release.measuring);
    }

    #[test]
    fn await_ready_times_out() {
        let (gate, _rx) = gate(2);
        gate.begin_initialize();
        assert_eq!(gate.await_ready(Duration::from_millis(20)), Err(0));
    }

    #[test]
    fn close_releases_parked_members() {
        let (gate, _rx) = gate(1);
        let tickets = gate.begin_initialize();
        let t = tickets[0];
        let member = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.register(&t))
        };
        gate.await_ready(Duration::from_secs(5)).unwrap();
        gate.close();
        assert_eq!(member.join().unwrap(), None);
        assert!(gate.is_closed());
        assert_eq!(gate.go_next(window(0), StepId(0), false), None);
    }

    impl PhaseGate {
        /// Mark every slot registered without parking a thread.
        fn mark_registered(&self, tickets: &[Ticket]) {
            let mut st = self.lock();
            for t in tickets {
                st.members[t.slot].registered = true;
            }
            st.registered = tickets.len();
            st.lifecycle = BarrierLifecycle::Ready;
        }

        fn is_current(&self, ticket: &Ticket) -> bool {
            self.lock().is_current(ticket)
        }
    }
}
