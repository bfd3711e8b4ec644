//! Per-thread liveness state for barrier members and the scheduler.
//!
//! Every particle worker, the sync thread and the scheduler publish a
//! [`Heartbeat`]: what they are doing, a progress counter bumped once per
//! unit of work, when they entered the current block, and a cooperative
//! cancel flag. The watchdog reads them to tell a slow step from a wedged
//! one.
//!
//! A heartbeat belongs to a member *slot*, not to a thread. A replacement
//! thread takes over the slot's heartbeat; the `incarnation` field lets
//! the thread it replaced notice that it has been superseded.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// What a barrier member is currently doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// Spawned, not yet registered with its barrier.
    Registering,
    /// Parked in the barrier waiting for the next phase.
    Waiting,
    /// Between blocks, asking the allocator for work.
    Pulling,
    /// Inside a block, a synchronizer call, or a scheduler message.
    Busy,
    /// The thread has returned.
    Exited,
}

impl MemberState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Registering,
            1 => Self::Waiting,
            2 => Self::Pulling,
            3 => Self::Busy,
            _ => Self::Exited,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Registering => 0,
            Self::Waiting => 1,
            Self::Pulling => 2,
            Self::Busy => 3,
            Self::Exited => 4,
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registering => write!(f, "registering"),
            Self::Waiting => write!(f, "waiting"),
            Self::Pulling => write!(f, "pulling"),
            Self::Busy => write!(f, "busy"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// Liveness state of one member slot, padded to avoid false sharing.
///
/// 128-byte alignment covers both 64-byte (x86) and 128-byte (Apple
/// M-series) cache line sizes.
#[repr(align(128))]
pub(crate) struct Heartbeat {
    state: AtomicU8,
    progress: AtomicU64,
    /// Monotonic timestamp (nanos) when the current block started.
    busy_since_ns: AtomicU64,
    cancel: AtomicBool,
    incarnation: AtomicU64,
    slot: u32,
}

// Compile-time assertion: Heartbeat must be Send + Sync.
const _: fn() = || {
    fn assert<T: Send + Sync>() {}
    assert::<Heartbeat>();
};

impl Heartbeat {
    pub fn new(slot: u32) -> Self {
        Self {
            state: AtomicU8::new(MemberState::Registering.as_u8()),
            progress: AtomicU64::new(0),
            busy_since_ns: AtomicU64::new(monotonic_nanos()),
            cancel: AtomicBool::new(false),
            incarnation: AtomicU64::new(0),
            slot,
        }
    }

    pub fn state(&self) -> MemberState {
        MemberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: MemberState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Enter a block: record the start time, clear any stale cancel
    /// request, mark busy.
    pub fn begin_block(&self) {
        self.busy_since_ns.store(monotonic_nanos(), Ordering::Release);
        self.clear_cancel();
        self.set_state(MemberState::Busy);
    }

    pub fn record_progress(&self) {
        self.progress.fetch_add(1, Ordering::Release);
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Request cooperative cancellation (watchdog, recovery, shutdown).
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn clear_cancel(&self) {
        self.cancel.store(false, Ordering::Release);
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation.load(Ordering::Acquire)
    }

    pub fn set_incarnation(&self, incarnation: u64) {
        self.incarnation.store(incarnation, Ordering::Release);
    }

    pub fn snapshot(&self) -> HeartbeatSnapshot {
        let state = self.state();
        let busy_ms = (state == MemberState::Busy).then(|| {
            let since = self.busy_since_ns.load(Ordering::Acquire);
            monotonic_nanos().saturating_sub(since) / 1_000_000
        });
        HeartbeatSnapshot {
            slot: self.slot,
            state,
            progress: self.progress(),
            busy_ms,
            cancel_requested: self.is_cancelled(),
            incarnation: self.incarnation(),
        }
    }
}

/// Point-in-time copy of a member's heartbeat.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatSnapshot {
    /// Member slot.
    pub slot: u32,
    /// What the member was doing.
    pub state: MemberState,
    /// Units of work done so far.
    pub progress: u64,
    /// Milliseconds spent in the current block, if busy.
    pub busy_ms: Option<u64>,
    /// Whether cancellation was requested and not yet cleared.
    pub cancel_requested: bool,
    /// How many times the slot's thread has been replaced.
    pub incarnation: u64,
}

impl fmt::Display for HeartbeatSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {} [{}] progress={} incarnation={}",
            self.slot, self.state, self.progress, self.incarnation
        )?;
        if let Some(ms) = self.busy_ms {
            write!(f, " busy_for={ms}ms")?;
        }
        if self.cancel_requested {
            write!(f, " cancel-requested")?;
        }
        Ok(())
    }
}

/// Returns monotonic nanoseconds since an arbitrary process-local epoch.
///
/// NOT wall-clock time; only for relative duration comparisons.
pub(crate) fn monotonic_nanos() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    Instant::now().duration_since(*epoch).as_nanos() as u64
}
