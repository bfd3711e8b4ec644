//! Strongly-typed identifiers and the [`SimTime`] instant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// An instant in simulated time, in whole milliseconds.
///
/// Simulated time is independent of wall-clock time. The scheduler
/// advances it by one delta-time per completed step.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SimTime(pub i64);

impl SimTime {
    /// The zero instant.
    pub const ZERO: SimTime = SimTime(0);

    /// Construct from milliseconds.
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// Milliseconds since the simulated epoch.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Seconds since the simulated epoch, as a float.
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    /// Saturating addition of a millisecond offset.
    pub const fn saturating_add_millis(self, ms: i64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

impl Add<i64> for SimTime {
    type Output = SimTime;

    fn add(self, ms: i64) -> SimTime {
        SimTime(self.0 + ms)
    }
}

impl Sub for SimTime {
    type Output = i64;

    fn sub(self, rhs: SimTime) -> i64 {
        self.0 - rhs.0
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl From<i64> for SimTime {
    fn from(ms: i64) -> Self {
        Self(ms)
    }
}

/// Monotonically increasing step counter.
///
/// Incremented by the scheduler each time a full step (particle phase
/// followed by synchronization phase) completes. `StepId(0)` means no
/// step has completed yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub u64);

impl StepId {
    /// The following step.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StepId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Identifies a worker slot in the particle worker pool.
///
/// The slot survives thread replacement: a replacement worker takes over
/// the slot (and its heartbeat) of the thread it replaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Index of a deterministic random stream.
///
/// Within one particle phase, the n-th block handed out by the allocator
/// receives `StreamIndex(n)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamIndex(pub u32);

impl fmt::Display for StreamIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for StreamIndex {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_time_arithmetic() {
        let t = SimTime::from_millis(1_500);
        assert_eq!((t + 500).as_millis(), 2_000);
        assert_eq!(SimTime(2_000) - t, 500);
        assert!((t.as_secs_f64() - 1.5).abs() < f64::EPSILON);
        assert_eq!(SimTime(i64::MAX).saturating_add_millis(10), SimTime(i64::MAX));
    }

    #[test]
    fn step_id_next_is_monotonic() {
        let mut s = StepId::default();
        for expected in 1..=5 {
            s = s.next();
            assert_eq!(s, StepId(expected));
        }
    }

    #[test]
    fn display_formats() {
        assert_eq!(SimTime(42).to_string(), "42ms");
        assert_eq!(WorkerId(3).to_string(), "3");
        assert_eq!(StreamIndex(7).to_string(), "7");
    }
}
