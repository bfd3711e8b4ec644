//! The simulated time interval covered by one step.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::SimTime;

/// Half-open simulated interval `[start, end)` covered by the current step.
///
/// Invariant: `end > start`. Consecutive windows are contiguous: the start
/// of step *n+1* equals the end of step *n*.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StepWindow {
    start: SimTime,
    end: SimTime,
}

impl StepWindow {
    /// Create a window, returning `None` if `end <= start`.
    pub fn new(start: SimTime, end: SimTime) -> Option<Self> {
        (end > start).then_some(Self { start, end })
    }

    /// Window of `len_ms` starting at `start`. `len_ms` must be positive.
    pub fn starting_at(start: SimTime, len_ms: i64) -> Option<Self> {
        Self::new(start, start.saturating_add_millis(len_ms))
    }

    /// Inclusive start of the window.
    pub fn start(&self) -> SimTime {
        self.start
    }

    /// Exclusive end of the window.
    pub fn end(&self) -> SimTime {
        self.end
    }

    /// Length in milliseconds. Always positive.
    pub fn len_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Length in seconds.
    pub fn dt_seconds(&self) -> f64 {
        self.len_ms() as f64 / 1000.0
    }

    /// The window that immediately follows this one with the same length.
    pub fn following(&self) -> Self {
        let len = self.len_ms();
        Self {
            start: self.end,
            end: self.end.saturating_add_millis(len),
        }
    }

    /// Whether `t` lies inside `[start, end)`.
    pub fn contains(&self, t: SimTime) -> bool {
        t >= self.start && t < self.end
    }

    /// Whether this window overlaps `[start, end)` of a measurement window.
    pub fn overlaps(&self, other: &MeasurementWindow) -> bool {
        self.start < other.end() && other.start() < self.end
    }
}

impl fmt::Display for StepWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Simulated interval during which the synchronization thread measures.
///
/// Outside this interval the sync phase still runs (it is part of the
/// two-phase protocol) but reports `measuring = false`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementWindow {
    /// Inclusive start, in simulated milliseconds.
    pub start_ms: i64,
    /// Exclusive end, in simulated milliseconds.
    pub end_ms: i64,
}

impl MeasurementWindow {
    /// Inclusive start.
    pub fn start(&self) -> SimTime {
        SimTime(self.start_ms)
    }

    /// Exclusive end.
    pub fn end(&self) -> SimTime {
        SimTime(self.end_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_or_inverted() {
        assert!(StepWindow::new(SimTime(10), SimTime(10)).is_none());
        assert!(StepWindow::new(SimTime(10), SimTime(5)).is_none());
        assert!(StepWindow::starting_at(SimTime(0), 0).is_none());
        assert!(StepWindow::starting_at(SimTime(0), -5).is_none());
    }

    #[test]
    fn following_windows_are_contiguous() {
        let mut w = StepWindow::starting_at(SimTime(0), 250).unwrap();
        for _ in 0..10 {
            let next = w.following();
            assert_eq!(next.start(), w.end());
            assert_eq!(next.len_ms(), 250);
            w = next;
        }
        assert_eq!(w.start(), SimTime(2_500));
    }

    #[test]
    fn overlap_with_measurement_window() {
        let m = MeasurementWindow {
            start_ms: 1_000,
            end_ms: 2_000,
        };
        let before = StepWindow::new(SimTime(0), SimTime(1_000)).unwrap();
        let inside = StepWindow::new(SimTime(900), SimTime(1_100)).unwrap();
        let after = StepWindow::new(SimTime(2_000), SimTime(3_000)).unwrap();
        assert!(!before.overlaps(&m));
        assert!(inside.overlaps(&m));
        assert!(!after.overlaps(&m));
    }

    #[test]
    fn dt_seconds_matches_len() {
        let w = StepWindow::starting_at(SimTime(0), 1_500).unwrap();
        assert!((w.dt_seconds() - 1.5).abs() < 1e-12);
        assert!(w.contains(SimTime(0)));
        assert!(!w.contains(SimTime(1_500)));
    }
}
