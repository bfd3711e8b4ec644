//! The simulated clock.
//!
//! Single writer: the scheduler advances it once per completed step while
//! holding its state lock. Everyone else sees copies of the current
//! [`StepWindow`] stamped into a barrier release.

use plume_core::{SimTime, StepWindow};

use crate::config::{dt_to_millis, ConfigError};

#[derive(Clone, Debug)]
pub(crate) struct Clock {
    start: SimTime,
    dt_ms: i64,
    window: StepWindow,
}

impl Clock {
    pub fn new(start: SimTime, dt_seconds: f64) -> Result<Self, ConfigError> {
        let dt_ms = dt_to_millis(dt_seconds).ok_or(ConfigError::InvalidDt { value: dt_seconds })?;
        let window = StepWindow::starting_at(start, dt_ms)
            .ok_or(ConfigError::InvalidDt { value: dt_seconds })?;
        Ok(Self {
            start,
            dt_ms,
            window,
        })
    }

    /// The window the next (or current) step covers.
    pub fn window(&self) -> StepWindow {
        self.window
    }

    pub fn dt_ms(&self) -> i64 {
        self.dt_ms
    }

    /// Move to the following window. Returns `false` once simulated time
    /// cannot advance any further.
    pub fn advance(&mut self) -> bool {
        match StepWindow::starting_at(self.window.end(), self.dt_ms) {
            Some(next) => {
                self.window = next;
                true
            }
            None => false,
        }
    }

    /// Change delta-time. The pending window keeps its start.
    pub fn set_dt(&mut self, dt_seconds: f64) -> Result<(), ConfigError> {
        let dt_ms = dt_to_millis(dt_seconds).ok_or(ConfigError::InvalidDt { value: dt_seconds })?;
        let window = StepWindow::starting_at(self.window.start(), dt_ms)
            .ok_or(ConfigError::InvalidDt { value: dt_seconds })?;
        self.dt_ms = dt_ms;
        self.window = window;
        Ok(())
    }

    /// Back to the first window.
    pub fn reset(&mut self) {
        if let Some(window) = StepWindow::starting_at(self.start, self.dt_ms) {
            self.window = window;
        }
    }
}
