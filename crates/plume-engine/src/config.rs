//! Simulation configuration, validation, and error types.
//!
//! [`SimulationConfig`] is the input for constructing a
//! [`Simulation`](crate::simulation::Simulation). It can be built in code
//! (every field has a default) or parsed from TOML with
//! [`from_toml_str`](SimulationConfig::from_toml_str).
//! [`validate()`](SimulationConfig::validate) checks structural invariants
//! at startup.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use plume_core::{FinishReason, MeasurementWindow, SimTime};
use serde::{Deserialize, Serialize};

use crate::allocator::AllocatorError;

// ── WatchdogConfig ─────────────────────────────────────────────────

/// Liveness watchdog and restart policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Whether the watchdog thread runs at all. Default: true.
    pub enabled: bool,
    /// Wall-clock interval between liveness checks, in ms. Default: 15000.
    pub poll_interval_ms: u64,
    /// Recoveries admitted within `restart_window_ms`. Default: 3.
    pub max_restarts: u32,
    /// Sliding window for the restart budget, in ms. Default: 600000.
    pub restart_window_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 15_000,
            max_restarts: 3,
            restart_window_ms: 600_000,
        }
    }
}

impl WatchdogConfig {
    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Restart window as a `Duration`.
    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }
}

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected during validation, construction or reconfiguration.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigError {
    /// Block size is zero.
    ZeroBlockSize,
    /// `dt_seconds` is NaN, infinite, non-positive, or rounds to 0 ms.
    InvalidDt {
        /// The invalid value.
        value: f64,
    },
    /// End time does not lie after start time.
    InvalidTimeRange {
        /// Configured start, in ms.
        start_ms: i64,
        /// Configured end, in ms.
        end_ms: i64,
    },
    /// Measurement window is empty or inverted.
    InvalidMeasurementWindow {
        /// Configured start, in ms.
        start_ms: i64,
        /// Configured end, in ms.
        end_ms: i64,
    },
    /// Init timeout is zero.
    ZeroInitTimeout,
    /// WatchdogConfig invariant violated.
    InvalidWatchdog {
        /// Description of which invariant was violated.
        reason: String,
    },
    /// Block size, seed or delta-time changed while a run is active.
    Running,
    /// A barrier's members did not all register in time.
    InitTimeout {
        /// Which barrier timed out.
        barrier: &'static str,
        /// Members that did register.
        registered: usize,
        /// Members the barrier waited for.
        expected: usize,
    },
    /// A background thread could not be spawned.
    ThreadSpawnFailed {
        /// Description of which thread failed.
        reason: String,
    },
    /// TOML input could not be parsed.
    Parse {
        /// Parser message.
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroBlockSize => write!(f, "block_size must be at least 1"),
            Self::InvalidDt { value } => {
                write!(f, "dt_seconds must be finite and at least 1ms, got {value}")
            }
            Self::InvalidTimeRange { start_ms, end_ms } => {
                write!(f, "end_time_ms {end_ms} must be after start_time_ms {start_ms}")
            }
            Self::InvalidMeasurementWindow { start_ms, end_ms } => {
                write!(f, "measurement window [{start_ms}, {end_ms}) is empty")
            }
            Self::ZeroInitTimeout => write!(f, "init_timeout_ms must be at least 1"),
            Self::InvalidWatchdog { reason } => write!(f, "invalid watchdog config: {reason}"),
            Self::Running => write!(f, "cannot reconfigure while the simulation is running"),
            Self::InitTimeout {
                barrier,
                registered,
                expected,
            } => write!(
                f,
                "{barrier} barrier initialization timed out ({registered}/{expected} registered)"
            ),
            Self::ThreadSpawnFailed { reason } => write!(f, "thread spawn failed: {reason}"),
            Self::Parse { reason } => write!(f, "config parse error: {reason}"),
        }
    }
}

impl Error for ConfigError {}

impl From<AllocatorError> for ConfigError {
    fn from(e: AllocatorError) -> Self {
        match e {
            AllocatorError::Running => Self::Running,
            AllocatorError::ZeroBlockSize => Self::ZeroBlockSize,
        }
    }
}

// ── ControlError ───────────────────────────────────────────────────

/// Errors from lifecycle control calls (`start`, `stop`, `reset`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlError {
    /// The simulation has been shut down.
    ShutDown,
    /// The run already ended; call `reset()` before starting again.
    Finished(FinishReason),
    /// The running step did not reach a pause point in time.
    Busy,
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShutDown => write!(f, "simulation has been shut down"),
            Self::Finished(reason) => write!(f, "simulation finished ({reason}); reset first"),
            Self::Busy => write!(f, "simulation did not pause in time"),
        }
    }
}

impl Error for ControlError {}

// ── SimulationConfig ───────────────────────────────────────────────

/// Complete configuration for a simulation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of particle worker threads. `None` = auto-detect
    /// (`available_parallelism`, clamped to `[1, 64]`).
    pub worker_count: Option<usize>,
    /// Particles per work block. Default: 256.
    pub block_size: usize,
    /// Simulated seconds per step. Default: 1.0.
    pub dt_seconds: f64,
    /// Global seed for every random stream. Default: 0.
    pub seed: u64,
    /// Simulated start time, in ms. Default: 0.
    pub start_time_ms: i64,
    /// Simulated end time, in ms. Default: 3600000 (one hour).
    pub end_time_ms: i64,
    /// Finish as soon as every particle has completed. Default: true.
    pub stop_on_completion: bool,
    /// Interval in which the synchronizer measures. `None` = always.
    pub measurement_window: Option<MeasurementWindow>,
    /// How long construction waits for every thread to register, in ms.
    /// Default: 5000.
    pub init_timeout_ms: u64,
    /// Watchdog settings.
    pub watchdog: WatchdogConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            block_size: 256,
            dt_seconds: 1.0,
            seed: 0,
            start_time_ms: 0,
            end_time_ms: 3_600_000,
            stop_on_completion: true,
            measurement_window: None,
            init_timeout_ms: 5_000,
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    ///
    /// The result is not validated; call [`validate()`](Self::validate)
    /// (the simulation constructor does).
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        toml::from_str(input).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    /// Resolve the actual worker count, applying auto-detection if `None`.
    ///
    /// Explicit values are clamped to `[1, 64]`.
    pub fn resolved_worker_count(&self) -> usize {
        match self.worker_count {
            Some(n) => n.clamp(1, 64),
            None => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .clamp(1, 64),
        }
    }

    /// Delta-time in whole milliseconds, or `None` if invalid.
    pub fn dt_millis(&self) -> Option<i64> {
        dt_to_millis(self.dt_seconds)
    }

    /// Simulated start time.
    pub fn start_time(&self) -> SimTime {
        SimTime(self.start_time_ms)
    }

    /// Simulated end time.
    pub fn end_time(&self) -> SimTime {
        SimTime(self.end_time_ms)
    }

    /// Init timeout as a `Duration`.
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    /// Validate all structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // 1. Block size >= 1.
        if self.block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        // 2. dt must survive the conversion to whole milliseconds.
        if self.dt_millis().is_none() {
            return Err(ConfigError::InvalidDt {
                value: self.dt_seconds,
            });
        }
        // 3. Non-empty simulated interval.
        if self.end_time_ms <= self.start_time_ms {
            return Err(ConfigError::InvalidTimeRange {
                start_ms: self.start_time_ms,
                end_ms: self.end_time_ms,
            });
        }
        // 4. Measurement window, if present, is non-empty.
        if let Some(m) = self.measurement_window {
            if m.end_ms <= m.start_ms {
                return Err(ConfigError::InvalidMeasurementWindow {
                    start_ms: m.start_ms,
                    end_ms: m.end_ms,
                });
            }
        }
        // 5. Registration must be given some time.
        if self.init_timeout_ms == 0 {
            return Err(ConfigError::ZeroInitTimeout);
        }
        // 6. Watchdog invariants.
        let w = &self.watchdog;
        if w.enabled && w.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidWatchdog {
                reason: "poll_interval_ms must be at least 1".to_string(),
            });
        }
        if w.restart_window_ms == 0 {
            return Err(ConfigError::InvalidWatchdog {
                reason: "restart_window_ms must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Convert seconds to whole milliseconds. `None` unless the result is at
/// least 1ms and finite.
pub(crate) fn dt_to_millis(dt_seconds: f64) -> Option<i64> {
    if !dt_seconds.is_finite() || dt_seconds <= 0.0 {
        return None;
    }
    let ms = (dt_seconds * 1000.0).round();
    (ms >= 1.0 && ms < i64::MAX as f64).then_some(ms as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = SimulationConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.block_size, 256);
        assert_eq!(cfg.dt_millis(), Some(1_000));
        assert!(cfg.stop_on_completion);
        assert_eq!(cfg.watchdog.poll_interval_ms, 15_000);
    }

    #[test]
    fn resolved_worker_count_clamps() {
        let mut cfg = SimulationConfig {
            worker_count: Some(0),
            ..Default::default()
        };
        assert_eq!(cfg.resolved_worker_count(), 1);
        cfg.worker_count = Some(1_000);
        assert_eq!(cfg.resolved_worker_count(), 64);
        cfg.worker_count = None;
        let auto = cfg.resolved_worker_count();
        assert!((1..=64).contains(&auto));
    }

    #[test]
    fn rejects_zero_block_size() {
        let cfg = SimulationConfig {
            block_size: 0,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroBlockSize));
    }

    #[test]
    fn rejects_bad_dt() {
        for value in [0.0, -1.0, f64::NAN, f64::INFINITY, 0.0004] {
            let cfg = SimulationConfig {
                dt_seconds: value,
                ..Default::default()
            };
            assert!(
                matches!(cfg.validate(), Err(ConfigError::InvalidDt { .. })),
                "dt {value} should be rejected"
            );
        }
        assert_eq!(dt_to_millis(0.0005), Some(1));
        assert_eq!(dt_to_millis(2.5), Some(2_500));
    }

    #[test]
    fn rejects_inverted_time_range() {
        let cfg = SimulationConfig {
            start_time_ms: 10,
            end_time_ms: 10,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::InvalidTimeRange {
                start_ms: 10,
                end_ms: 10
            })
        );
    }

    #[test]
    fn rejects_empty_measurement_window() {
        let cfg = SimulationConfig {
            measurement_window: Some(MeasurementWindow {
                start_ms: 5,
                end_ms: 5,
            }),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidMeasurementWindow { .. })
        ));
    }

    #[test]
    fn rejects_zero_poll_interval_only_when_enabled() {
        let mut cfg = SimulationConfig::default();
        cfg.watchdog.poll_interval_ms = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidWatchdog { .. })
        ));
        cfg.watchdog.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml() {
        let cfg = SimulationConfig::from_toml_str(
            r#"
            worker_count = 4
            block_size = 100
            dt_seconds = 0.5
            seed = 42
            end_time_ms = 60000

            [measurement_window]
            start_ms = 1000
            end_ms = 2000

            [watchdog]
            poll_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.worker_count, Some(4));
        assert_eq!(cfg.block_size, 100);
        assert_eq!(cfg.dt_millis(), Some(500));
        assert_eq!(cfg.seed, 42);
        assert_eq!(
            cfg.measurement_window,
            Some(MeasurementWindow {
                start_ms: 1_000,
                end_ms: 2_000
            })
        );
        assert_eq!(cfg.watchdog.poll_interval_ms, 250);
        assert_eq!(cfg.watchdog.max_restarts, 3);
        assert!(cfg.stop_on_completion);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn toml_parse_error_is_reported() {
        let err = SimulationConfig::from_toml_str("block_size = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().starts_with("config parse error"));
    }

    #[test]
    fn allocator_errors_map_to_config_errors() {
        assert_eq!(
            ConfigError::from(AllocatorError::Running),
            ConfigError::Running
        );
        assert_eq!(
            ConfigError::from(AllocatorError::ZeroBlockSize),
            ConfigError::ZeroBlockSize
        );
    }
}
