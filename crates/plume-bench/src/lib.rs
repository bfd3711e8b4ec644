//! Benchmark profiles for the Plume scheduling core.
//!
//! Provides pre-built [`SimulationConfig`] profiles and matching particle
//! pools for benchmarks:
//!
//! - [`reference_profile`]: 10K particles released in 20 waves
//! - [`stress_profile`]: 100K particles, larger blocks
//! - [`release_schedule`]: deterministic, sorted release times

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;

use plume_core::ParticlePool;
use plume_engine::{SimulationConfig, WatchdogConfig};
use plume_test_utils::TestParticle;

/// Shared particle pool of a profile.
pub type Pool = Arc<ParticlePool<TestParticle>>;

/// Simulated seconds per step in every profile.
pub const DT_SECONDS: f64 = 1.0;

/// Reference profile: 10K particles, block size 256, watchdog off.
///
/// Releases finish at step 19; the run is long enough that the tail of
/// every benchmark iteration moves the whole pool.
pub fn reference_profile(seed: u64, workers: usize) -> (SimulationConfig, Pool) {
    let config = profile_config(seed, workers, 256, 1_000_000);
    (config, pool(10_000, 20))
}

/// Stress profile: 100K particles, block size 1024.
pub fn stress_profile(seed: u64, workers: usize) -> (SimulationConfig, Pool) {
    let config = profile_config(seed, workers, 1_024, 1_000_000);
    (config, pool(100_000, 20))
}

fn profile_config(seed: u64, workers: usize, block_size: usize, end_ms: i64) -> SimulationConfig {
    SimulationConfig {
        worker_count: Some(workers),
        block_size,
        dt_seconds: DT_SECONDS,
        seed,
        end_time_ms: end_ms,
        stop_on_completion: false,
        watchdog: WatchdogConfig {
            enabled: false,
            ..WatchdogConfig::default()
        },
        ..SimulationConfig::default()
    }
}

fn pool(n: usize, waves: usize) -> Pool {
    Arc::new(ParticlePool::new(
        release_schedule(n, waves)
            .into_iter()
            .enumerate()
            .map(|(id, ms)| TestParticle::new(id, ms))
            .collect(),
    ))
}

/// Release times for `n` particles spread over `waves` one-second waves.
///
/// Wave sizes vary so block boundaries do not line up with release
/// boundaries. The result is sorted.
pub fn release_schedule(n: usize, waves: usize) -> Vec<i64> {
    let waves = waves.max(1);
    let mut times: Vec<i64> = (0..n)
        .map(|i| {
            let h = (i as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 33;
            (h % waves as u64) as i64 * (DT_SECONDS * 1000.0) as i64
        })
        .collect();
    times.sort_unstable();
    times
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_profile_validates() {
        let (config, pool) = reference_profile(42, 4);
        config.validate().unwrap();
        assert_eq!(pool.len(), 10_000);
    }

    #[test]
    fn stress_profile_validates() {
        let (config, pool) = stress_profile(42, 8);
        config.validate().unwrap();
        assert_eq!(pool.len(), 100_000);
    }

    #[test]
    fn release_schedule_is_sorted_and_bounded() {
        let times = release_schedule(5_000, 20);
        assert_eq!(times.len(), 5_000);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(times[0], 0);
        assert!(*times.last().unwrap() <= 19_000);
    }

    #[test]
    fn release_schedule_deterministic() {
        assert_eq!(release_schedule(100, 7), release_schedule(100, 7));
    }
}
