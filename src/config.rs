//! Environment-driven configuration.
//!
//! Every tunable of the coordinator is read from a `CACHE_*` environment
//! variable with a built-in default, matching the deployment convention of
//! the storage system this crate plugs into:
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `CACHE_PROFILER_BUCKET_SIZE` | 10 | Histogram bucket width (reuse-time units) |
//! | `CACHE_PROFILER_MAX_REUSE_DIST` | 100000 | Largest reuse time tracked exactly |
//! | `CACHE_PROFILER_SAMPLING_INTERVAL` | 1 | 1 = track every key; N = ~1/N sampling |
//! | `CACHE_TUNING_INTERVAL` | 100000 | Accesses per cache between tune attempts |
//! | `CACHE_TOTAL_SIZE` | 33554432 | Global byte budget |
//! | `CACHE_MIN_SIZE` | 2097152 | Per-cache byte floor |
//! | `CACHE_TUNING_UNIT` | 1024 | Transfer granularity in bytes |
//! | `CACHE_TUNING_STRATEGY` | `min_mc_random_greedy` | Strategy name |
//! | `CACHE_PROFLER_CLEAR` | true | Reset stats and profiling after each tune |
//! | `CACHE_REPORT_INTERVAL` | 10000 | Update batches between per-cache stat lines |
//! | `CACHE_STABLE_STEPS` | 5 | No-improve tunes before sampling is suspended |
//! | `CACHE_SHARD_SHIFT` | 0 | ShardedLRU shard count = `1 << shift` |
//! | `CACHE_TUNE_LOOP_MILLIS` | 1000 | Tune worker sleep between iterations |
//!
//! Unparsable values fall back to the default with a warning; a negative
//! value where only non-negative makes sense is a construction error and
//! terminates the process.

use std::env;

use tracing::warn;

/// Reads a `u64` from the environment, falling back to `default` when the
/// variable is unset or unparsable.
pub fn read_u64_env(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(v) if v >= 0 => v as u64,
            Ok(v) => {
                panic!("{name}={v} is negative; expected a non-negative integer");
            },
            Err(_) => {
                warn!(var = name, value = %raw, fallback = default, "unparsable value, using default");
                default
            },
        },
        Err(_) => default,
    }
}

/// Reads a `usize` from the environment with the same fallback rules as
/// [`read_u64_env`].
pub fn read_usize_env(name: &str, default: usize) -> usize {
    read_u64_env(name, default as u64) as usize
}

/// Reads a boolean (`true`/`false`/`1`/`0`, case-insensitive) from the
/// environment, falling back to `default` otherwise.
pub fn read_bool_env(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => {
                warn!(var = name, value = %raw, fallback = default, "unparsable value, using default");
                default
            },
        },
        Err(_) => default,
    }
}

/// Reads a string from the environment, falling back to `default`.
pub fn read_string_env(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Reads the ShardedLRU shard shift. Negative values are a construction
/// error and terminate the process.
pub fn read_shard_shift() -> u32 {
    match env::var("CACHE_SHARD_SHIFT") {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(v) if (0..=16).contains(&v) => v as u32,
            Ok(v) => panic!("invalid argument shard_shift={v} when constructing ShardedLruCache"),
            Err(_) => {
                warn!(value = %raw, "unparsable CACHE_SHARD_SHIFT, using 0");
                0
            },
        },
        Err(_) => 0,
    }
}

/// Profiler construction parameters, read once per profiled cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfilerConfig {
    /// Histogram bucket width, in reuse-time units.
    pub bucket_size: usize,
    /// Upper bound of exactly-tracked reuse times; larger go to the tail bucket.
    pub max_reuse_time: usize,
    /// 1 tracks every access; N > 1 samples untracked keys with probability 1/N.
    pub sampling_interval: u64,
}

impl ProfilerConfig {
    pub fn from_env() -> Self {
        Self {
            bucket_size: read_usize_env("CACHE_PROFILER_BUCKET_SIZE", 10).max(1),
            max_reuse_time: read_usize_env("CACHE_PROFILER_MAX_REUSE_DIST", 100_000),
            sampling_interval: read_u64_env("CACHE_PROFILER_SAMPLING_INTERVAL", 1).max(1),
        }
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            bucket_size: 10,
            max_reuse_time: 100_000,
            sampling_interval: 1,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Accesses per registered cache between tune attempts.
    pub tuning_interval: u64,
    /// Global byte budget shared by all registered caches.
    pub total_size: usize,
    /// Per-cache byte floor the strategy may never cross.
    pub min_size: usize,
    /// Smallest capacity quantum moved by a greedy transfer, in bytes.
    pub tuning_unit: usize,
    /// Strategy name; unknown names fall back to the default strategy.
    pub tuning_strategy: String,
    /// Reset hit/miss stats and profiling state after each tune pass.
    pub clear_stat: bool,
    /// Consecutive no-improvement tunes before sampling is suspended.
    pub stable_steps: u64,
    /// Tune worker sleep between loop iterations, in milliseconds.
    pub tune_loop_millis: u64,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            tuning_interval: read_u64_env("CACHE_TUNING_INTERVAL", 100_000),
            total_size: read_usize_env("CACHE_TOTAL_SIZE", 32 * 1024 * 1024),
            min_size: read_usize_env("CACHE_MIN_SIZE", 2048 * 128 * 8),
            tuning_unit: read_usize_env("CACHE_TUNING_UNIT", 8 * 128),
            tuning_strategy: read_string_env("CACHE_TUNING_STRATEGY", "min_mc_random_greedy"),
            // Historical spelling; existing deployments set CACHE_PROFLER_CLEAR.
            clear_stat: read_bool_env("CACHE_PROFLER_CLEAR", true),
            stable_steps: read_u64_env("CACHE_STABLE_STEPS", 5),
            tune_loop_millis: read_u64_env("CACHE_TUNE_LOOP_MILLIS", 1000),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tuning_interval: 100_000,
            total_size: 32 * 1024 * 1024,
            min_size: 2048 * 128 * 8,
            tuning_unit: 8 * 128,
            tuning_strategy: "min_mc_random_greedy".to_string(),
            clear_stat: true,
            stable_steps: 5,
            tune_loop_millis: 1000,
        }
    }
}

/// Per-cache report cadence: update batches between statistics log lines.
pub fn report_interval() -> u64 {
    read_u64_env("CACHE_REPORT_INTERVAL", 10_000).max(1)
}
