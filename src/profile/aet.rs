//! # Sampling AET Profiler
//!
//! Estimates the miss ratio a hypothetical LRU of any size would see on
//! this cache's access stream, using reuse distances collected online.
//!
//! ## Sampling
//!
//! A concurrent last-access map remembers, per sampled key, the logical
//! timestamp of its previous reference (`0` = slot present but not
//! currently tracked). Every reference draws a fresh timestamp from an
//! atomic counter:
//!
//! ```text
//!   ReferenceKey(k):
//!     ts = ++timestamp
//!     slot = last_access[k]
//!     absent or untracked ──► with prob 1/sampling_interval:
//!                               start tracking at ts, record distance 0
//!     tracked at old_ts   ──► record d = ts - old_ts
//!                             interval == 1 ? keep tracking (slot := ts)
//!                                           : stop tracking (slot := 0)
//! ```
//!
//! Distances land in a fixed histogram: bucket 0 for first sight under
//! full tracking, `(d-1)/bucket_size + 1` for `0 < d ≤ max_reuse_time`,
//! and a tail bucket beyond that. All counters are atomic fetch-adds.
//!
//! ## Quiescence
//!
//! `reset_profiling` / `stop_sampling_and_release` set a run-lock and
//! busy-wait for the active-referencer count to reach zero before touching
//! the structures; referencers observing the run-lock return without
//! mutating anything. `get_mrc` holds the referencer count up during its
//! read so the arrays cannot be released mid-computation.
//!
//! ## MRC
//!
//! From histogram `H` with total mass `N`: the reuse-time CCDF
//! `G[i] = (N − Σ_{j≤i} H[j]) / N` integrates into the average eviction
//! time; walking the integral and emitting `G` at each whole bucket of
//! cache size yields the miss-ratio curve. The curve is non-increasing,
//! starts at 1.0, has its trailing plateau trimmed, and carries the
//! snapshot timestamp as its final element.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tracing::info;

use crate::config::ProfilerConfig;
use crate::traits::{CacheKey, CacheMrcProfiler, MrcFeeder, TunableCache};

struct ProfilerState<K> {
    hist: Vec<AtomicU64>,
    last_access: DashMap<K, AtomicU64>,
}

impl<K: CacheKey> ProfilerState<K> {
    fn new(hist_len: usize) -> Self {
        Self {
            hist: (0..hist_len).map(|_| AtomicU64::new(0)).collect(),
            last_access: DashMap::new(),
        }
    }
}

/// Online reuse-distance profiler for one cache. See the module docs.
pub struct SamplingAetProfiler<K: CacheKey> {
    name: String,
    bucket_size: usize,
    max_reuse_time: usize,
    sampling_interval: u64,
    sampling_rate: f64,

    timestamp: AtomicU64,
    run_lock: AtomicBool,
    active: AtomicUsize,
    state: RwLock<Option<ProfilerState<K>>>,

    tunable: Arc<dyn TunableCache>,
}

impl<K: CacheKey> SamplingAetProfiler<K> {
    pub fn new(
        name: impl Into<String>,
        config: ProfilerConfig,
        tunable: Arc<dyn TunableCache>,
    ) -> Self {
        let bucket_size = config.bucket_size.max(1);
        let sampling_interval = config.sampling_interval.max(1);
        let hist_len = config.max_reuse_time / bucket_size + 3;
        Self {
            name: name.into(),
            bucket_size,
            max_reuse_time: config.max_reuse_time,
            sampling_interval,
            sampling_rate: 1.0 / sampling_interval as f64,
            timestamp: AtomicU64::new(0),
            run_lock: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            state: RwLock::new(Some(ProfilerState::new(hist_len))),
            tunable,
        }
    }

    fn hist_len(&self) -> usize {
        self.max_reuse_time / self.bucket_size + 3
    }

    /// Current logical timestamp: total references recorded.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    fn should_sample(&self) -> bool {
        self.sampling_interval == 1 || rand::thread_rng().gen::<f64>() <= self.sampling_rate
    }

    fn increase_histogram(&self, state: &ProfilerState<K>, time: u64) {
        let bucket = if time > self.max_reuse_time as u64 {
            state.hist.len() - 1
        } else if time == 0 {
            0
        } else {
            (time as usize - 1) / self.bucket_size + 1
        };
        state.hist[bucket].fetch_add(1, Ordering::Relaxed);
    }

    fn do_reference(&self, state: &ProfilerState<K>, key: K) {
        let ts = self.timestamp.fetch_add(1, Ordering::Relaxed) + 1;
        let reuse_dist;

        let tracked_at = state
            .last_access
            .get(&key)
            .map(|slot| slot.value().load(Ordering::Relaxed));
        match tracked_at {
            None | Some(0) => {
                if !self.should_sample() {
                    return;
                }
                match tracked_at {
                    // Untracked slot: resume tracking from now.
                    Some(0) if self.sampling_interval != 1 => {
                        if let Some(slot) = state.last_access.get(&key) {
                            let _ = slot.value().compare_exchange(
                                0,
                                ts,
                                Ordering::Relaxed,
                                Ordering::Relaxed,
                            );
                        }
                    },
                    // Fresh sample; a racing insert wins and ours is dropped.
                    _ => {
                        state
                            .last_access
                            .entry(key)
                            .or_insert_with(|| AtomicU64::new(ts));
                    },
                }
                reuse_dist = 0;
            },
            Some(old_ts) => {
                reuse_dist = ts.saturating_sub(old_ts);
                let next = if self.sampling_interval == 1 { ts } else { 0 };
                if let Some(slot) = state.last_access.get(&key) {
                    let _ = slot.value().compare_exchange(
                        old_ts,
                        next,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                }
            },
        }

        if reuse_dist > 0 || self.sampling_interval == 1 {
            self.increase_histogram(state, reuse_dist);
        }
    }

    /// Quiesces referencers: returns `false` if the run-lock was already
    /// held, otherwise takes it and spins until no referencer is active.
    fn quiesce(&self) -> bool {
        if self.run_lock.swap(true, Ordering::AcqRel) {
            return false;
        }
        while self.active.load(Ordering::Acquire) != 0 {
            std::hint::spin_loop();
        }
        true
    }

    fn compute_mrc(&self, state: &ProfilerState<K>, max_cache_size: usize) -> Vec<f64> {
        let num_elem = state.hist.len();
        let hist: Vec<u64> = state
            .hist
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .collect();
        let timestamp = self.timestamp.load(Ordering::Relaxed);

        // Total tracked mass: under full tracking every live slot is one
        // in-flight sample; under coarser sampling bucket 0 carries the
        // first-sight count.
        let mut reuse_time_sum: u64 = if self.sampling_interval == 1 {
            state
                .last_access
                .iter()
                .filter(|slot| slot.value().load(Ordering::Relaxed) != 0)
                .count() as u64
        } else {
            hist[0]
        };

        let mut prefix_sum = Vec::with_capacity(num_elem);
        prefix_sum.push(0u64);
        for (i, &mass) in hist.iter().enumerate().skip(1) {
            prefix_sum.push(prefix_sum[i - 1] + mass);
            reuse_time_sum += mass;
        }
        prefix_sum.pop();

        if reuse_time_sum == 0 {
            return vec![1.0, timestamp as f64];
        }

        let mut prob_greater = Vec::with_capacity(num_elem - 1);
        prob_greater.push(1.0);
        for &prefix in prefix_sum.iter().take(num_elem - 1).skip(1) {
            prob_greater.push((reuse_time_sum - prefix) as f64 / reuse_time_sum as f64);
        }

        // Integrate the CCDF; emit the miss ratio at every whole bucket of
        // cache size until the curve runs out of mass.
        let num_mrc_elem = max_cache_size / self.bucket_size + 1;
        let mut result = Vec::with_capacity(num_mrc_elem + 1);
        let mut integral = 0f64;
        let mut t = 0usize;
        for c in 0..num_mrc_elem as u64 {
            while integral < c as f64 && t < num_elem - 1 {
                integral += prob_greater[t];
                t += 1;
            }
            result.push(prob_greater[t.saturating_sub(1)]);
            if t >= num_elem - 1 {
                break;
            }
        }

        while result.len() > 2 {
            let s = result.len() - 1;
            if result[s] == result[s - 1] {
                result.pop();
            } else {
                break;
            }
        }

        result.push(timestamp as f64);
        result[0] = 1.0;
        result
    }
}

impl<K: CacheKey> MrcFeeder<K> for SamplingAetProfiler<K> {
    fn reference_key(&self, key: K) {
        self.reference_key_batch(std::slice::from_ref(&key));
    }

    fn reference_key_batch(&self, keys: &[K]) {
        // Resetting in progress: skip rather than block the workload.
        if self.run_lock.load(Ordering::Acquire) {
            return;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        if self.run_lock.load(Ordering::Acquire) {
            self.active.fetch_sub(1, Ordering::Release);
            return;
        }
        {
            let guard = self.state.read();
            if let Some(state) = guard.as_ref() {
                for &key in keys {
                    self.do_reference(state, key);
                }
            }
        }
        self.active.fetch_sub(1, Ordering::Release);
    }
}

impl<K: CacheKey> TunableCache for SamplingAetProfiler<K> {
    fn cache_size(&self) -> usize {
        self.tunable.cache_size()
    }

    fn set_cache_size(&self, new_size: usize) {
        self.tunable.set_cache_size(new_size);
    }

    fn cache_entry_size(&self) -> usize {
        self.tunable.cache_entry_size()
    }

    fn hit_rate(&self) -> f64 {
        self.tunable.hit_rate()
    }

    fn reset_stat(&self) {
        self.tunable.reset_stat();
    }

    fn move_count(&self) -> (u64, u64) {
        self.tunable.move_count()
    }

    fn reset_move_count(&self) {
        self.tunable.reset_move_count();
    }
}

impl<K: CacheKey> CacheMrcProfiler for SamplingAetProfiler<K> {
    fn get_mrc(&self, max_cache_size: usize) -> Vec<f64> {
        if self.run_lock.load(Ordering::Acquire) {
            return vec![1.0, self.timestamp() as f64];
        }
        // Hold the referencer count up so the arrays cannot be released
        // while we read them.
        self.active.fetch_add(1, Ordering::AcqRel);
        if self.run_lock.load(Ordering::Acquire) {
            self.active.fetch_sub(1, Ordering::Release);
            return vec![1.0, self.timestamp() as f64];
        }
        let result = {
            let guard = self.state.read();
            match guard.as_ref() {
                Some(state) => self.compute_mrc(state, max_cache_size),
                None => vec![1.0, self.timestamp() as f64],
            }
        };
        self.active.fetch_sub(1, Ordering::Release);
        result
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn reset_profiling(&self) {
        if !self.quiesce() {
            return;
        }
        {
            let mut guard = self.state.write();
            if let Some(state) = guard.as_ref() {
                info!(
                    profiler = %self.name,
                    tracked = state.last_access.len(),
                    "resetting last-access map"
                );
            }
            *guard = Some(ProfilerState::new(self.hist_len()));
        }
        self.timestamp.store(0, Ordering::Relaxed);
        self.run_lock.store(false, Ordering::Release);
    }

    fn bucket_size(&self) -> usize {
        self.bucket_size
    }

    fn stop_sampling_and_release(&self) {
        if !self.quiesce() {
            return;
        }
        {
            let mut guard = self.state.write();
            *guard = None;
        }
        self.timestamp.store(0, Ordering::Relaxed);
        // Run-lock stays held: referencers keep early-returning until
        // start_sampling reallocates.
        info!(profiler = %self.name, "sampling stopped, resources released");
    }

    fn start_sampling(&self) {
        if !self.run_lock.load(Ordering::Acquire) {
            // Already sampling.
            return;
        }
        {
            let mut guard = self.state.write();
            if guard.is_none() {
                *guard = Some(ProfilerState::new(self.hist_len()));
            }
        }
        self.run_lock.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tune::manager::MockTunableCache;

    fn profiler(bucket_size: usize, max_reuse_time: usize) -> SamplingAetProfiler<i64> {
        SamplingAetProfiler::new(
            "test",
            ProfilerConfig {
                bucket_size,
                max_reuse_time,
                sampling_interval: 1,
            },
            Arc::new(MockTunableCache::new(1024)),
        )
    }

    fn assert_curve_shape(mrc: &[f64]) {
        assert!(mrc.len() >= 2);
        assert_eq!(mrc[0], 1.0);
        let curve = &mrc[..mrc.len() - 1];
        for pair in curve.windows(2) {
            assert!(pair[1] <= pair[0] + 1e-12, "curve not non-increasing: {mrc:?}");
        }
        for &v in curve {
            assert!((0.0..=1.0).contains(&v), "value out of range: {mrc:?}");
        }
    }

    #[test]
    fn timestamp_counts_references() {
        let p = profiler(10, 1000);
        p.reference_key_batch(&[1, 2, 3]);
        p.reference_key(4);
        assert_eq!(p.timestamp(), 4);
    }

    #[test]
    fn mrc_degenerate_without_traffic() {
        let p = profiler(10, 1000);
        let mrc = p.get_mrc(1000);
        assert_eq!(mrc, vec![1.0, 0.0]);
    }

    #[test]
    fn mrc_from_two_scans_over_k_keys() {
        let k = 100i64;
        let p = profiler(1, 1000);
        let keys: Vec<i64> = (1..=k).collect();
        p.reference_key_batch(&keys);
        p.reference_key_batch(&keys);

        let mrc = p.get_mrc(4000);
        assert_curve_shape(&mrc);
        // Final element carries the snapshot timestamp.
        assert_eq!(mrc[mrc.len() - 1], (2 * k) as f64);
        // Every reuse distance equals k: small caches stay at miss ratio
        // 1.0, caches past k fall below it.
        let near_start = mrc[2.min(mrc.len() - 2)];
        assert!((near_start - 1.0).abs() < 1e-9, "{mrc:?}");
        let past_k = mrc[mrc.len() - 2];
        assert!(past_k < 1.0, "{mrc:?}");
    }

    #[test]
    fn mrc_repetitive_stream_drops_fast() {
        let p = profiler(1, 1000);
        // Two keys alternating: reuse distance 2 everywhere.
        for _ in 0..500 {
            p.reference_key_batch(&[7, 9]);
        }
        let mrc = p.get_mrc(100);
        assert_curve_shape(&mrc);
        // A cache of a handful of entries already captures the stream.
        let tail = mrc[mrc.len() - 2];
        assert!(tail < 0.1, "{mrc:?}");
    }

    #[test]
    fn histogram_tail_bucket_catches_long_distances() {
        let p = profiler(1, 10);
        // Distance 50 exceeds max_reuse_time = 10.
        p.reference_key(1);
        for k in 2..=50i64 {
            p.reference_key(k);
        }
        p.reference_key(1);
        let mrc = p.get_mrc(100);
        assert_curve_shape(&mrc);
    }

    #[test]
    fn reset_profiling_clears_everything() {
        let p = profiler(1, 1000);
        let keys: Vec<i64> = (1..=50).collect();
        p.reference_key_batch(&keys);
        p.reference_key_batch(&keys);
        assert_eq!(p.timestamp(), 100);

        p.reset_profiling();
        assert_eq!(p.timestamp(), 0);
        assert_eq!(p.get_mrc(1000), vec![1.0, 0.0]);

        // Sampling still works after a reset.
        p.reference_key_batch(&keys);
        assert_eq!(p.timestamp(), 50);
    }

    #[test]
    fn stop_sampling_releases_and_start_restores() {
        let p = profiler(1, 1000);
        p.reference_key_batch(&[1, 2, 3]);

        p.stop_sampling_and_release();
        // Referencing is a no-op while released.
        p.reference_key_batch(&[4, 5, 6]);
        assert_eq!(p.timestamp(), 0);
        assert_eq!(p.get_mrc(1000), vec![1.0, 0.0]);

        p.start_sampling();
        p.reference_key_batch(&[4, 5, 6]);
        assert_eq!(p.timestamp(), 3);
    }

    #[test]
    fn start_sampling_is_idempotent_while_running() {
        let p = profiler(1, 1000);
        p.reference_key_batch(&[1, 2]);
        p.start_sampling();
        assert_eq!(p.timestamp(), 2);
        p.reference_key(3);
        assert_eq!(p.timestamp(), 3);
    }

    #[test]
    fn tunable_delegation_round_trips() {
        let tunable = Arc::new(MockTunableCache::new(1024));
        let p: SamplingAetProfiler<i64> =
            SamplingAetProfiler::new("delegate", ProfilerConfig::default(), tunable.clone());
        assert_eq!(p.cache_size(), 1024);
        p.set_cache_size(4096);
        assert_eq!(tunable.cache_size(), 4096);
        assert_eq!(p.cache_entry_size(), 8);
        assert_eq!(p.bucket_size(), 10);
    }

    #[test]
    fn sampled_interval_records_subset() {
        let p: SamplingAetProfiler<i64> = SamplingAetProfiler::new(
            "sampled",
            ProfilerConfig {
                bucket_size: 1,
                max_reuse_time: 1000,
                sampling_interval: 4,
            },
            Arc::new(MockTunableCache::new(1024)),
        );
        let keys: Vec<i64> = (1..=200).collect();
        for _ in 0..4 {
            p.reference_key_batch(&keys);
        }
        // Timestamps advance for every reference even when unsampled.
        assert_eq!(p.timestamp(), 800);
        let mrc = p.get_mrc(2000);
        assert_curve_shape(&mrc);
    }

    #[test]
    fn concurrent_reference_and_reset_do_not_wedge() {
        let p = Arc::new(profiler(1, 1000));
        let mut handles = Vec::new();
        for t in 0..4 {
            let p = Arc::clone(&p);
            handles.push(std::thread::spawn(move || {
                let keys: Vec<i64> = (t * 100..t * 100 + 50).collect();
                for _ in 0..200 {
                    p.reference_key_batch(&keys);
                }
            }));
        }
        for _ in 0..10 {
            p.reset_profiling();
            let _ = p.get_mrc(500);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let mrc = p.get_mrc(500);
        assert_curve_shape(&mrc);
    }
}
