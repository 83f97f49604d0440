//! Batch LFU key cache.
//!
//! Frequency-ordered companion to [`LruCache`](crate::policy::lru): every
//! resident key sits in a frequency bucket, hits move it one bucket up (or
//! by an explicit delta on the hinted path), and eviction drains the
//! least-recent tail of the lowest bucket.
//!
//! Pinned keys preserve their frequency: `add_to_prefetch_list` withdraws
//! the key together with its count, every additional pin reference also
//! counts as an access, and the key re-enters the buckets at the preserved
//! frequency once the last pin drains.
//!
//! All operations serialise on a single `parking_lot::Mutex`, matching the
//! single-lock contract of the plain LRU cache.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::config;
use crate::ds::FreqBuckets;
use crate::traits::{BatchCache, CacheKey};

struct LfuPin {
    ref_count: u64,
    freq: u64,
}

struct LfuCore<K> {
    buckets: FreqBuckets<K>,
    prefetch: FxHashMap<K, LfuPin>,
    num_hit: u64,
    num_miss: u64,
}

impl<K: CacheKey> LfuCore<K> {
    fn new() -> Self {
        Self {
            buckets: FreqBuckets::new(),
            prefetch: FxHashMap::default(),
            num_hit: 0,
            num_miss: 0,
        }
    }

    fn update_keys(&mut self, ids: &[K]) {
        for &id in ids {
            if self.buckets.touch(&id).is_some() {
                self.num_hit += 1;
            } else {
                self.buckets.insert(id);
                self.num_miss += 1;
            }
        }
    }

    /// Hinted path: `freqs[i]` is **added** to the key's current frequency
    /// on a hit, and becomes the starting frequency on a miss.
    fn update_keys_with_freqs(&mut self, ids: &[K], freqs: &[i64]) {
        for (&id, &freq) in ids.iter().zip(freqs) {
            let freq = freq.max(0) as u64;
            if self.buckets.touch_by(&id, freq).is_some() {
                self.num_hit += 1;
            } else {
                self.buckets.insert_with_freq(id, freq);
                self.num_miss += 1;
            }
        }
    }
}

/// Batch LFU key cache. See the module docs for semantics.
pub struct LfuCache<K: CacheKey> {
    name: String,
    inner: Mutex<LfuCore<K>>,
    access: AtomicU64,
    report_interval: u64,
}

impl<K: CacheKey> LfuCache<K> {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_report_interval(name, config::report_interval())
    }

    pub fn with_report_interval(name: impl Into<String>, report_interval: u64) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(LfuCore::new()),
            access: AtomicU64::new(0),
            report_interval: report_interval.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frequency of a resident key, mainly for tests and diagnostics.
    pub fn frequency(&self, key: &K) -> Option<u64> {
        self.inner.lock().buckets.frequency(key)
    }

    fn maybe_report(&self) {
        let n = self.access.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.report_interval == 0 {
            info!(cache = %self.name, stats = %self.debug_string(), "cache statistics");
        }
    }
}

impl<K: CacheKey> BatchCache<K> for LfuCache<K> {
    fn update(&self, ids: &[K]) {
        self.inner.lock().update_keys(ids);
        self.maybe_report();
    }

    fn update_with_hints(&self, ids: &[K], _versions: Option<&[i64]>, freqs: Option<&[i64]>) {
        match freqs {
            Some(freqs) => {
                self.inner.lock().update_keys_with_freqs(ids, freqs);
                self.maybe_report();
            },
            None => self.update(ids),
        }
    }

    fn get_evic_ids(&self, out: &mut [K]) -> usize {
        let mut core = self.inner.lock();
        let mut count = 0;
        while count < out.len() {
            match core.buckets.pop_min() {
                Some((key, _freq)) => {
                    out[count] = key;
                    count += 1;
                },
                None => break,
            }
        }
        count
    }

    fn get_cached_ids(&self, ids: &mut [K], versions: &mut [i64], freqs: &mut [i64]) -> usize {
        let core = self.inner.lock();
        let mut count = 0;
        for (key, freq) in core.buckets.iter_desc() {
            if count >= ids.len() {
                break;
            }
            ids[count] = key;
            freqs[count] = freq as i64;
            count += 1;
        }
        // Versions are not tracked by any policy.
        for slot in versions.iter_mut().take(count) {
            *slot = 0;
        }
        count
    }

    fn add_to_prefetch_list(&self, ids: &[K]) {
        let mut guard = self.inner.lock();
        let core = &mut *guard;
        for &id in ids {
            if let Some(pin) = core.prefetch.get_mut(&id) {
                // Every additional in-flight prefetch counts as an access.
                pin.ref_count += 1;
                pin.freq += 1;
                continue;
            }
            let freq = core.buckets.remove(&id).unwrap_or(1);
            core.prefetch.insert(
                id,
                LfuPin {
                    ref_count: 1,
                    freq,
                },
            );
        }
    }

    fn add_to_cache(&self, ids: &[K]) {
        let mut guard = self.inner.lock();
        let core = &mut *guard;
        let mut ids_to_cache = Vec::new();
        let mut freqs_to_cache = Vec::new();
        for &id in ids {
            let pin = core
                .prefetch
                .get_mut(&id)
                .unwrap_or_else(|| panic!("key {id} should be prefetched before being used"));
            pin.ref_count -= 1;
            if pin.ref_count == 0 {
                let freq = pin.freq;
                core.prefetch.remove(&id);
                ids_to_cache.push(id);
                freqs_to_cache.push(freq as i64);
            }
        }
        core.update_keys_with_freqs(&ids_to_cache, &freqs_to_cache);
    }

    fn size(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    fn set_size(&self, _desired_entries: usize) {
        // Soft target only; LFU sheds exclusively through get_evic_ids.
    }

    fn hit_rate(&self) -> f64 {
        let core = self.inner.lock();
        let total = core.num_hit + core.num_miss;
        if total == 0 {
            0.0
        } else {
            core.num_hit as f64 / total as f64
        }
    }

    fn reset_status(&self) {
        let mut core = self.inner.lock();
        core.num_hit = 0;
        core.num_miss = 0;
    }

    fn debug_string(&self) -> String {
        let core = self.inner.lock();
        let total = core.num_hit + core.num_miss;
        let hit_rate = if total > 0 {
            core.num_hit as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        format!(
            "HitRate = {hit_rate} %, visit_count = {total}, hit_count = {}",
            core.num_hit
        )
    }
}

impl<K: CacheKey> Drop for LfuCache<K> {
    fn drop(&mut self) {
        info!(cache = %self.name, stats = %self.debug_string(), "cache destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lfu() -> LfuCache<i64> {
        LfuCache::with_report_interval("test", u64::MAX)
    }

    #[test]
    fn eviction_takes_lowest_frequency_first() {
        let cache = lfu();
        cache.update(&[1, 1, 1, 2, 2, 3]);
        assert_eq!(cache.frequency(&1), Some(3));
        assert_eq!(cache.frequency(&2), Some(2));
        assert_eq!(cache.frequency(&3), Some(1));

        let mut evicted = [0i64; 1];
        assert_eq!(cache.get_evic_ids(&mut evicted), 1);
        assert_eq!(evicted[0], 3);
        assert_eq!(cache.get_evic_ids(&mut evicted), 1);
        assert_eq!(evicted[0], 2);
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn frequency_counts_every_reference() {
        let cache = lfu();
        cache.update(&[7, 7, 7, 7]);
        assert_eq!(cache.frequency(&7), Some(4));
        // 1 miss + 3 hits.
        assert!((cache.hit_rate() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn hinted_update_adds_frequency() {
        let cache = lfu();
        cache.update(&[5, 5]);
        cache.update_with_hints(&[5], None, Some(&[10]));
        assert_eq!(cache.frequency(&5), Some(12));

        // Absent key starts at the hinted frequency.
        cache.update_with_hints(&[6], None, Some(&[4]));
        assert_eq!(cache.frequency(&6), Some(4));
    }

    #[test]
    fn cached_ids_descend_by_frequency() {
        let cache = lfu();
        cache.update(&[1, 1, 1, 2, 2, 3]);

        let mut ids = [0i64; 3];
        let mut versions = [0i64; 3];
        let mut freqs = [0i64; 3];
        assert_eq!(cache.get_cached_ids(&mut ids, &mut versions, &mut freqs), 3);
        assert_eq!(ids, [1, 2, 3]);
        assert_eq!(freqs, [3, 2, 1]);
        assert_eq!(versions, [0, 0, 0]);
    }

    #[test]
    fn pin_preserves_frequency() {
        let cache = lfu();
        cache.update(&[4, 4, 4]);
        cache.add_to_prefetch_list(&[4]);
        assert_eq!(cache.size(), 0);

        cache.add_to_cache(&[4]);
        // Re-enters with its preserved count.
        assert_eq!(cache.frequency(&4), Some(3));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn extra_pin_references_count_as_accesses() {
        let cache = lfu();
        cache.update(&[4, 4]);
        cache.add_to_prefetch_list(&[4]);
        cache.add_to_prefetch_list(&[4]);
        cache.add_to_cache(&[4, 4]);
        // freq 2 preserved + 1 for the second pin reference.
        assert_eq!(cache.frequency(&4), Some(3));
    }

    #[test]
    fn never_seen_pin_enters_at_freq_one() {
        let cache = lfu();
        cache.add_to_prefetch_list(&[11]);
        cache.add_to_cache(&[11]);
        assert_eq!(cache.frequency(&11), Some(1));
    }

    #[test]
    #[should_panic(expected = "prefetched before being used")]
    fn unpinned_add_to_cache_is_fatal() {
        let cache = lfu();
        cache.add_to_cache(&[1]);
    }

    #[test]
    fn evicts_recency_within_bucket() {
        let cache = lfu();
        cache.update(&[1, 2, 3]);
        // All at freq 1: least recent (1) leaves first.
        let mut evicted = [0i64; 3];
        assert_eq!(cache.get_evic_ids(&mut evicted), 3);
        assert_eq!(evicted, [1, 2, 3]);
    }
}
