//! Profiled cache wrappers.
//!
//! A [`ProfiledCache`] composes a batch key cache with a
//! [`SamplingAetProfiler`]: every mutating access runs the cache operation
//! first, then feeds the profiler (only while the manager reports sampling
//! active), then accounts keys, bytes and per-side latency with the
//! manager. Dropping the wrapper deregisters its profiler.

use std::sync::Arc;
use std::time::Instant;

use crate::config::ProfilerConfig;
use crate::policy::lru::LruCache;
use crate::policy::sharded_lru::ShardedLruCache;
use crate::profile::aet::SamplingAetProfiler;
use crate::traits::{BatchCache, CacheKey, CacheMrcProfiler, MrcFeeder, TunableCache};
use crate::tune::manager::CacheManager;

/// Batch cache wrapped with an AET profiler. See the module docs.
pub struct ProfiledCache<K: CacheKey, C: BatchCache<K>> {
    inner: C,
    profiler: Arc<SamplingAetProfiler<K>>,
    manager: Arc<CacheManager>,
    entry_size: usize,
}

/// Profiled plain LRU cache.
pub type ProfiledLruCache<K> = ProfiledCache<K, LruCache<K>>;

/// Profiled sharded LRU cache.
pub type ProfiledShardedLruCache<K> = ProfiledCache<K, ShardedLruCache<K>>;

impl<K: CacheKey, C: BatchCache<K>> ProfiledCache<K, C> {
    pub fn new(
        inner: C,
        name: impl Into<String>,
        config: ProfilerConfig,
        tunable: Arc<dyn TunableCache>,
        manager: Arc<CacheManager>,
    ) -> Self {
        let entry_size = tunable.cache_entry_size().max(1);
        let profiler = Arc::new(SamplingAetProfiler::new(name, config, tunable));
        Self {
            inner,
            profiler,
            manager,
            entry_size,
        }
    }

    /// The profiler handle, for registration with the manager.
    pub fn profiler(&self) -> &Arc<SamplingAetProfiler<K>> {
        &self.profiler
    }

    /// The wrapped cache.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn instrument(&self, ids: &[K], op: impl FnOnce(&C, &[K])) {
        let cache_start = Instant::now();
        op(&self.inner, ids);
        let cache_nanos = cache_start.elapsed().as_nanos() as u64;

        let mut profiler_nanos = 0;
        if self.manager.sampling_active() {
            let profiler_start = Instant::now();
            self.profiler.reference_key_batch(ids);
            profiler_nanos = profiler_start.elapsed().as_nanos() as u64;
        }

        self.manager
            .access(ids.len() as u64, (ids.len() * self.entry_size) as u64);
        self.manager.add_latency(cache_nanos, profiler_nanos);
    }
}

impl<K: CacheKey, C: BatchCache<K>> BatchCache<K> for ProfiledCache<K, C> {
    fn update(&self, ids: &[K]) {
        self.instrument(ids, |cache, ids| cache.update(ids));
    }

    fn update_with_hints(&self, ids: &[K], versions: Option<&[i64]>, freqs: Option<&[i64]>) {
        self.instrument(ids, |cache, ids| {
            cache.update_with_hints(ids, versions, freqs)
        });
    }

    fn get_evic_ids(&self, out: &mut [K]) -> usize {
        self.inner.get_evic_ids(out)
    }

    fn get_cached_ids(&self, ids: &mut [K], versions: &mut [i64], freqs: &mut [i64]) -> usize {
        self.inner.get_cached_ids(ids, versions, freqs)
    }

    fn add_to_prefetch_list(&self, ids: &[K]) {
        self.inner.add_to_prefetch_list(ids);
    }

    fn add_to_cache(&self, ids: &[K]) {
        self.instrument(ids, |cache, ids| cache.add_to_cache(ids));
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn set_size(&self, desired_entries: usize) {
        self.inner.set_size(desired_entries);
    }

    fn hit_rate(&self) -> f64 {
        self.inner.hit_rate()
    }

    fn reset_status(&self) {
        self.inner.reset_status();
    }

    fn debug_string(&self) -> String {
        self.inner.debug_string()
    }
}

impl<K: CacheKey, C: BatchCache<K>> Drop for ProfiledCache<K, C> {
    fn drop(&mut self) {
        self.manager.unregister_cache(self.profiler.name());
    }
}
