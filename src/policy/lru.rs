//! # Batch LRU Key Cache
//!
//! Recency-ordered key cache for a single embedding variable. Tracks which
//! keys deserve the fast storage tier; the tier itself owns the values.
//!
//! ## Architecture
//!
//! ```text
//!   ┌───────────────────────────────────────────────────────────────┐
//!   │                        LruCache<K>                            │
//!   │                                                               │
//!   │   Mutex<LruCore<K>>                                           │
//!   │   ┌─────────────────────────────────────────────────────────┐ │
//!   │   │  index: FxHashMap<K, slot>     ──┐                      │ │
//!   │   │                                  ▼                      │ │
//!   │   │  list: KeyList<K>   head (MRU) ◄──► ... ◄──► tail (LRU) │ │
//!   │   │                                                         │ │
//!   │   │  prefetch: FxHashMap<K, refcount>   (pinned keys,       │ │
//!   │   │                                      not in the list)   │ │
//!   │   │  pending: VecDeque<K>               (strict mode only)  │ │
//!   │   └─────────────────────────────────────────────────────────┘ │
//!   └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Operations
//!
//! | Operation               | Effect                                        |
//! |-------------------------|-----------------------------------------------|
//! | `update(batch)`         | hit → promote to MRU; miss → insert at MRU    |
//! | `get_evic_ids`          | destructively removes LRU-tail keys           |
//! | `get_cached_ids`        | non-destructive MRU-first snapshot            |
//! | `add_to_prefetch_list`  | pin key, withdraw from policy store           |
//! | `add_to_cache`          | unpin; at zero the key re-enters via update   |
//!
//! ## Strict mode
//!
//! With [`LruCacheOptions::strict`], a `desired_size` target makes `update`
//! shed tail entries into a pending-evicted queue until the live list fits;
//! `get_evic_ids` drains that queue (oldest first) before the live tail,
//! and `size()` counts both. The default mode leaves shedding entirely to
//! `get_evic_ids` callers.
//!
//! ## Concurrency
//!
//! One `parking_lot::Mutex` guards list, index, pin table and counters, so
//! all observers see a sequentially consistent projection of the mutation
//! stream. Batch granularity keeps lock traffic proportional to batches,
//! not keys.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::config;
use crate::ds::KeyList;
use crate::traits::{BatchCache, CacheKey};

/// Construction options for [`LruCache`].
#[derive(Debug, Clone)]
pub struct LruCacheOptions {
    strict: bool,
    report_interval: u64,
}

impl LruCacheOptions {
    pub fn new() -> Self {
        Self {
            strict: false,
            report_interval: config::report_interval(),
        }
    }

    /// Enables the strict eviction path: `update` actively sheds down to
    /// the `set_size` target into the pending-evicted queue.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Overrides the statistics report cadence (update batches per line).
    pub fn report_interval(mut self, interval: u64) -> Self {
        self.report_interval = interval.max(1);
        self
    }
}

impl Default for LruCacheOptions {
    fn default() -> Self {
        Self::new()
    }
}

struct LruCore<K> {
    list: KeyList<K>,
    index: FxHashMap<K, usize>,
    prefetch: FxHashMap<K, u64>,
    pending: VecDeque<K>,
    num_hit: u64,
    num_miss: u64,
    desired_size: usize,
    strict: bool,
}

impl<K: CacheKey> LruCore<K> {
    fn new(strict: bool) -> Self {
        Self {
            list: KeyList::new(),
            index: FxHashMap::default(),
            prefetch: FxHashMap::default(),
            pending: VecDeque::new(),
            num_hit: 0,
            num_miss: 0,
            desired_size: 0,
            strict,
        }
    }

    fn update_keys(&mut self, ids: &[K]) {
        if self.strict && self.desired_size > 0 {
            while self.index.len() > self.desired_size {
                match self.list.pop_back() {
                    Some(key) => {
                        self.index.remove(&key);
                        self.pending.push_back(key);
                    },
                    None => break,
                }
            }
        }

        for &id in ids {
            match self.index.get(&id) {
                Some(&slot) => {
                    self.list.move_to_front(slot);
                    self.num_hit += 1;
                },
                None => {
                    let slot = self.list.push_front(id);
                    self.index.insert(id, slot);
                    self.num_miss += 1;
                },
            }
        }
    }

    fn evict_into(&mut self, out: &mut [K]) -> usize {
        let mut count = 0;
        while count < out.len() {
            match self.pending.pop_front() {
                Some(key) => {
                    out[count] = key;
                    count += 1;
                },
                None => break,
            }
        }
        while count < out.len() {
            match self.list.pop_back() {
                Some(key) => {
                    self.index.remove(&key);
                    out[count] = key;
                    count += 1;
                },
                None => break,
            }
        }
        count
    }

    fn resident(&self) -> usize {
        self.index.len() + self.pending.len()
    }
}

/// Batch LRU key cache. See the module docs for semantics.
pub struct LruCache<K: CacheKey> {
    name: String,
    inner: Mutex<LruCore<K>>,
    access: AtomicU64,
    report_interval: u64,
}

impl<K: CacheKey> LruCache<K> {
    /// Creates a cache with defaults (non-strict, env report cadence).
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, LruCacheOptions::new())
    }

    pub fn with_options(name: impl Into<String>, options: LruCacheOptions) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(LruCore::new(options.strict)),
            access: AtomicU64::new(0),
            report_interval: options.report_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn maybe_report(&self, actual_size: usize) {
        let n = self.access.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.report_interval == 0 {
            info!(
                cache = %self.name,
                stats = %self.debug_string(),
                actual_size,
                "cache statistics"
            );
        }
    }

    fn format_stats(num_hit: u64, num_miss: u64) -> String {
        let total = num_hit + num_miss;
        let hit_rate = if total > 0 {
            num_hit as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        format!("HitRate = {hit_rate} %, visit_count = {total}, hit_count = {num_hit}")
    }
}

impl<K: CacheKey> BatchCache<K> for LruCache<K> {
    fn update(&self, ids: &[K]) {
        let actual_size = {
            let mut core = self.inner.lock();
            core.update_keys(ids);
            core.index.len()
        };
        self.maybe_report(actual_size);
    }

    fn update_with_hints(&self, ids: &[K], _versions: Option<&[i64]>, _freqs: Option<&[i64]>) {
        // Recency ranking only; version/frequency hints carry no signal here.
        self.update(ids);
    }

    fn get_evic_ids(&self, out: &mut [K]) -> usize {
        self.inner.lock().evict_into(out)
    }

    fn get_cached_ids(&self, ids: &mut [K], versions: &mut [i64], freqs: &mut [i64]) -> usize {
        let core = self.inner.lock();
        let mut count = 0;
        for key in core.list.iter() {
            if count >= ids.len() {
                break;
            }
            ids[count] = key;
            count += 1;
        }
        // No version or frequency tracking in this policy.
        for slot in versions.iter_mut().take(count) {
            *slot = 0;
        }
        for slot in freqs.iter_mut().take(count) {
            *slot = 0;
        }
        count
    }

    fn add_to_prefetch_list(&self, ids: &[K]) {
        let mut guard = self.inner.lock();
        let core = &mut *guard;
        for &id in ids {
            if let Some(ref_count) = core.prefetch.get_mut(&id) {
                *ref_count += 1;
                continue;
            }
            if let Some(slot) = core.index.remove(&id) {
                core.list.remove(slot);
            }
            core.prefetch.insert(id, 1);
        }
    }

    fn add_to_cache(&self, ids: &[K]) {
        let mut guard = self.inner.lock();
        let core = &mut *guard;
        let mut ids_to_cache = Vec::new();
        for &id in ids {
            let ref_count = core
                .prefetch
                .get_mut(&id)
                .unwrap_or_else(|| panic!("key {id} should be prefetched before being used"));
            *ref_count -= 1;
            if *ref_count == 0 {
                core.prefetch.remove(&id);
                ids_to_cache.push(id);
            }
        }
        core.update_keys(&ids_to_cache);
    }

    fn size(&self) -> usize {
        self.inner.lock().resident()
    }

    fn set_size(&self, desired_entries: usize) {
        self.inner.lock().desired_size = desired_entries;
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
        Self::format_stats(core.num_hit, core.num_miss)
    }
}

impl<K: CacheKey> Drop for LruCache<K> {
    fn drop(&mut self) {
        info!(cache = %self.name, stats = %self.debug_string(), "cache destroyed");
    }
}
