//! Power-of-two sharded LRU key cache.
//!
//! Partitions the key space by the low bits of the key
//! (`key & (shards - 1)`) across independent LRU shards, each with its own
//! policy lock and prefetch lock, so workload threads touching different
//! residues proceed in parallel. Recency is per shard; no global order is
//! maintained across shards.
//!
//! Eviction and snapshot quotas are split evenly across shards with the
//! remainder going to the first shards, mirroring how the surrounding
//! system spreads embedding ids.
//!
//! Lock discipline: a key moving between the pin table and the policy
//! store takes the shard's prefetch lock first, then the policy lock, and
//! releases the policy lock before touching the pin table again. No
//! operation holds locks from two shards at once.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::info;

use crate::ds::KeyList;
use crate::error::ConfigError;
use crate::traits::{BatchCache, CacheKey};

#[derive(Debug)]
struct ShardCore<K> {
    list: KeyList<K>,
    index: FxHashMap<K, usize>,
    num_hit: u64,
    num_miss: u64,
}

impl<K: CacheKey> ShardCore<K> {
    fn new() -> Self {
        Self {
            list: KeyList::new(),
            index: FxHashMap::default(),
            num_hit: 0,
            num_miss: 0,
        }
    }
}

#[derive(Debug)]
struct Shard<K> {
    core: Mutex<ShardCore<K>>,
    prefetch: Mutex<FxHashMap<K, u64>>,
}

/// Sharded batch LRU key cache. See the module docs for semantics.
#[derive(Debug)]
pub struct ShardedLruCache<K: CacheKey> {
    name: String,
    shards: Vec<Shard<K>>,
    shard_mask: u64,
    desired_size: AtomicUsize,
}

impl<K: CacheKey> ShardedLruCache<K> {
    /// Creates a cache with `1 << shard_shift` shards.
    ///
    /// # Panics
    ///
    /// Panics if `shard_shift` exceeds 16 (65536 shards), which is far past
    /// any useful parallelism and indicates a misconfigured environment.
    pub fn new(name: impl Into<String>, shard_shift: u32) -> Self {
        Self::try_new(name, shard_shift).unwrap_or_else(|err| panic!("{err}"))
    }

    /// Fallible variant of [`new`](Self::new) for user-configurable shard
    /// shifts.
    pub fn try_new(name: impl Into<String>, shard_shift: u32) -> Result<Self, ConfigError> {
        let name = name.into();
        if shard_shift > 16 {
            return Err(ConfigError::new(format!(
                "invalid argument shard_shift={shard_shift} when constructing ShardedLruCache for {name}"
            )));
        }
        let shard_num = 1usize << shard_shift;
        info!(cache = %name, shards = shard_num, "sharded LRU cache created");
        let shards = (0..shard_num)
            .map(|_| Shard {
                core: Mutex::new(ShardCore::new()),
                prefetch: Mutex::new(FxHashMap::default()),
            })
            .collect();
        Ok(Self {
            name,
            shards,
            shard_mask: shard_num as u64 - 1,
            desired_size: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard_for(&self, id: &K) -> &Shard<K> {
        &self.shards[(id.low_bits() & self.shard_mask) as usize]
    }

    fn totals(&self) -> (u64, u64) {
        let mut num_hit = 0;
        let mut num_miss = 0;
        for shard in &self.shards {
            let core = shard.core.lock();
            num_hit += core.num_hit;
            num_miss += core.num_miss;
        }
        (num_hit, num_miss)
    }
}

impl<K: CacheKey> BatchCache<K> for ShardedLruCache<K> {
    fn update(&self, ids: &[K]) {
        for id in ids {
            let shard = self.shard_for(id);
            let mut guard = shard.core.lock();
            let core = &mut *guard;
            if let Some(&slot) = core.index.get(id) {
                core.list.move_to_front(slot);
                core.num_hit += 1;
            } else {
                let slot = core.list.push_front(*id);
                core.index.insert(*id, slot);
                core.num_miss += 1;
            }
        }
    }

    fn update_with_hints(&self, ids: &[K], _versions: Option<&[i64]>, _freqs: Option<&[i64]>) {
        self.update(ids);
    }

    fn get_evic_ids(&self, out: &mut [K]) -> usize {
        let num_shards = self.shards.len();
        let per_shard = out.len() / num_shards;
        let remaining = out.len() % num_shards;
        let mut count = 0;
        for (i, shard) in self.shards.iter().enumerate() {
            let quota = per_shard + usize::from(i < remaining);
            let mut guard = shard.core.lock();
            let core = &mut *guard;
            for _ in 0..quota {
                match core.list.pop_back() {
                    Some(key) => {
                        core.index.remove(&key);
                        out[count] = key;
                        count += 1;
                    },
                    None => break,
                }
            }
        }
        count
    }

    fn get_cached_ids(&self, ids: &mut [K], versions: &mut [i64], freqs: &mut [i64]) -> usize {
        let num_shards = self.shards.len();
        let per_shard = ids.len() / num_shards;
        let remaining = ids.len() % num_shards;
        let mut count = 0;
        for (i, shard) in self.shards.iter().enumerate() {
            let quota = per_shard + usize::from(i < remaining);
            let core = shard.core.lock();
            for key in core.list.iter().take(quota) {
                ids[count] = key;
                count += 1;
            }
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
        for id in ids {
            let shard = self.shard_for(id);
            let mut pins = shard.prefetch.lock();
            if let Some(ref_count) = pins.get_mut(id) {
                *ref_count += 1;
                continue;
            }
            {
                let mut guard = shard.core.lock();
                let core = &mut *guard;
                if let Some(slot) = core.index.remove(id) {
                    core.list.remove(slot);
                }
            }
            pins.insert(*id, 1);
        }
    }

    fn add_to_cache(&self, ids: &[K]) {
        let mut ids_to_cache = Vec::new();
        for id in ids {
            let shard = self.shard_for(id);
            let mut pins = shard.prefetch.lock();
            let ref_count = pins
                .get_mut(id)
                .unwrap_or_else(|| panic!("key {id} should be prefetched before being used"));
            *ref_count -= 1;
            if *ref_count == 0 {
                pins.remove(id);
                ids_to_cache.push(*id);
            }
        }
        self.update(&ids_to_cache);
    }

    fn size(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.core.lock().index.len())
            .sum()
    }

    fn set_size(&self, desired_entries: usize) {
        self.desired_size.store(desired_entries, Ordering::Relaxed);
    }

    fn hit_rate(&self) -> f64 {
        let (num_hit, num_miss) = self.totals();
        let total = num_hit + num_miss;
        if total == 0 {
            0.0
        } else {
            num_hit as f64 / total as f64
        }
    }

    fn reset_status(&self) {
        for shard in &self.shards {
            let mut core = shard.core.lock();
            core.num_hit = 0;
            core.num_miss = 0;
        }
    }

    fn debug_string(&self) -> String {
        let (num_hit, num_miss) = self.totals();
        let total = num_hit + num_miss;
        let hit_rate = if total > 0 {
            num_hit as f64 * 100.0 / total as f64
        } else {
            0.0
        };
        format!("HitRate = {hit_rate} %, visit_count = {total}, hit_count = {num_hit}")
    }
}

impl<K: CacheKey> Drop for ShardedLruCache<K> {
    fn drop(&mut self) {
        info!(cache = %self.name, stats = %self.debug_string(), "sharded LRU cache destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn single_shard_behaves_like_lru() {
        let cache: ShardedLruCache<i64> = ShardedLruCache::new("s", 0);
        cache.update(&[1, 2, 3, 4, 5]);

        let mut evicted = [0i64; 2];
        assert_eq!(cache.get_evic_ids(&mut evicted), 2);
        assert_eq!(evicted, [1, 2]);

        let mut ids = [0i64; 3];
        let mut versions = [0i64; 3];
        let mut freqs = [0i64; 3];
        assert_eq!(cache.get_cached_ids(&mut ids, &mut versions, &mut freqs), 3);
        assert_eq!(ids, [5, 4, 3]);
    }

    #[test]
    fn keys_partition_by_low_bits() {
        let cache: ShardedLruCache<i64> = ShardedLruCache::new("s", 2);
        assert_eq!(cache.shard_count(), 4);
        // Residue classes mod 4 land in distinct shards.
        cache.update(&[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(cache.size(), 8);
        for (i, shard) in cache.shards.iter().enumerate() {
            let core = shard.core.lock();
            assert_eq!(core.index.len(), 2, "shard {i}");
        }
    }

    #[test]
    fn eviction_quota_splits_across_shards() {
        let cache: ShardedLruCache<i64> = ShardedLruCache::new("s", 1);
        // Shard 0: 0,2,4; shard 1: 1,3,5.
        cache.update(&[0, 1, 2, 3, 4, 5]);

        let mut evicted = [0i64; 3];
        assert_eq!(cache.get_evic_ids(&mut evicted), 3);
        // Quota 2 for shard 0 (remainder), 1 for shard 1; oldest first.
        assert_eq!(evicted, [0, 2, 1]);
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn eviction_quota_not_stolen_by_full_shards() {
        let cache: ShardedLruCache<i64> = ShardedLruCache::new("s", 1);
        // Only even keys: shard 1 stays empty.
        cache.update(&[0, 2, 4, 6]);
        let mut evicted = [0i64; 4];
        // Shard 0 quota is 2, shard 1 has nothing: only 2 come back.
        assert_eq!(cache.get_evic_ids(&mut evicted), 2);
        assert_eq!(&evicted[..2], &[0, 2]);
    }

    #[test]
    fn prefetch_pins_cross_shards() {
        let cache: ShardedLruCache<i64> = ShardedLruCache::new("s", 1);
        cache.update(&[10, 21]);
        cache.add_to_prefetch_list(&[10, 10, 33]);
        assert_eq!(cache.size(), 1);

        cache.add_to_cache(&[10, 33]);
        assert_eq!(cache.size(), 2);
        cache.add_to_cache(&[10]);
        assert_eq!(cache.size(), 3);
    }

    #[test]
    #[should_panic(expected = "prefetched before being used")]
    fn unpinned_add_to_cache_is_fatal() {
        let cache: ShardedLruCache<i64> = ShardedLruCache::new("s", 1);
        cache.add_to_cache(&[9]);
    }

    #[test]
    fn oversized_shard_shift_is_rejected() {
        let err = ShardedLruCache::<i64>::try_new("s", 17).unwrap_err();
        assert!(err.message().contains("shard_shift=17"), "{err}");
    }

    #[test]
    fn concurrent_disjoint_residues_make_progress() {
        let cache: Arc<ShardedLruCache<i64>> = Arc::new(ShardedLruCache::new("s", 2));
        let mut handles = Vec::new();
        for residue in 0..4i64 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for round in 0..200i64 {
                    let key = residue + 4 * (round % 25);
                    cache.update(&[key]);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // 25 distinct keys per residue.
        assert_eq!(cache.size(), 100);
        let (num_hit, num_miss) = cache.totals();
        assert_eq!(num_hit + num_miss, 800);
    }
}
