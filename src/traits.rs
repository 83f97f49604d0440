//! # Cache Capability Traits
//!
//! Capability sets for the batch key caches, the tunable-capacity surface,
//! and the miss-ratio-curve profilers that drive coordination.
//!
//! ## Architecture
//!
//! ```text
//!              ┌───────────────────────────────┐
//!              │        BatchCache<K>          │
//!              │  update / get_evic_ids /      │
//!              │  get_cached_ids / pins /      │
//!              │  size / hit stats             │
//!              └───────────────┬───────────────┘
//!                              │ implemented by
//!              ┌───────────────┼────────────────────┐
//!              ▼               ▼                    ▼
//!         LruCache<K>    ShardedLruCache<K>    LfuCache<K>
//!              ▲               ▲
//!              │ wrapped by    │
//!       ProfiledLruCache  ProfiledShardedLruCache
//!              │               │
//!              ▼               ▼
//!    ┌──────────────────────────────────┐   ┌────────────────────────┐
//!    │         MrcFeeder<K>             │   │     TunableCache       │
//!    │  reference_key(_batch)           │   │  cache_size / entry /  │
//!    └──────────────┬───────────────────┘   │  move counts           │
//!                   │                       └───────────┬────────────┘
//!                   ▼                                   │ extends
//!        SamplingAetProfiler<K>  ──implements──►  CacheMrcProfiler
//!                                                 get_mrc / reset /
//!                                                 sampling control
//! ```
//!
//! ## Design Notes
//!
//! - Every cache operation takes `&self`: interior locking (one mutex per
//!   cache, one per shard) is part of the cache contract, because the
//!   surrounding system drives a single cache from many workload threads.
//! - Eviction via [`BatchCache::get_evic_ids`] is destructive: returned
//!   keys no longer exist in the policy store.
//! - The pin operations ([`BatchCache::add_to_prefetch_list`] /
//!   [`BatchCache::add_to_cache`]) implement the prefetch protocol: a
//!   pinned key is withheld from the policy store until every in-flight
//!   prefetch referencing it lands.

use std::fmt;
use std::hash::Hash;

/// Key bound shared by every cache in this crate.
///
/// Keys are small copyable identifiers (typically `i64` embedding ids). The
/// `low_bits` image drives power-of-two shard selection in
/// [`ShardedLruCache`](crate::policy::sharded_lru::ShardedLruCache).
pub trait CacheKey: Copy + Eq + Hash + fmt::Display + Send + Sync + 'static {
    /// Returns an integer image of the key; sharding masks its low bits.
    fn low_bits(&self) -> u64;
}

impl CacheKey for i64 {
    #[inline]
    fn low_bits(&self) -> u64 {
        *self as u64
    }
}

impl CacheKey for u64 {
    #[inline]
    fn low_bits(&self) -> u64 {
        *self
    }
}

impl CacheKey for i32 {
    #[inline]
    fn low_bits(&self) -> u64 {
        *self as u32 as u64
    }
}

impl CacheKey for u32 {
    #[inline]
    fn low_bits(&self) -> u64 {
        *self as u64
    }
}

/// Batch-oriented key cache: the contract the embedding storage tiers
/// consume.
///
/// Implementations track recency or frequency only — values live in the
/// storage tiers, the cache decides which keys stay in the fast tier.
///
/// # Example
///
/// ```
/// use cachetune::policy::lru::LruCache;
/// use cachetune::traits::BatchCache;
///
/// let cache: LruCache<i64> = LruCache::new("emb0");
/// cache.update(&[1, 2, 3, 4, 5]);
///
/// // Oldest two keys leave the policy store.
/// let mut evicted = [0i64; 2];
/// assert_eq!(cache.get_evic_ids(&mut evicted), 2);
/// assert_eq!(evicted, [1, 2]);
/// assert_eq!(cache.size(), 3);
/// ```
pub trait BatchCache<K: CacheKey>: Send + Sync {
    /// References a batch of keys: resident keys are promoted, absent keys
    /// are inserted as most valuable. Updates hit/miss counters.
    fn update(&self, ids: &[K]);

    /// `update` with per-key hints. `versions` is accepted for interface
    /// parity and ignored by every current policy; `freqs` is **added** to
    /// the current frequency by the LFU policy and ignored by LRU.
    fn update_with_hints(&self, ids: &[K], versions: Option<&[i64]>, freqs: Option<&[i64]>);

    /// Removes up to `out.len()` least-valuable keys, writing them into
    /// `out` front-to-back, and returns how many were removed. Removal is
    /// destructive: the keys cease to exist in the policy store.
    fn get_evic_ids(&self, out: &mut [K]) -> usize;

    /// Copies up to `ids.len()` most-valuable resident keys into `ids`
    /// without disturbing policy order, returning how many were written.
    ///
    /// `versions` is always zero-filled (no policy tracks versions);
    /// `freqs` is filled by LFU and zero-filled by the LRU policies. Both
    /// output slices must be at least as long as `ids`.
    fn get_cached_ids(&self, ids: &mut [K], versions: &mut [i64], freqs: &mut [i64]) -> usize;

    /// Pins keys for an in-flight prefetch. A pinned key is removed from
    /// the policy store (its frequency preserved where the policy has one)
    /// and cannot be cached or evicted until its pin count drains.
    fn add_to_prefetch_list(&self, ids: &[K]);

    /// Completes a prefetch for each key, decrementing its pin. When the
    /// pin count reaches zero the key re-enters the policy store.
    ///
    /// # Panics
    ///
    /// Panics if a key was never pinned via
    /// [`add_to_prefetch_list`](Self::add_to_prefetch_list) — that is a
    /// protocol violation in the caller, not a recoverable condition.
    fn add_to_cache(&self, ids: &[K]);

    /// Number of distinct keys resident in the policy store (plus any
    /// pending strict-mode evictions; pinned keys are not counted).
    fn size(&self) -> usize;

    /// Sets the soft target size, in entries. The strict LRU variant
    /// actively sheds down to this target on `update`; other policies rely
    /// on the caller draining [`get_evic_ids`](Self::get_evic_ids).
    fn set_size(&self, desired_entries: usize);

    /// Fraction of `update` references that hit, in `[0, 1]`.
    fn hit_rate(&self) -> f64;

    /// Zeroes the hit/miss counters.
    fn reset_status(&self);

    /// Human-readable statistics line.
    fn debug_string(&self) -> String;
}

/// Capacity surface of a tunable storage tier.
///
/// Implemented by the embedding storage that owns the bytes; the profiler
/// delegates to it so the coordinator can read and write capacity in bytes
/// without knowing the tier. Sizes are bytes; `cache_entry_size` converts
/// to entry counts.
pub trait TunableCache: Send + Sync {
    /// Current capacity in bytes.
    fn cache_size(&self) -> usize;

    /// Applies a new capacity in bytes.
    fn set_cache_size(&self, new_size: usize);

    /// Bytes per cached entry (embedding row width).
    fn cache_entry_size(&self) -> usize;

    /// Observed hit rate of the tier, in `[0, 1]`.
    fn hit_rate(&self) -> f64;

    /// Resets observed hit statistics.
    fn reset_stat(&self);

    /// `(promotions, demotions)` since the last
    /// [`reset_move_count`](Self::reset_move_count): entries moved into and
    /// out of the fast tier. Their stability decides whether sampling is
    /// still worthwhile.
    fn move_count(&self) -> (u64, u64);

    /// Zeroes the promotion/demotion counters.
    fn reset_move_count(&self);
}

/// Access-stream feeder side of a profiler.
///
/// Called on the workload path; implementations must tolerate concurrent
/// callers and never block them for long.
pub trait MrcFeeder<K: CacheKey>: Send + Sync {
    /// Records one key reference.
    fn reference_key(&self, key: K);

    /// Records a batch of key references.
    fn reference_key_batch(&self, keys: &[K]);
}

/// Miss-ratio-curve profiler: the coordinator-facing side.
///
/// Extends [`TunableCache`] because the manager reads and applies capacity
/// through the same registered handle it queries curves from.
pub trait CacheMrcProfiler: TunableCache {
    /// Computes the miss-ratio curve up to `max_cache_size` bytes.
    ///
    /// The returned vector is non-increasing, starts at `1.0`, has its
    /// trailing flat plateau trimmed, and carries the profiler timestamp
    /// (total references seen) as its final element.
    fn get_mrc(&self, max_cache_size: usize) -> Vec<f64>;

    /// Name of the cache this profiler observes.
    fn name(&self) -> &str;

    /// Clears histogram, timestamps and the last-access map, keeping
    /// sampling enabled. Quiesces concurrent referencers first.
    fn reset_profiling(&self);

    /// Histogram bucket width in reuse-time units.
    fn bucket_size(&self) -> usize;

    /// Releases histogram and last-access memory and keeps the profiler
    /// quiesced until [`start_sampling`](Self::start_sampling).
    fn stop_sampling_and_release(&self);

    /// Reallocates profiling state after
    /// [`stop_sampling_and_release`](Self::stop_sampling_and_release).
    /// No-op when sampling is already running.
    fn start_sampling(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_low_bits_images() {
        assert_eq!(5i64.low_bits(), 5);
        assert_eq!((-1i64).low_bits(), u64::MAX);
        assert_eq!(7u32.low_bits(), 7);
        assert_eq!((-1i32).low_bits(), u32::MAX as u64);
    }
}
