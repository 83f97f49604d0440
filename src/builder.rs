//! Cache factory.
//!
//! Builds a batch key cache for an embedding variable from a strategy
//! selector, optionally wrapped with a profiler and registered with the
//! coordinator. Profiler parameters come from the `CACHE_PROFILER_*`
//! environment variables, the shard count from `CACHE_SHARD_SHIFT`.
//!
//! ## Example
//!
//! ```
//! use cachetune::builder::{CacheFactory, CacheStrategy};
//! use cachetune::traits::BatchCache;
//!
//! let cache = CacheFactory::create::<i64>(CacheStrategy::Lru, "emb/user_id", None);
//! cache.update(&[1, 2, 3]);
//! assert_eq!(cache.size(), 3);
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{self, ProfilerConfig};
use crate::policy::lfu::LfuCache;
use crate::policy::lru::LruCache;
use crate::policy::sharded_lru::ShardedLruCache;
use crate::profile::profiled::ProfiledCache;
use crate::traits::{BatchCache, CacheKey, TunableCache};
use crate::tune::manager::{CacheManager, MockTunableCache};

/// Eviction/coordination strategy for a new cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Plain recency cache.
    Lru,
    /// Frequency cache.
    Lfu,
    /// Recency cache sharded by key residue (`CACHE_SHARD_SHIFT`).
    ShardedLru,
    /// LRU wrapped with an AET profiler and coordinated by the manager.
    ProfiledLru,
    /// Sharded LRU wrapped with an AET profiler.
    ProfiledShardedLru,
}

impl CacheStrategy {
    /// Parses a strategy name; unknown names fall back to LFU, matching
    /// the storage configuration convention.
    pub fn from_name(name: &str) -> Self {
        match name {
            "LRU" | "lru" => Self::Lru,
            "LFU" | "lfu" => Self::Lfu,
            "ShardedLRU" | "sharded_lru" => Self::ShardedLru,
            "ProfiledLRU" | "profiled_lru" => Self::ProfiledLru,
            "ProfiledShardedLRU" | "profiled_sharded_lru" => Self::ProfiledShardedLru,
            other => {
                warn!(strategy = other, "invalid cache strategy, using LFU");
                Self::Lfu
            },
        }
    }
}

/// Constructs caches for the surrounding storage system.
pub struct CacheFactory;

impl CacheFactory {
    /// Creates a cache registered against the process-wide manager.
    ///
    /// `tunable` is the capacity surface of the storage tier backing this
    /// cache; profiled strategies register with the coordinator only when
    /// it is supplied.
    pub fn create<K: CacheKey>(
        strategy: CacheStrategy,
        name: impl Into<String>,
        tunable: Option<Arc<dyn TunableCache>>,
    ) -> Arc<dyn BatchCache<K>> {
        Self::create_with_manager(strategy, name, tunable, Arc::clone(CacheManager::global()))
    }

    /// Creates a cache against an explicit manager instance.
    pub fn create_with_manager<K: CacheKey>(
        strategy: CacheStrategy,
        name: impl Into<String>,
        tunable: Option<Arc<dyn TunableCache>>,
        manager: Arc<CacheManager>,
    ) -> Arc<dyn BatchCache<K>> {
        let name = name.into();
        match strategy {
            CacheStrategy::Lru => {
                info!(cache = %name, "using LRU in multi-tier embedding variable");
                Arc::new(LruCache::new(name))
            },
            CacheStrategy::Lfu => {
                info!(cache = %name, "using LFU in multi-tier embedding variable");
                Arc::new(LfuCache::new(name))
            },
            CacheStrategy::ShardedLru => {
                info!(cache = %name, "using ShardedLRU in multi-tier embedding variable");
                Arc::new(ShardedLruCache::new(name, config::read_shard_shift()))
            },
            CacheStrategy::ProfiledLru => {
                info!(cache = %name, "using ProfiledLRU in multi-tier embedding variable");
                let register = tunable.is_some();
                let tunable = tunable.unwrap_or_else(|| {
                    Arc::new(MockTunableCache::new(manager.config().total_size))
                });
                let cache = ProfiledCache::new(
                    LruCache::new(name.clone()),
                    name,
                    ProfilerConfig::from_env(),
                    tunable,
                    Arc::clone(&manager),
                );
                if register {
                    manager.register_cache(cache.profiler().clone());
                }
                Arc::new(cache)
            },
            CacheStrategy::ProfiledShardedLru => {
                info!(cache = %name, "using ProfiledShardedLRU in multi-tier embedding variable");
                let register = tunable.is_some();
                let tunable = tunable.unwrap_or_else(|| {
                    Arc::new(MockTunableCache::new(manager.config().total_size))
                });
                let cache = ProfiledCache::new(
                    ShardedLruCache::new(name.clone(), config::read_shard_shift()),
                    name,
                    ProfilerConfig::from_env(),
                    tunable,
                    Arc::clone(&manager),
                );
                if register {
                    manager.register_cache(cache.profiler().clone());
                }
                Arc::new(cache)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    #[test]
    fn from_name_parses_and_falls_back() {
        assert_eq!(CacheStrategy::from_name("LRU"), CacheStrategy::Lru);
        assert_eq!(
            CacheStrategy::from_name("ProfiledShardedLRU"),
            CacheStrategy::ProfiledShardedLru
        );
        assert_eq!(CacheStrategy::from_name("bogus"), CacheStrategy::Lfu);
    }

    #[test]
    fn creates_each_policy() {
        let manager = CacheManager::with_config(CacheConfig::default());
        for strategy in [CacheStrategy::Lru, CacheStrategy::Lfu, CacheStrategy::ShardedLru] {
            let cache = CacheFactory::create_with_manager::<i64>(
                strategy,
                format!("factory-{strategy:?}"),
                None,
                Arc::clone(&manager),
            );
            cache.update(&[1, 2, 3]);
            assert_eq!(cache.size(), 3);
        }
    }

    #[test]
    fn profiled_without_tunable_is_not_registered() {
        let manager = CacheManager::with_config(CacheConfig::default());
        let cache = CacheFactory::create_with_manager::<i64>(
            CacheStrategy::ProfiledLru,
            "factory-unregistered",
            None,
            Arc::clone(&manager),
        );
        cache.update(&[1, 2]);
        assert!(!manager.check_cache());
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn profiled_with_tunable_registers() {
        let manager = CacheManager::with_config(CacheConfig {
            tune_loop_millis: 10,
            ..CacheConfig::default()
        });
        let tunable: Arc<dyn TunableCache> = Arc::new(MockTunableCache::new(1024));
        let cache = CacheFactory::create_with_manager::<i64>(
            CacheStrategy::ProfiledLru,
            "factory-registered",
            Some(tunable.clone()),
            Arc::clone(&manager),
        );
        assert!(manager.check_cache());
        // Registration assigned the full budget to the single cache.
        assert_eq!(tunable.cache_size(), manager.config().total_size);
        drop(cache);
        assert!(!manager.check_cache());
    }
}
