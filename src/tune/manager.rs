//! # Cache Manager
//!
//! Process-wide coordinator for every profiled cache. Keeps the registry,
//! accounts accesses, runs the background tuning worker and gates whether
//! profilers sample at all.
//!
//! ## Tuning loop
//!
//! ```text
//!   register ──► equal split of total_size ──► worker thread (single)
//!                                                   │  every ~1 s
//!                                                   ▼
//!                            access_count > step · interval · n_caches ?
//!                                                   │ yes
//!                      ┌────────────────────────────┴─────────────────┐
//!                      │ promotion/demotion deltas > 20 % anywhere?   │
//!                      │   yes → reactivate sampling, reset counter   │
//!                      └────────────────────────────┬─────────────────┘
//!                                                   ▼
//!                              sampling active? ── no ──► skip
//!                                                   │ yes
//!                                                   ▼
//!                 Tune: snapshot registry → GetMRC per cache → strategy
//!                       improved → SetCacheSize everywhere, counter = 0
//!                       else     → counter += 1; past threshold → stop
//!                                  sampling, release profiler memory
//! ```
//!
//! The worker exits when the registry becomes empty; deregistering the
//! last cache is the shutdown signal. A later registration starts a fresh
//! worker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::traits::{CacheMrcProfiler, TunableCache};
use crate::tune::strategy::{self, CacheItem, CacheTuningStrategy};

static GLOBAL: Lazy<Arc<CacheManager>> =
    Lazy::new(|| CacheManager::with_config(CacheConfig::from_env()));

/// Promotion/demotion readings from the previous tune pass.
#[derive(Debug, Default, Clone, Copy)]
struct CacheStat {
    prev_promotion: u64,
    prev_demotion: u64,
}

struct ManagerInner {
    registry: BTreeMap<String, Arc<dyn CacheMrcProfiler>>,
    stats: BTreeMap<String, CacheStat>,
}

/// Result of one tuning pass.
///
/// `new_mc_sum < orig_mc_sum` whenever `improved` is set; proposals that
/// do not strictly lower the total expected miss count are discarded and
/// leave cache sizes untouched.
#[derive(Debug, Clone, Copy)]
pub struct TuneOutcome {
    /// Whether the strategy's proposal was applied.
    pub improved: bool,
    /// Total expected miss count at the incoming sizes.
    pub orig_mc_sum: u64,
    /// Total expected miss count after the strategy ran.
    pub new_mc_sum: u64,
}

/// Singleton coordinator. See the module docs for the loop shape.
pub struct CacheManager {
    inner: Mutex<ManagerInner>,
    strategy: Box<dyn CacheTuningStrategy>,
    config: CacheConfig,
    weak_self: Weak<CacheManager>,

    access_count: AtomicU64,
    access_bytes: AtomicU64,
    cache_nanos: AtomicU64,
    profiler_nanos: AtomicU64,

    sampling_active: AtomicBool,
    num_active_threads: AtomicU64,
    spawn_flag: AtomicBool,
    step: AtomicU64,
    notune_counter: AtomicU64,
}

impl CacheManager {
    /// The process-wide instance, configured from the environment on first
    /// use.
    pub fn global() -> &'static Arc<CacheManager> {
        &GLOBAL
    }

    /// Builds an isolated manager; embedders and tests can run several
    /// side by side.
    pub fn with_config(config: CacheConfig) -> Arc<Self> {
        let strategy = strategy::create_strategy(&config.tuning_strategy);
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(ManagerInner {
                registry: BTreeMap::new(),
                stats: BTreeMap::new(),
            }),
            strategy,
            config,
            weak_self: weak.clone(),
            access_count: AtomicU64::new(0),
            access_bytes: AtomicU64::new(0),
            cache_nanos: AtomicU64::new(0),
            profiler_nanos: AtomicU64::new(0),
            sampling_active: AtomicBool::new(true),
            num_active_threads: AtomicU64::new(0),
            spawn_flag: AtomicBool::new(false),
            step: AtomicU64::new(1),
            notune_counter: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Registers a profiled cache. All registered caches are re-assigned
    /// an equal share of the budget, and the tuning worker is started if
    /// it is not already running.
    pub fn register_cache(&self, cache: Arc<dyn CacheMrcProfiler>) {
        {
            let mut inner = self.inner.lock();
            let name = cache.name().to_string();
            if inner.registry.contains_key(&name) {
                warn!(cache = %name, "cache name already registered, replacing");
            }
            inner.registry.insert(name.clone(), cache);
            inner.stats.insert(name, CacheStat::default());

            let size = self.config.total_size / inner.registry.len();
            for registered in inner.registry.values() {
                registered.set_cache_size(size);
            }
        }
        if self.num_active_threads.load(Ordering::Acquire) < 1 {
            self.start_thread();
        }
    }

    /// Removes a cache from coordination. The worker exits on its own once
    /// the registry is empty.
    pub fn unregister_cache(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner.registry.remove(name);
        inner.stats.remove(name);
    }

    /// Accounts a batch of cache accesses: `count` keys touching `bytes`
    /// bytes of entry payload.
    pub fn access(&self, count: u64, bytes: u64) {
        self.access_count.fetch_add(count, Ordering::Relaxed);
        self.access_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Accumulates time spent in the underlying cache and in the profiler,
    /// reported by profiled wrappers for diagnostics.
    pub fn add_latency(&self, cache_nanos: u64, profiler_nanos: u64) {
        self.cache_nanos.fetch_add(cache_nanos, Ordering::Relaxed);
        self.profiler_nanos
            .fetch_add(profiler_nanos, Ordering::Relaxed);
    }

    /// Whether profiled caches should feed their profilers right now.
    pub fn sampling_active(&self) -> bool {
        self.sampling_active.load(Ordering::Relaxed)
    }

    /// Total keys accounted via [`access`](Self::access).
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Total entry bytes accounted via [`access`](Self::access).
    pub fn access_bytes(&self) -> u64 {
        self.access_bytes.load(Ordering::Relaxed)
    }

    /// Whether any cache is currently registered.
    pub fn check_cache(&self) -> bool {
        !self.inner.lock().registry.is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn CacheMrcProfiler>)> {
        self.inner
            .lock()
            .registry
            .iter()
            .map(|(name, cache)| (name.clone(), Arc::clone(cache)))
            .collect()
    }

    /// Runs one tuning pass over the current registry if sampling is
    /// active. Normally driven by the worker; exposed so embedders can
    /// force a pass. Returns `None` when sampling is suspended or the
    /// registry is empty.
    pub fn tune(&self, total_size: usize, unit: usize) -> Option<TuneOutcome> {
        if !self.sampling_active() {
            return None;
        }
        let caches = self.snapshot();
        if caches.is_empty() {
            return None;
        }
        let outcome = self.do_tune(total_size, caches, unit);
        info!(
            cache_millis = self.cache_nanos.load(Ordering::Relaxed) / 1_000_000,
            profiler_millis = self.profiler_nanos.load(Ordering::Relaxed) / 1_000_000,
            "accumulated wrapper latency"
        );
        Some(outcome)
    }

    fn do_tune(
        &self,
        total_size: usize,
        caches: Vec<(String, Arc<dyn CacheMrcProfiler>)>,
        unit: usize,
    ) -> TuneOutcome {
        let mut items: BTreeMap<String, CacheItem> = BTreeMap::new();
        let mut handles: BTreeMap<String, Arc<dyn CacheMrcProfiler>> = BTreeMap::new();

        for (name, cache) in caches {
            let bucket_size = cache.bucket_size();
            let size = cache.cache_size();
            let entry_size = cache.cache_entry_size().max(1);
            let num_entries = size / entry_size;
            let mrc = cache.get_mrc(size.saturating_mul(10));
            let mr = strategy::interpolate_mrc(&mrc, bucket_size, num_entries);
            let vc = mrc[mrc.len() - 1] as u64;
            let mc = (mr * vc as f64) as u64;
            let actual_hr = cache.hit_rate();
            let actual_hc = (actual_hr * vc as f64) as u64;
            let estimated_hc = vc.saturating_sub(mc);
            info!(
                cache = %name,
                estimated_hit_count = estimated_hc,
                actual_hit_count = actual_hc,
                relative_error = if actual_hc > 0 {
                    (estimated_hc as f64 - actual_hc as f64) / actual_hc as f64
                } else {
                    0.0
                },
                "tuning snapshot"
            );
            items.insert(
                name.clone(),
                CacheItem::new(bucket_size, size, entry_size, vc, mc, mr, mrc),
            );
            if self.config.clear_stat {
                cache.reset_profiling();
                cache.reset_stat();
            }
            handles.insert(name, cache);
        }

        let orig_mc_sum: u64 = items.values().map(|item| item.mc).sum();
        let success = self
            .strategy
            .do_tune(total_size, &mut items, unit, self.config.min_size);
        let new_mc_sum: u64 = items.values().map(|item| item.mc).sum();
        if success {
            for (name, item) in &items {
                if let Some(cache) = handles.get(name) {
                    cache.set_cache_size(item.new_size);
                }
            }
            self.notune_counter.store(0, Ordering::Relaxed);
        } else {
            self.notune_counter.fetch_add(1, Ordering::Relaxed);
        }

        let notune = self.notune_counter.load(Ordering::Relaxed);
        if notune > self.config.stable_steps {
            self.sampling_active.store(false, Ordering::Release);
            for cache in handles.values() {
                cache.stop_sampling_and_release();
            }
            info!(
                consecutive = notune,
                "continuous tuning did not succeed, stop sampling"
            );
        }
        info!(orig_mc_sum, new_mc_sum, applied = success, "tuning done");
        TuneOutcome {
            improved: success,
            orig_mc_sum,
            new_mc_sum,
        }
    }

    fn start_thread(&self) {
        while self
            .spawn_flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        if self.num_active_threads.load(Ordering::Acquire) < 1 {
            // Upgrade always succeeds here: callers reach us through the
            // Arc handed out by with_config.
            if let Some(manager) = self.weak_self.upgrade() {
                self.num_active_threads.fetch_add(1, Ordering::Relaxed);
                info!("scheduling tuning thread");
                std::thread::Builder::new()
                    .name("cache-manager-tune".to_string())
                    .spawn(move || manager.tune_loop())
                    .expect("failed to spawn cache manager tuning thread");
            }
        }
        self.spawn_flag.store(false, Ordering::Release);
    }

    fn tune_loop(self: Arc<Self>) {
        info!("tuning loop begin");
        while self.check_cache() {
            let access = self.access_count.load(Ordering::Relaxed);
            let cache_count = self.inner.lock().registry.len() as u64;
            let threshold = self
                .step
                .load(Ordering::Relaxed)
                .saturating_mul(self.config.tuning_interval)
                .saturating_mul(cache_count);
            if cache_count > 0 && access > threshold {
                let reactivate = self.scan_move_counts();
                if reactivate {
                    self.notune_counter.store(0, Ordering::Relaxed);
                    let was_active = self.sampling_active.swap(true, Ordering::Release);
                    if !was_active {
                        for (_, cache) in self.snapshot() {
                            cache.start_sampling();
                        }
                    }
                }
                if self.sampling_active() {
                    info!(access_count = access, "doing tune");
                    self.tune(self.config.total_size, self.config.tuning_unit);
                } else {
                    info!(access_count = access, "tuning not active");
                }
                let next_step = access / (self.config.tuning_interval * cache_count) + 1;
                self.step.store(next_step, Ordering::Relaxed);
            }
            std::thread::sleep(Duration::from_millis(self.config.tune_loop_millis));
        }
        self.num_active_threads.fetch_sub(1, Ordering::Release);
        info!("tuning thread exit");
    }

    /// Compares each cache's promotion/demotion counters against the
    /// previous pass; a relative change above 20 % anywhere asks for
    /// sampling to be reactivated.
    fn scan_move_counts(&self) -> bool {
        let mut inner = self.inner.lock();
        let ManagerInner { registry, stats } = &mut *inner;
        let mut reactivate = false;
        for (name, cache) in registry.iter() {
            let (promotions, demotions) = cache.move_count();
            cache.reset_move_count();
            let stat = stats.entry(name.clone()).or_default();
            if stat.prev_promotion != 0 {
                let diff = stat.prev_promotion as i64 - promotions as i64;
                let relative = (diff as f64).abs() / stat.prev_promotion as f64;
                if relative > 0.2 {
                    reactivate = true;
                    info!(cache = %name, relative, "promotion diff, reactivating sampling");
                }
            }
            if stat.prev_demotion != 0 {
                let diff = stat.prev_demotion as i64 - demotions as i64;
                let relative = (diff as f64).abs() / stat.prev_demotion as f64;
                if relative > 0.2 {
                    reactivate = true;
                    info!(cache = %name, relative, "demotion diff, reactivating sampling");
                }
            }
            stat.prev_promotion = promotions;
            stat.prev_demotion = demotions;
        }
        reactivate
    }
}

/// Stand-in [`TunableCache`] whose capacity is plain arithmetic over a
/// fixed 8-byte entry, for tests and embedders without a real storage
/// tier.
pub struct MockTunableCache {
    num_entries: AtomicUsize,
}

impl MockTunableCache {
    pub fn new(size: usize) -> Self {
        Self {
            num_entries: AtomicUsize::new(size / 8),
        }
    }
}

impl TunableCache for MockTunableCache {
    fn cache_size(&self) -> usize {
        self.num_entries.load(Ordering::Relaxed) * self.cache_entry_size()
    }

    fn set_cache_size(&self, new_size: usize) {
        self.num_entries
            .store(new_size / self.cache_entry_size(), Ordering::Relaxed);
    }

    fn cache_entry_size(&self) -> usize {
        8
    }

    fn hit_rate(&self) -> f64 {
        0.0
    }

    fn reset_stat(&self) {}

    fn move_count(&self) -> (u64, u64) {
        (0, 0)
    }

    fn reset_move_count(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted profiler: fixed curve, controllable move counts.
    struct StubProfiler {
        name: String,
        size: AtomicUsize,
        entry_size: usize,
        mrc: Vec<f64>,
        promotions: AtomicU64,
        demotions: AtomicU64,
        resets: AtomicU64,
        releases: AtomicU64,
    }

    impl StubProfiler {
        fn new(name: &str, mrc: Vec<f64>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                size: AtomicUsize::new(0),
                entry_size: 8,
                mrc,
                promotions: AtomicU64::new(0),
                demotions: AtomicU64::new(0),
                resets: AtomicU64::new(0),
                releases: AtomicU64::new(0),
            })
        }
    }

    impl TunableCache for StubProfiler {
        fn cache_size(&self) -> usize {
            self.size.load(Ordering::Relaxed)
        }
        fn set_cache_size(&self, new_size: usize) {
            self.size.store(new_size, Ordering::Relaxed);
        }
        fn cache_entry_size(&self) -> usize {
            self.entry_size
        }
        fn hit_rate(&self) -> f64 {
            0.5
        }
        fn reset_stat(&self) {}
        fn move_count(&self) -> (u64, u64) {
            (
                self.promotions.load(Ordering::Relaxed),
                self.demotions.load(Ordering::Relaxed),
            )
        }
        fn reset_move_count(&self) {}
    }

    impl CacheMrcProfiler for StubProfiler {
        fn get_mrc(&self, _max_cache_size: usize) -> Vec<f64> {
            self.mrc.clone()
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn reset_profiling(&self) {
            self.resets.fetch_add(1, Ordering::Relaxed);
        }
        fn bucket_size(&self) -> usize {
            10
        }
        fn stop_sampling_and_release(&self) {
            self.releases.fetch_add(1, Ordering::Relaxed);
        }
        fn start_sampling(&self) {}
    }

    fn test_config() -> CacheConfig {
        CacheConfig {
            tuning_interval: 1000,
            total_size: 8000,
            min_size: 800,
            tuning_unit: 80,
            tuning_strategy: "min_mc_random_greedy".to_string(),
            clear_stat: false,
            stable_steps: 2,
            tune_loop_millis: 10,
        }
    }

    fn sloped_mrc(span: usize, vc: f64) -> Vec<f64> {
        let mut mrc: Vec<f64> = (0..=span)
            .map(|i| 1.0 - i as f64 / span as f64)
            .collect();
        mrc.push(vc);
        mrc
    }

    #[test]
    fn register_assigns_equal_split() {
        let manager = CacheManager::with_config(test_config());
        let a = StubProfiler::new("a", vec![1.0, 0.5, 100.0]);
        let b = StubProfiler::new("b", vec![1.0, 0.5, 100.0]);
        manager.register_cache(a.clone());
        assert_eq!(a.cache_size(), 8000);
        manager.register_cache(b.clone());
        assert_eq!(a.cache_size(), 4000);
        assert_eq!(b.cache_size(), 4000);
        manager.unregister_cache("a");
        manager.unregister_cache("b");
    }

    #[test]
    fn access_accounting_accumulates() {
        let manager = CacheManager::with_config(test_config());
        manager.access(4, 32);
        manager.access(6, 48);
        assert_eq!(manager.access_count(), 10);
        assert_eq!(manager.access_bytes(), 80);
    }

    #[test]
    fn tune_applies_improved_sizes_within_budget() {
        let manager = CacheManager::with_config(test_config());
        // "hot" improves steeply with capacity, "flat" does not.
        let flat = StubProfiler::new("flat", vec![0.5, 0.5, 100000.0]);
        let hot = StubProfiler::new("hot", sloped_mrc(100, 100000.0));
        manager.register_cache(flat.clone());
        manager.register_cache(hot.clone());

        let outcome = manager.tune(8000, 80).expect("tune should run");
        assert!(outcome.improved);
        assert!(outcome.new_mc_sum < outcome.orig_mc_sum);

        let total = flat.cache_size() + hot.cache_size();
        assert!(total <= 8000, "budget exceeded: {total}");
        assert!(hot.cache_size() > flat.cache_size());
        assert_eq!(manager.notune_counter.load(Ordering::Relaxed), 0);

        manager.unregister_cache("flat");
        manager.unregister_cache("hot");
    }

    #[test]
    fn repeated_no_improvement_stops_sampling() {
        let manager = CacheManager::with_config(test_config());
        let a = StubProfiler::new("a", vec![0.3, 0.3, 50000.0]);
        let b = StubProfiler::new("b", vec![0.3, 0.3, 50000.0]);
        manager.register_cache(a.clone());
        manager.register_cache(b.clone());

        assert!(manager.sampling_active());
        for _ in 0..4 {
            if let Some(outcome) = manager.tune(8000, 80) {
                assert!(!outcome.improved);
            }
        }
        // stable_steps = 2: the third failed pass crosses the threshold.
        assert!(!manager.sampling_active());
        assert!(a.releases.load(Ordering::Relaxed) >= 1);

        // Once suspended, tune becomes a no-op.
        let before = a.resets.load(Ordering::Relaxed);
        assert!(manager.tune(8000, 80).is_none());
        assert_eq!(a.resets.load(Ordering::Relaxed), before);

        manager.unregister_cache("a");
        manager.unregister_cache("b");
    }

    #[test]
    fn clear_stat_resets_profiling_each_pass() {
        let mut config = test_config();
        config.clear_stat = true;
        let manager = CacheManager::with_config(config);
        let a = StubProfiler::new("a", sloped_mrc(100, 100000.0));
        manager.register_cache(a.clone());
        manager.tune(8000, 80);
        assert_eq!(a.resets.load(Ordering::Relaxed), 1);
        manager.unregister_cache("a");
    }

    #[test]
    fn worker_runs_and_exits_when_registry_empties() {
        let manager = CacheManager::with_config(test_config());
        let hot = StubProfiler::new("worker-hot", sloped_mrc(100, 100000.0));
        let flat = StubProfiler::new("worker-flat", vec![0.5, 0.5, 100000.0]);
        manager.register_cache(hot.clone());
        manager.register_cache(flat.clone());
        assert_eq!(manager.num_active_threads.load(Ordering::Relaxed), 1);

        // Push past step * interval * n and give the 10 ms loop time to fire.
        manager.access(10_000, 80_000);
        std::thread::sleep(Duration::from_millis(300));
        assert!(hot.cache_size() > flat.cache_size());

        manager.unregister_cache("worker-hot");
        manager.unregister_cache("worker-flat");
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(manager.num_active_threads.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn mock_tunable_round_trips_size() {
        let mock = MockTunableCache::new(1024);
        assert_eq!(mock.cache_entry_size(), 8);
        assert_eq!(mock.cache_size(), 1024);
        mock.set_cache_size(2048);
        assert_eq!(mock.cache_size(), 2048);
    }
}
