//! Capacity apportionment strategies.
//!
//! A strategy is a pure function over per-cache tuning snapshots
//! ([`CacheItem`]): given the global byte budget, the current sizes and
//! each cache's miss-ratio curve, it proposes new sizes that lower the
//! total expected miss count. The manager applies the proposal only when
//! the strategy reports an improvement.
//!
//! The default strategy (`min_mc_random_greedy`) seeds the search with a
//! random apportionment (exponential weights, normalised and rounded onto
//! the budget) and then hill-climbs with greedy one-unit transfers from the
//! cache that loses least to the cache that gains most.

use std::collections::BTreeMap;

use rand::Rng;
use tracing::{info, warn};

/// Per-cache snapshot handed to a strategy for one tuning pass.
///
/// `new_size` and `mc` are mutated in place as the strategy explores;
/// `orig_size`, `vc`, `mr` and the curve stay fixed.
#[derive(Debug, Clone)]
pub struct CacheItem {
    /// Histogram bucket width of the cache's profiler.
    pub bucket_size: usize,
    /// Size in bytes before the pass.
    pub orig_size: usize,
    /// Proposed size in bytes; starts equal to `orig_size`.
    pub new_size: usize,
    /// Bytes per cached entry.
    pub entry_size: usize,
    /// Visit count: total references captured by the curve.
    pub vc: u64,
    /// Expected miss count at `new_size`.
    pub mc: u64,
    /// Expected miss ratio at `new_size`.
    pub mr: f64,
    /// Miss-ratio curve; final element is the profiler timestamp.
    pub mrc: Vec<f64>,
}

impl CacheItem {
    pub fn new(
        bucket_size: usize,
        orig_size: usize,
        entry_size: usize,
        vc: u64,
        mc: u64,
        mr: f64,
        mrc: Vec<f64>,
    ) -> Self {
        Self {
            bucket_size,
            orig_size,
            new_size: orig_size,
            entry_size,
            vc,
            mc,
            mr,
            mrc,
        }
    }
}

/// Capacity apportionment strategy.
///
/// Implementations mutate `items[*].new_size`/`mc` toward a better
/// apportionment of `total_size` and return `true` iff the proposal's
/// total miss count strictly beats the incoming one. Items are keyed by
/// cache name; `BTreeMap` iteration order makes tie-breaking deterministic.
pub trait CacheTuningStrategy: Send + Sync {
    fn do_tune(
        &self,
        total_size: usize,
        items: &mut BTreeMap<String, CacheItem>,
        unit: usize,
        min_size: usize,
    ) -> bool;
}

/// Reads the expected miss ratio for a cache of `target` entries off an
/// MRC whose final element is a timestamp, clamping out-of-range targets
/// to the penultimate curve point.
pub fn interpolate_mrc(mrc: &[f64], bucket_size: usize, target: usize) -> f64 {
    let bucket = target as f64 / bucket_size as f64;
    let bucket_int = bucket.floor() as usize;
    if bucket_int >= mrc.len().saturating_sub(2) {
        return mrc[mrc.len() - 2];
    }
    if mrc.len() == 2 {
        return mrc[0];
    }
    mrc[bucket_int] + (bucket - bucket_int as f64) * (mrc[bucket_int + 1] - mrc[bucket_int])
}

/// Splits `total` across `parts` at random: exponential weights normalised
/// to the budget above the per-part floor, rounded, with the rounding error
/// repaired by ±1 nudges that never push a part non-positive, then the
/// floor added back to every part.
///
/// # Panics
///
/// Panics when `parts.len() * min_size >= total` — the floors alone exceed
/// the budget, a configuration error.
pub fn random_apportion(parts: &mut [usize], total: usize, min_size: usize) {
    let num_parts = parts.len();
    let resv_size = num_parts * min_size;
    if resv_size >= total {
        panic!("not enough size to partition: {num_parts} caches * min_size {min_size} >= total {total}");
    }
    let part_size = total - resv_size;

    let mut rng = rand::thread_rng();
    let mut apportion = vec![0f64; num_parts];
    let mut normalize_sum = 0.0;
    for part in apportion.iter_mut() {
        let sample: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        *part = -sample.ln();
        normalize_sum += *part;
    }
    for part in apportion.iter_mut() {
        *part /= normalize_sum;
    }

    let mut sum_apportion = 0usize;
    for (slot, weight) in parts.iter_mut().zip(&apportion) {
        let part = (weight * part_size as f64).round() as usize;
        sum_apportion += part;
        *slot = part;
    }

    let mut remaining = part_size as i64 - sum_apportion as i64;
    let step: i64 = if remaining > 0 { 1 } else { -1 };
    while remaining != 0 {
        let picked = rng.gen_range(0..num_parts);
        if parts[picked] as i64 + step > 0 {
            parts[picked] = (parts[picked] as i64 + step) as usize;
            remaining -= step;
        }
    }

    for part in parts.iter_mut() {
        *part += min_size;
    }
}

/// Default strategy: random apportion followed by greedy one-unit
/// transfers, accepted only on a strict total-miss-count improvement.
pub struct MinMissCountRandomGreedy;

impl MinMissCountRandomGreedy {
    fn expected_mc(item: &CacheItem, size: usize) -> (u64, f64) {
        let entries = size / item.entry_size;
        let mr = interpolate_mrc(&item.mrc, item.bucket_size, entries);
        ((mr * item.vc as f64) as u64, mr)
    }
}

impl CacheTuningStrategy for MinMissCountRandomGreedy {
    fn do_tune(
        &self,
        total_size: usize,
        items: &mut BTreeMap<String, CacheItem>,
        unit: usize,
        min_size: usize,
    ) -> bool {
        let orig_mc_sum: u64 = items.values().map(|item| item.mc).sum();

        // Random apportion and recompute each expectation at the new size.
        {
            let mut parts = vec![0usize; items.len()];
            random_apportion(&mut parts, total_size, min_size);
            for (item, new_size) in items.values_mut().zip(parts) {
                let (mc, mr) = Self::expected_mc(item, new_size);
                item.new_size = new_size;
                item.mr = mr;
                item.mc = mc;
            }
        }

        // Greedy one-unit transfers: move a unit from the cache that loses
        // least to the cache that gains most, while that is profitable.
        loop {
            let mut max_gain = 0u64;
            let mut gain_new_mc = 0u64;
            let mut gain_cache: Option<String> = None;
            for (name, item) in items.iter() {
                let new_entries = (item.new_size + unit) / item.entry_size;
                let new_mr = interpolate_mrc(&item.mrc, item.bucket_size, new_entries);
                let new_mc = (new_mr * item.vc as f64) as u64;
                let gain = item.mc.saturating_sub(new_mc);
                if gain > max_gain || gain_cache.is_none() {
                    max_gain = gain;
                    gain_new_mc = new_mc;
                    gain_cache = Some(name.clone());
                }
            }

            let mut min_loss = 0u64;
            let mut loss_new_mc = 0u64;
            let mut loss_cache: Option<String> = None;
            for (name, item) in items.iter() {
                if gain_cache.as_deref() == Some(name.as_str()) {
                    continue;
                }
                if item.new_size <= min_size + unit {
                    continue;
                }
                let new_entries = (item.new_size - unit) / item.entry_size;
                let new_mr = interpolate_mrc(&item.mrc, item.bucket_size, new_entries);
                let new_mc = (new_mr * item.vc as f64) as u64;
                let loss = new_mc.saturating_sub(item.mc);
                if loss < min_loss || loss_cache.is_none() {
                    min_loss = loss;
                    loss_new_mc = new_mc;
                    loss_cache = Some(name.clone());
                }
            }

            let (gain_name, loss_name) = match (gain_cache, loss_cache) {
                (Some(g), Some(l)) if max_gain > min_loss => (g, l),
                _ => break,
            };

            let gainer = items.get_mut(&gain_name).expect("gain cache missing");
            gainer.new_size += unit;
            gainer.mc = gain_new_mc;
            let donor = items.get_mut(&loss_name).expect("loss cache missing");
            donor.new_size -= unit;
            donor.mc = loss_new_mc;
        }

        let new_mc_sum: u64 = items.values().map(|item| item.mc).sum();
        info!(
            orig_mc = orig_mc_sum,
            new_mc = new_mc_sum,
            diff = orig_mc_sum as i64 - new_mc_sum as i64,
            "tuning strategy finished"
        );
        if new_mc_sum >= orig_mc_sum {
            info!("new miss count not below original, keeping current sizes");
            return false;
        }
        true
    }
}

/// Creates a strategy by name; unknown names fall back to the default
/// `min_mc_random_greedy` with a warning.
pub fn create_strategy(name: &str) -> Box<dyn CacheTuningStrategy> {
    match name {
        "min_mc_random_greedy" => Box::new(MinMissCountRandomGreedy),
        other => {
            warn!(
                strategy = other,
                "unknown tuning strategy, using default min_mc_random_greedy"
            );
            Box::new(MinMissCountRandomGreedy)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_item(orig_size: usize, vc: u64, mr: f64) -> CacheItem {
        // Two-point curve + timestamp: constant miss ratio at any size.
        let mc = (mr * vc as f64) as u64;
        CacheItem::new(10, orig_size, 8, vc, mc, mr, vec![mr, mr, vc as f64])
    }

    /// Curve dropping linearly from 1.0 to `floor` over `span` buckets.
    fn sloped_item(orig_size: usize, vc: u64, span: usize, floor: f64) -> CacheItem {
        let mut mrc: Vec<f64> = (0..=span)
            .map(|i| 1.0 - (1.0 - floor) * i as f64 / span as f64)
            .collect();
        mrc.push(vc as f64);
        let entries = orig_size / 8;
        let mr = interpolate_mrc(&mrc, 10, entries);
        let mc = (mr * vc as f64) as u64;
        CacheItem::new(10, orig_size, 8, vc, mc, mr, mrc)
    }

    #[test]
    fn interpolate_clamps_out_of_range() {
        let mrc = vec![1.0, 0.5, 0.25, 1000.0];
        // Bucket 50 is far past the curve: clamp to the penultimate value.
        assert_eq!(interpolate_mrc(&mrc, 10, 500), 0.25);
    }

    #[test]
    fn interpolate_linear_between_points() {
        let mrc = vec![1.0, 0.5, 0.25, 1000.0];
        // Entries 5, bucket width 10: halfway between 1.0 and 0.5.
        let mr = interpolate_mrc(&mrc, 10, 5);
        assert!((mr - 0.75).abs() < 1e-12);
        assert_eq!(interpolate_mrc(&mrc, 10, 0), 1.0);
    }

    #[test]
    fn interpolate_degenerate_curve() {
        let mrc = vec![1.0, 42.0];
        assert_eq!(interpolate_mrc(&mrc, 10, 0), 1.0);
        assert_eq!(interpolate_mrc(&mrc, 10, 1000), 1.0);
    }

    #[test]
    fn apportion_preserves_total_and_floor() {
        let mut parts = vec![0usize; 4];
        random_apportion(&mut parts, 10_000, 100);
        assert_eq!(parts.iter().sum::<usize>(), 10_000);
        for &part in &parts {
            assert!(part >= 100);
        }
    }

    #[test]
    fn apportion_single_part_gets_everything() {
        let mut parts = vec![0usize; 1];
        random_apportion(&mut parts, 500, 10);
        assert_eq!(parts, vec![500]);
    }

    #[test]
    #[should_panic(expected = "not enough size to partition")]
    fn apportion_floor_over_budget_is_fatal() {
        let mut parts = vec![0usize; 4];
        random_apportion(&mut parts, 100, 100);
    }

    #[test]
    fn tune_shifts_budget_toward_sloped_cache() {
        // Cache "hot" benefits from more capacity; "flat" does not.
        let mut items = BTreeMap::new();
        items.insert("flat".to_string(), flat_item(4000, 100_000, 0.5));
        items.insert("hot".to_string(), sloped_item(4000, 100_000, 100, 0.0));
        let orig_mc: u64 = items.values().map(|item| item.mc).sum();

        let strategy = MinMissCountRandomGreedy;
        let improved = strategy.do_tune(8000, &mut items, 80, 800);

        assert!(improved);
        let new_mc: u64 = items.values().map(|item| item.mc).sum();
        assert!(new_mc < orig_mc);
        // Budget is conserved by the proposal.
        let total: usize = items.values().map(|item| item.new_size).sum();
        assert_eq!(total, 8000);
        // The cache with the sloped curve ends up with the lion's share.
        assert!(items["hot"].new_size > items["flat"].new_size);
        for item in items.values() {
            assert!(item.new_size >= 800);
        }
    }

    #[test]
    fn tune_reports_no_improvement_on_flat_curves() {
        // Both caches miss at a fixed ratio regardless of size: no split
        // can beat the incoming expectation.
        let mut items = BTreeMap::new();
        items.insert("a".to_string(), flat_item(4000, 50_000, 0.3));
        items.insert("b".to_string(), flat_item(4000, 50_000, 0.3));
        let strategy = MinMissCountRandomGreedy;
        assert!(!strategy.do_tune(8000, &mut items, 80, 800));
    }

    #[test]
    fn unknown_strategy_falls_back() {
        // Must not panic; returns the default strategy.
        let strategy = create_strategy("definitely_not_a_strategy");
        let mut items = BTreeMap::new();
        items.insert("a".to_string(), flat_item(4000, 1000, 0.5));
        let _ = strategy.do_tune(8000, &mut items, 80, 100);
    }
}
