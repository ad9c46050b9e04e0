//! Metric names and emission helpers for the cache layer.

use std::time::Duration;

use metrics::{counter, histogram};

use super::strategy::StrategyName;

pub const METRIC_HIT: &str = "hubcache_cache_hit_total";
pub const METRIC_STALE: &str = "hubcache_cache_stale_total";
pub const METRIC_MISS: &str = "hubcache_cache_miss_total";
pub const METRIC_COALESCED: &str = "hubcache_cache_coalesced_total";
pub const METRIC_BYPASS: &str = "hubcache_cache_bypass_total";
pub const METRIC_EVICT: &str = "hubcache_cache_evict_total";
pub const METRIC_PRODUCER_ERROR: &str = "hubcache_cache_producer_error_total";
pub const METRIC_STORE_ERROR: &str = "hubcache_cache_store_error_total";
pub const METRIC_PURGED: &str = "hubcache_cache_purged_total";
pub const METRIC_PRODUCE_MS: &str = "hubcache_cache_produce_ms";

pub(crate) fn lookup(metric: &'static str, strategy: StrategyName) {
    counter!(metric, "strategy" => strategy.as_str()).increment(1);
}

pub(crate) fn evicted(count: usize) {
    if count > 0 {
        counter!(METRIC_EVICT).increment(count as u64);
    }
}

pub(crate) fn producer_error(strategy: StrategyName, kind: &'static str) {
    counter!(METRIC_PRODUCER_ERROR, "strategy" => strategy.as_str(), "kind" => kind).increment(1);
}

pub(crate) fn store_error(op: &'static str) {
    counter!(METRIC_STORE_ERROR, "op" => op).increment(1);
}

pub(crate) fn purged(scope: &'static str, keys: usize) {
    counter!(METRIC_PURGED, "scope" => scope).increment(keys as u64);
}

pub(crate) fn produce_latency(strategy: StrategyName, elapsed: Duration) {
    histogram!(METRIC_PRODUCE_MS, "strategy" => strategy.as_str())
        .record(elapsed.as_secs_f64() * 1000.0);
}
