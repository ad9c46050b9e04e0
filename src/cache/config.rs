//! Cache configuration.
//!
//! Built from the validated `[cache]` settings section.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use super::strategy::{StrategyName, StrategyOverride};

const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_PRODUCER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_FILL_LOCK_LEASE_MS: u64 = 5_000;
const DEFAULT_FILL_LOCK_POLL_MS: u64 = 50;
const DEFAULT_REDIS_NAMESPACE: &str = "hubcache";
pub const DEFAULT_CDN_HEADER: &str = "CDN-Cache-Control";

/// Where cache entries live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Per-process LRU map.
    Memory,
    /// Shared Redis instance; keys are prefixed with `namespace`.
    Redis { url: String, namespace: String },
}

impl StoreBackend {
    pub fn redis(url: impl Into<String>) -> Self {
        Self::Redis {
            url: url.into(),
            namespace: DEFAULT_REDIS_NAMESPACE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: StoreBackend,
    /// Maximum entries held by the memory backend.
    pub memory_capacity: usize,
    /// Producers running longer than this fail with a timeout.
    pub producer_timeout: Duration,
    /// Lease of the cross-instance fill lock (Redis backend only).
    pub fill_lock_lease: Duration,
    /// How often a contended filler polls the store for the winner's value.
    pub fill_lock_poll: Duration,
    pub strategy_overrides: HashMap<StrategyName, StrategyOverride>,
    /// Extra response headers mirroring `Cache-Control` for CDNs.
    pub cdn_headers: Vec<String>,
    /// Deployment identifier echoed as `X-Build-Id`.
    pub build_id: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            producer_timeout: Duration::from_millis(DEFAULT_PRODUCER_TIMEOUT_MS),
            fill_lock_lease: Duration::from_millis(DEFAULT_FILL_LOCK_LEASE_MS),
            fill_lock_poll: Duration::from_millis(DEFAULT_FILL_LOCK_POLL_MS),
            strategy_overrides: HashMap::new(),
            cdn_headers: vec![DEFAULT_CDN_HEADER.to_string()],
            build_id: None,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            backend: settings.backend.clone(),
            memory_capacity: settings.memory_capacity,
            producer_timeout: Duration::from_millis(settings.producer_timeout_ms),
            fill_lock_lease: Duration::from_millis(settings.fill_lock_lease_ms),
            fill_lock_poll: Duration::from_millis(settings.fill_lock_poll_ms),
            strategy_overrides: settings.strategies.clone(),
            cdn_headers: settings.cdn_headers.clone(),
            build_id: settings.build_id.clone(),
        }
    }
}

impl CacheConfig {
    /// Memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
