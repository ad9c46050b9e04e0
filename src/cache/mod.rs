//! Unified caching layer.
//!
//! - **Strategies**: a closed set of named policies (TTL, stale window, CDN
//!   TTL, cacheability) resolved through [`StrategyRegistry`].
//! - **Executor**: [`UnifiedCache::cached_query`] reads through the store,
//!   coalescing concurrent fills of the same key.
//! - **Tags**: entries are recorded under tags and purged in bulk.
//! - **Responses**: [`ResponseSynthesizer`] renders payloads with the
//!   matching `Cache-Control` and CDN headers.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379/"
//! producer_timeout_ms = 10000
//!
//! [cache.strategies.DYNAMIC_CONTENT]
//! max_age_secs = 30
//! ```

mod clock;
mod config;
mod entry;
mod error;
mod executor;
mod flight;
mod keys;
mod lock;
mod metrics;
mod purge;
mod redis;
mod response;
mod store;
mod strategy;
mod tags;
mod unified;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{CacheConfig, DEFAULT_CDN_HEADER, StoreBackend};
pub use entry::{CacheEntry, Freshness};
pub use error::{BoxError, CacheError};
pub use executor::{CacheStatus, Cached};
pub use keys::{CacheKey, canonical_query};
pub use metrics::{
    METRIC_BYPASS, METRIC_COALESCED, METRIC_EVICT, METRIC_HIT, METRIC_MISS, METRIC_PRODUCE_MS,
    METRIC_PRODUCER_ERROR, METRIC_PURGED, METRIC_STALE, METRIC_STORE_ERROR,
};
pub use purge::PurgeReport;
pub use redis::{RECONNECT_BACKOFF, RedisConnection, RedisStore, RedisTagIndex};
pub use response::{
    ResponseSynthesizer, SynthesizerError, X_BUILD_ID, X_CACHE, apply_no_store,
    cache_control_value, cdn_cache_control_value, default_cdn_header,
};
pub use store::{CacheStore, FillLock, MemoryStore, StoreError, StoreResult};
pub use strategy::{Strategy, StrategyError, StrategyName, StrategyOverride, StrategyRegistry};
pub use tags::{MemoryTagIndex, TagIndex, TagIndexStats};
pub use unified::{CacheStats, UnifiedCache};
