//! The cache facade shared by request handlers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::clock::{SharedClock, SystemClock};
use super::config::{CacheConfig, StoreBackend};
use super::flight::InFlightFills;
use super::redis::{RedisConnection, RedisStore, RedisTagIndex};
use super::store::{CacheStore, MemoryStore, StoreResult};
use super::strategy::StrategyRegistry;
use super::tags::{MemoryTagIndex, TagIndex};

/// Read-through cache with tag invalidation.
///
/// Cheap to clone; clones share the store, tag index and in-flight fills.
#[derive(Clone)]
pub struct UnifiedCache {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) registry: Arc<StrategyRegistry>,
    pub(crate) store: Arc<dyn CacheStore>,
    pub(crate) tags: Arc<dyn TagIndex>,
    pub(crate) flights: Arc<InFlightFills>,
    pub(crate) clock: SharedClock,
    /// Fill write-backs hold the read side, purges the write side.
    pub(crate) purge_gate: RwLock<()>,
    pub(crate) producer_timeout: Duration,
    pub(crate) fill_lock_lease: Duration,
    pub(crate) fill_lock_poll: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub store: &'static str,
    pub tags: usize,
    pub tagged_keys: usize,
    pub in_flight: usize,
}

impl UnifiedCache {
    pub fn new(
        config: &CacheConfig,
        registry: Arc<StrategyRegistry>,
        store: Arc<dyn CacheStore>,
        tags: Arc<dyn TagIndex>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                tags,
                flights: Arc::new(InFlightFills::new()),
                clock,
                purge_gate: RwLock::new(()),
                producer_timeout: config.producer_timeout,
                fill_lock_lease: config.fill_lock_lease,
                fill_lock_poll: config.fill_lock_poll,
            }),
        }
    }

    /// Memory-backed cache on the wall clock.
    pub fn in_memory(config: &CacheConfig, registry: Arc<StrategyRegistry>) -> Self {
        Self::in_memory_with_clock(config, registry, Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(
        config: &CacheConfig,
        registry: Arc<StrategyRegistry>,
        clock: SharedClock,
    ) -> Self {
        let store = Arc::new(MemoryStore::new(config, Arc::clone(&clock)));
        Self::new(
            config,
            registry,
            store,
            Arc::new(MemoryTagIndex::new()),
            clock,
        )
    }

    /// Build the cache for the configured backend.
    ///
    /// Only a malformed Redis URL is an error. An unreachable server is logged
    /// and the cache starts degraded, reconnecting on later operations.
    pub async fn connect(
        config: &CacheConfig,
        registry: Arc<StrategyRegistry>,
    ) -> StoreResult<Self> {
        match &config.backend {
            StoreBackend::Memory => {
                info!(
                    cache = "memory",
                    capacity = config.memory_capacity,
                    "Using in-process cache store"
                );
                Ok(Self::in_memory(config, registry))
            }
            StoreBackend::Redis { url, namespace } => {
                let conn = RedisConnection::open(url)?;
                if conn.get().await.is_err() {
                    warn!(
                        cache = "redis",
                        namespace = %namespace,
                        "Starting with Redis unreachable; every lookup runs its producer until it returns"
                    );
                } else {
                    info!(cache = "redis", namespace = %namespace, "Using Redis cache store");
                }
                let store = RedisStore::new(conn.clone(), namespace);
                let tags = RedisTagIndex::new(conn, namespace);
                Ok(Self::new(
                    config,
                    registry,
                    Arc::new(store),
                    Arc::new(tags),
                    Arc::new(SystemClock),
                ))
            }
        }
    }

    pub fn registry(&self) -> &Arc<StrategyRegistry> {
        &self.inner.registry
    }

    pub async fn stats(&self) -> StoreResult<CacheStats> {
        let index = self.inner.tags.stats().await?;
        Ok(CacheStats {
            store: self.inner.store.name(),
            tags: index.tags,
            tagged_keys: index.keys,
            in_flight: self.inner.flights.len(),
        })
    }
}
