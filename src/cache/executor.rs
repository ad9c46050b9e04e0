//! Read-through query execution.
//!
//! A lookup resolves to one of: bypass (uncacheable strategy), fresh hit,
//! stale hit with a background refresh, or a fill shared by every caller of
//! the same key. Fills run in their own task so a disconnecting caller never
//! cancels work other callers are waiting on.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::entry::{CacheEntry, Freshness};
use super::error::{BoxError, CacheError};
use super::flight::{FlightGuard, Joined};
use super::metrics::{
    self, METRIC_BYPASS, METRIC_COALESCED, METRIC_HIT, METRIC_MISS, METRIC_STALE,
};
use super::store::FillLock;
use super::strategy::{Strategy, StrategyName};
use super::unified::{Inner, UnifiedCache};

/// How a cached query was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Fresh entry, producer not called.
    Hit,
    /// Stale entry served; a refresh runs in the background.
    Stale,
    /// This caller's fill produced the value.
    Miss,
    /// Joined a fill started by another caller.
    Coalesced,
    /// Strategy is not cacheable; the producer ran directly.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
            CacheStatus::Miss => "MISS",
            CacheStatus::Coalesced => "COALESCED",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub status: CacheStatus,
}

impl UnifiedCache {
    pub async fn cached_query<T, E, F, Fut>(
        &self,
        key: &str,
        strategy: StrategyName,
        producer: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute(key, strategy, BTreeSet::new(), producer)
            .await
            .map(|cached| cached.value)
    }

    /// Like [`cached_query`](Self::cached_query), registering the stored entry under `tags`.
    pub async fn cached_query_tagged<T, E, F, Fut, I>(
        &self,
        key: &str,
        strategy: StrategyName,
        tags: I,
        producer: F,
    ) -> Result<T, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.execute(key, strategy, collect_tags(tags), producer)
            .await
            .map(|cached| cached.value)
    }

    pub async fn cached_query_traced<T, E, F, Fut>(
        &self,
        key: &str,
        strategy: StrategyName,
        producer: F,
    ) -> Result<Cached<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.execute(key, strategy, BTreeSet::new(), producer).await
    }

    pub async fn cached_query_tagged_traced<T, E, F, Fut, I>(
        &self,
        key: &str,
        strategy: StrategyName,
        tags: I,
        producer: F,
    ) -> Result<Cached<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.execute(key, strategy, collect_tags(tags), producer)
            .await
    }

    #[instrument(skip_all, fields(key = %key, strategy = %strategy))]
    async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        strategy: StrategyName,
        tags: BTreeSet<String>,
        producer: F,
    ) -> Result<Cached<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let policy = self.inner.registry.get(strategy).clone();

        if !policy.cacheable {
            metrics::lookup(METRIC_BYPASS, strategy);
            debug!(cache = "executor", outcome = "bypass", "Strategy is not cacheable");
            let value = produce(producer, self.inner.producer_timeout, strategy).await?;
            return Ok(Cached {
                value,
                status: CacheStatus::Bypass,
            });
        }

        let existing = match self.inner.store.get(key).await {
            Ok(entry) => entry,
            Err(err) => {
                metrics::store_error("get");
                warn!(
                    cache = "executor",
                    store = self.inner.store.name(),
                    error = %err,
                    outcome = "store_error",
                    "Cache lookup failed; treating as miss"
                );
                None
            }
        };

        if let Some(entry) = existing {
            match entry.freshness(self.inner.clock.now()) {
                Freshness::Fresh => match decode::<T>(entry.value) {
                    Ok(value) => {
                        metrics::lookup(METRIC_HIT, strategy);
                        debug!(cache = "executor", outcome = "hit", "Serving fresh entry");
                        return Ok(Cached {
                            value,
                            status: CacheStatus::Hit,
                        });
                    }
                    Err(err) => warn_undecodable(&err),
                },
                Freshness::Stale if policy.serves_stale() => match decode::<T>(entry.value) {
                    Ok(value) => {
                        metrics::lookup(METRIC_STALE, strategy);
                        let joined = self.start_fill(key, policy, tags, producer);
                        debug!(
                            cache = "executor",
                            outcome = "stale",
                            refresh_started = joined.is_leader(),
                            "Serving stale entry while refreshing"
                        );
                        return Ok(Cached {
                            value,
                            status: CacheStatus::Stale,
                        });
                    }
                    Err(err) => warn_undecodable(&err),
                },
                _ => {}
            }
        }

        let joined = self.start_fill(key, policy, tags, producer);
        let status = if joined.is_leader() {
            metrics::lookup(METRIC_MISS, strategy);
            CacheStatus::Miss
        } else {
            metrics::lookup(METRIC_COALESCED, strategy);
            CacheStatus::Coalesced
        };
        debug!(cache = "executor", outcome = status.as_str(), "Awaiting fill");

        let value = joined.into_future().await?;
        Ok(Cached {
            value: decode::<T>(value)?,
            status,
        })
    }

    fn start_fill<T, E, F, Fut>(
        &self,
        key: &str,
        policy: Strategy,
        tags: BTreeSet<String>,
        producer: F,
    ) -> Joined
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let flight_tags = tags.clone();
        self.inner
            .flights
            .join_or_start(key, &flight_tags, move |guard| {
                let strategy = policy.name;
                let task = tokio::spawn(fill(inner, guard, policy, tags, producer));
                async move {
                    match task.await {
                        Ok(result) => result,
                        Err(join_err) => {
                            metrics::producer_error(strategy, "panic");
                            warn!(
                                cache = "executor",
                                error = %join_err,
                                outcome = "producer_aborted",
                                "Fill task did not complete"
                            );
                            Err(CacheError::ProducerAborted(join_err.to_string()))
                        }
                    }
                }
                .boxed()
            })
    }
}

fn collect_tags<I>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    tags.into_iter().map(Into::into).collect()
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, CacheError> {
    serde_json::from_value(value).map_err(|err| CacheError::Decode(Arc::new(err)))
}

fn warn_undecodable(err: &CacheError) {
    warn!(
        cache = "executor",
        error = %err,
        outcome = "undecodable",
        "Cached value does not match the requested type; refilling"
    );
}

async fn produce<T, E, F, Fut>(
    producer: F,
    timeout: Duration,
    strategy: StrategyName,
) -> Result<T, CacheError>
where
    E: Into<BoxError>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, producer()).await;
    metrics::produce_latency(strategy, started.elapsed());

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => {
            metrics::producer_error(strategy, "error");
            Err(CacheError::producer(err))
        }
        Err(_) => {
            metrics::producer_error(strategy, "timeout");
            Err(CacheError::ProducerTimeout(timeout))
        }
    }
}

async fn fill<T, E, F, Fut>(
    inner: Arc<Inner>,
    guard: FlightGuard,
    policy: Strategy,
    tags: BTreeSet<String>,
    producer: F,
) -> Result<Value, CacheError>
where
    T: Serialize + Send + 'static,
    E: Into<BoxError> + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    let key = guard.key().to_string();

    let lock_token = match inner
        .store
        .acquire_fill_lock(&key, inner.fill_lock_lease)
        .await
    {
        Ok(FillLock::Acquired(token)) => token,
        Ok(FillLock::Contended) => {
            if let Some(value) = wait_for_peer(&inner, &key).await {
                debug!(cache = "executor", key = %key, outcome = "peer_fill", "Another instance filled the key");
                return Ok(value);
            }
            debug!(cache = "executor", key = %key, outcome = "lock_fallback", "Peer fill did not land in time; producing locally");
            None
        }
        Err(err) => {
            metrics::store_error("lock");
            warn!(cache = "executor", key = %key, error = %err, outcome = "store_error", "Fill lock unavailable; producing without it");
            None
        }
    };

    let result = produce(producer, inner.producer_timeout, policy.name)
        .await
        .and_then(|value| {
            serde_json::to_value(value).map_err(|err| CacheError::Encode(Arc::new(err)))
        });

    match &result {
        Ok(value) => write_back(&inner, &guard, &policy, tags, value.clone()).await,
        Err(err) => warn!(
            cache = "executor",
            key = %key,
            strategy = %policy.name,
            error = %err,
            outcome = "producer_error",
            "Producer failed; nothing cached"
        ),
    }

    if let Some(token) = lock_token {
        if let Err(err) = inner.store.release_fill_lock(&key, token).await {
            metrics::store_error("unlock");
            warn!(cache = "executor", key = %key, error = %err, "Fill lock release failed; lease will expire");
        }
    }

    result
}

/// Poll the store for a fresh entry written by the instance holding the fill lock.
async fn wait_for_peer(inner: &Inner, key: &str) -> Option<Value> {
    let deadline = Instant::now() + inner.fill_lock_lease;
    while Instant::now() < deadline {
        tokio::time::sleep(inner.fill_lock_poll).await;
        match inner.store.get(key).await {
            Ok(Some(entry)) if entry.is_fresh(inner.clock.now()) => return Some(entry.value),
            Ok(_) => {}
            Err(err) => {
                metrics::store_error("get");
                warn!(cache = "executor", key, error = %err, "Polling for peer fill failed");
                return None;
            }
        }
    }
    None
}

async fn write_back(
    inner: &Inner,
    guard: &FlightGuard,
    policy: &Strategy,
    tags: BTreeSet<String>,
    value: Value,
) {
    let _gate = inner.purge_gate.read().await;
    if !guard.is_current() {
        debug!(
            cache = "executor",
            key = guard.key(),
            outcome = "discarded",
            "Fill was detached by a purge; result not stored"
        );
        return;
    }

    let entry = CacheEntry::new(guard.key(), value, policy, tags.clone(), inner.clock.now());
    match inner.store.put(entry).await {
        Ok(displaced) => {
            metrics::evicted(displaced.len());
            if !displaced.is_empty() {
                if let Err(err) = inner.tags.forget(&displaced).await {
                    metrics::store_error("forget");
                    warn!(cache = "executor", error = %err, "Could not untrack evicted keys");
                }
            }
        }
        Err(err) => {
            metrics::store_error("put");
            warn!(
                cache = "executor",
                key = guard.key(),
                error = %err,
                outcome = "store_error",
                "Cache write failed; value returned uncached"
            );
            return;
        }
    }

    if let Err(err) = inner.tags.associate(guard.key(), &tags).await {
        metrics::store_error("associate");
        warn!(cache = "executor", key = guard.key(), error = %err, "Could not record entry tags");
    }
}
