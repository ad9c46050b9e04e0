use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hubcache::cache::{
    CacheConfig, CacheEntry, CacheError, CacheStatus, CacheStore, FillLock, ManualClock,
    MemoryStore, MemoryTagIndex, StoreBackend, StoreError, StoreResult, StrategyName,
    StrategyRegistry, SystemClock, UnifiedCache,
};
use serde_json::json;
use tokio::sync::{Barrier, Notify};

fn registry() -> Arc<StrategyRegistry> {
    Arc::new(StrategyRegistry::standard())
}

fn cache_with_clock() -> (UnifiedCache, ManualClock) {
    let clock = ManualClock::starting_now();
    let cache = UnifiedCache::in_memory_with_clock(
        &CacheConfig::default(),
        registry(),
        Arc::new(clock.clone()),
    );
    (cache, clock)
}

async fn counted(
    cache: &UnifiedCache,
    key: &str,
    strategy: StrategyName,
    calls: &Arc<AtomicUsize>,
    value: u32,
) -> Result<hubcache::cache::Cached<u32>, CacheError> {
    let calls = Arc::clone(calls);
    cache
        .cached_query_traced(key, strategy, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(value)
        })
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_fill() {
    let cache = UnifiedCache::in_memory(&CacheConfig::default(), registry());
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(16));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let calls = Arc::clone(&calls);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            cache
                .cached_query_traced("listing:7", StrategyName::ApiStandard, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<_, std::io::Error>(json!({"id": 7, "title": "Loft"}))
                })
                .await
                .expect("fill succeeds")
        }));
    }

    let mut leaders = 0;
    for handle in handles {
        let cached = handle.await.expect("task completes");
        assert_eq!(cached.value["title"], "Loft");
        if cached.status == CacheStatus::Miss {
            leaders += 1;
        } else {
            assert_eq!(cached.status, CacheStatus::Coalesced);
        }
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(leaders, 1);
}

#[tokio::test]
async fn failed_producers_are_not_cached() {
    let (cache, _) = cache_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let err = cache
        .cached_query("company:9", StrategyName::DatabaseQueries, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(std::io::Error::other("database down"))
        })
        .await
        .expect_err("producer error surfaces");
    let source = err.producer_source().expect("producer failure");
    assert_eq!(source.to_string(), "database down");

    let cached = counted(&cache, "company:9", StrategyName::DatabaseQueries, &calls, 9)
        .await
        .unwrap();
    assert_eq!(cached.status, CacheStatus::Miss);
    assert_eq!(cached.value, 9);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn private_strategy_always_runs_the_producer() {
    let (cache, _) = cache_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    for value in [1, 2] {
        let cached = counted(&cache, "me", StrategyName::UserPrivate, &calls, value)
            .await
            .unwrap();
        assert_eq!(cached.status, CacheStatus::Bypass);
        assert_eq!(cached.value, value);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().await.unwrap().tagged_keys, 0);
}

#[tokio::test]
async fn stale_entries_are_served_while_refreshing() {
    let (cache, clock) = cache_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    let first = counted(&cache, "listings:all", StrategyName::ApiStandard, &calls, 1)
        .await
        .unwrap();
    assert_eq!(first.status, CacheStatus::Miss);

    clock.advance(Duration::from_secs(5 * 60 + 1));
    let stale = counted(&cache, "listings:all", StrategyName::ApiStandard, &calls, 2)
        .await
        .unwrap();
    assert_eq!(stale.status, CacheStatus::Stale);
    assert_eq!(stale.value, 1);

    let mut refreshed = None;
    for _ in 0..100 {
        let cached = counted(&cache, "listings:all", StrategyName::ApiStandard, &calls, 3)
            .await
            .unwrap();
        if cached.status == CacheStatus::Hit {
            refreshed = Some(cached.value);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(refreshed, Some(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

async fn failing(
    cache: &UnifiedCache,
    key: &str,
    failures: &Arc<AtomicUsize>,
) -> Result<hubcache::cache::Cached<u32>, CacheError> {
    let failures = Arc::clone(failures);
    cache
        .cached_query_traced(key, StrategyName::ApiStandard, move || async move {
            failures.fetch_add(1, Ordering::SeqCst);
            Err::<u32, _>(std::io::Error::other("upstream down"))
        })
        .await
}

async fn settle(cache: &UnifiedCache) {
    for _ in 0..100 {
        if cache.stats().await.unwrap().in_flight == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("background refresh never settled");
}

#[tokio::test]
async fn failed_refresh_keeps_serving_the_stale_entry() {
    let (cache, clock) = cache_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));

    counted(&cache, "listings:all", StrategyName::ApiStandard, &calls, 1)
        .await
        .unwrap();
    clock.advance(Duration::from_secs(5 * 60 + 1));

    let stale = failing(&cache, "listings:all", &failures).await.unwrap();
    assert_eq!(stale.status, CacheStatus::Stale);
    assert_eq!(stale.value, 1);

    for _ in 0..100 {
        if failures.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    settle(&cache).await;

    let again = failing(&cache, "listings:all", &failures).await.unwrap();
    assert_eq!(again.status, CacheStatus::Stale);
    assert_eq!(again.value, 1);
    settle(&cache).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn entries_past_the_stale_window_miss() {
    let (cache, clock) = cache_with_clock();
    let calls = Arc::new(AtomicUsize::new(0));

    counted(&cache, "events:today", StrategyName::DynamicContent, &calls, 1)
        .await
        .unwrap();
    clock.advance(Duration::from_secs(60 + 30));

    let cached = counted(&cache, "events:today", StrategyName::DynamicContent, &calls, 2)
        .await
        .unwrap();
    assert_eq!(cached.status, CacheStatus::Miss);
    assert_eq!(cached.value, 2);
}

#[tokio::test]
async fn slow_producers_time_out() {
    let config = CacheConfig {
        producer_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let cache = UnifiedCache::in_memory(&config, registry());

    let err = cache
        .cached_query("slow", StrategyName::ApiStandard, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, std::io::Error>(0_u8)
        })
        .await
        .expect_err("producer is too slow");
    assert!(err.is_timeout());
}

struct FailingStore;

#[async_trait]
impl CacheStore for FailingStore {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<CacheEntry>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn put(&self, _entry: CacheEntry) -> StoreResult<Vec<String>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn remove(&self, _keys: &[String]) -> StoreResult<usize> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn remove_prefix(&self, _prefix: &str) -> StoreResult<Vec<String>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn clear(&self) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[tokio::test]
async fn unavailable_store_degrades_to_producer_calls() {
    let cache = UnifiedCache::new(
        &CacheConfig::default(),
        registry(),
        Arc::new(FailingStore),
        Arc::new(MemoryTagIndex::new()),
        Arc::new(SystemClock),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    for value in [1, 2] {
        let cached = counted(&cache, "k", StrategyName::ApiStandard, &calls, value)
            .await
            .expect("producer value is returned despite the store");
        assert_eq!(cached.status, CacheStatus::Miss);
        assert_eq!(cached.value, value);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    assert!(cache.purge_by_key("k").await.is_err());
}

#[tokio::test]
async fn unreachable_redis_starts_degraded() {
    let config = CacheConfig {
        backend: StoreBackend::redis("redis://127.0.0.1:1/"),
        ..Default::default()
    };
    let cache = UnifiedCache::connect(&config, registry())
        .await
        .expect("an unreachable server is not a startup error");
    let calls = Arc::new(AtomicUsize::new(0));

    for value in [1, 2] {
        let cached = counted(&cache, "listing:1", StrategyName::ApiStandard, &calls, value)
            .await
            .unwrap();
        assert_eq!(cached.status, CacheStatus::Miss);
        assert_eq!(cached.value, value);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.purge_by_key("listing:1").await.is_err());
}

#[tokio::test]
async fn malformed_redis_url_fails_to_connect() {
    let config = CacheConfig {
        backend: StoreBackend::redis("not a url"),
        ..Default::default()
    };
    assert!(UnifiedCache::connect(&config, registry()).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn purge_during_fill_discards_the_result() {
    let (cache, _) = cache_with_clock();
    let release = Arc::new(Notify::new());
    let started = Arc::new(Notify::new());

    let pending = {
        let cache = cache.clone();
        let release = Arc::clone(&release);
        let started = Arc::clone(&started);
        tokio::spawn(async move {
            cache
                .cached_query_tagged_traced(
                    "listing:1",
                    StrategyName::ApiStandard,
                    ["listings"],
                    move || async move {
                        started.notify_one();
                        release.notified().await;
                        Ok::<_, std::io::Error>("before edit".to_string())
                    },
                )
                .await
        })
    };

    started.notified().await;
    let report = cache.purge_by_tags(["listings"]).await.unwrap();
    assert_eq!(report.detached_fills, 1);
    release.notify_one();

    let first = pending.await.unwrap().unwrap();
    assert_eq!(first.status, CacheStatus::Miss);
    assert_eq!(first.value, "before edit");

    let after = cache
        .cached_query_traced("listing:1", StrategyName::ApiStandard, || async {
            Ok::<_, std::io::Error>("after edit".to_string())
        })
        .await
        .unwrap();
    assert_eq!(after.status, CacheStatus::Miss);
    assert_eq!(after.value, "after edit");
}

/// Memory store whose fill lock is always held by "another instance".
struct ContendedStore {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl CacheStore for ContendedStore {
    fn name(&self) -> &'static str {
        "contended"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        self.inner.get(key).await
    }

    async fn put(&self, entry: CacheEntry) -> StoreResult<Vec<String>> {
        self.inner.put(entry).await
    }

    async fn remove(&self, keys: &[String]) -> StoreResult<usize> {
        self.inner.remove(keys).await
    }

    async fn remove_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.inner.remove_prefix(prefix).await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.inner.clear().await
    }

    async fn acquire_fill_lock(&self, _key: &str, _lease: Duration) -> StoreResult<FillLock> {
        Ok(FillLock::Contended)
    }
}

fn contended_cache(lease: Duration) -> (UnifiedCache, Arc<MemoryStore>) {
    let config = CacheConfig {
        fill_lock_lease: lease,
        fill_lock_poll: Duration::from_millis(10),
        ..Default::default()
    };
    let shared = Arc::new(MemoryStore::new(&config, Arc::new(SystemClock)));
    let cache = UnifiedCache::new(
        &config,
        registry(),
        Arc::new(ContendedStore {
            inner: Arc::clone(&shared),
        }),
        Arc::new(MemoryTagIndex::new()),
        Arc::new(SystemClock),
    );
    (cache, shared)
}

#[tokio::test]
async fn contended_fill_waits_for_the_peer_value() {
    let (cache, shared) = contended_cache(Duration::from_secs(2));
    let calls = Arc::new(AtomicUsize::new(0));

    let peer = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let standard = StrategyRegistry::standard();
        let entry = CacheEntry::new(
            "listing:5",
            json!(55),
            standard.get(StrategyName::ApiStandard),
            BTreeSet::new(),
            time::OffsetDateTime::now_utc(),
        );
        shared.put(entry).await.unwrap();
    });

    let cached = counted(&cache, "listing:5", StrategyName::ApiStandard, &calls, 1)
        .await
        .unwrap();
    peer.await.unwrap();

    assert_eq!(cached.value, 55);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn contended_fill_falls_back_after_the_lease() {
    let (cache, _) = contended_cache(Duration::from_millis(60));
    let calls = Arc::new(AtomicUsize::new(0));

    let cached = counted(&cache, "listing:6", StrategyName::ApiStandard, &calls, 6)
        .await
        .unwrap();

    assert_eq!(cached.value, 6);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
