use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use hubcache::cache::{
    CacheConfig, CacheKey, CacheStatus, StrategyName, StrategyRegistry, UnifiedCache,
};
use serde::Serialize;

fn cache() -> UnifiedCache {
    UnifiedCache::in_memory(&CacheConfig::default(), Arc::new(StrategyRegistry::standard()))
}

async fn fill(
    cache: &UnifiedCache,
    key: &str,
    tags: &[&str],
    calls: &Arc<AtomicUsize>,
) -> CacheStatus {
    let calls = Arc::clone(calls);
    let tags: Vec<String> = tags.iter().map(|tag| tag.to_string()).collect();
    cache
        .cached_query_tagged_traced(key, StrategyName::DatabaseQueries, tags, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(payload())
        })
        .await
        .expect("fill succeeds")
        .status
}

fn payload() -> Vec<u8> {
    vec![1, 2, 3]
}

#[tokio::test]
async fn purging_a_tag_only_touches_its_entries() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));

    fill(&cache, "listing:1", &["listings", "listing:1"], &calls).await;
    fill(&cache, "listing:2", &["listings", "listing:2"], &calls).await;
    fill(&cache, "company:1", &["companies"], &calls).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let report = cache.purge_by_tags(["listing:1"]).await.unwrap();
    assert_eq!(report.keys, 1);

    assert_eq!(
        fill(&cache, "listing:1", &["listings", "listing:1"], &calls).await,
        CacheStatus::Miss
    );
    assert_eq!(
        fill(&cache, "listing:2", &["listings", "listing:2"], &calls).await,
        CacheStatus::Hit
    );
    assert_eq!(fill(&cache, "company:1", &["companies"], &calls).await, CacheStatus::Hit);

    let report = cache.purge_by_tags(["listings", "unknown"]).await.unwrap();
    assert_eq!(report.keys, 2);
    assert_eq!(fill(&cache, "company:1", &["companies"], &calls).await, CacheStatus::Hit);
    assert_eq!(fill(&cache, "listing:2", &["listings"], &calls).await, CacheStatus::Miss);
}

#[tokio::test]
async fn unknown_tags_purge_nothing() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    fill(&cache, "company:1", &["companies"], &calls).await;

    let report = cache.purge_by_tags(["nobody-uses-this"]).await.unwrap();
    assert_eq!(report.keys, 0);
    assert_eq!(report.detached_fills, 0);
    assert_eq!(fill(&cache, "company:1", &["companies"], &calls).await, CacheStatus::Hit);
}

#[derive(Serialize)]
struct SearchFilters<'a> {
    city: &'a str,
    page: u32,
}

#[tokio::test]
async fn prefix_purge_covers_every_filter_variant() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));

    let berlin = CacheKey::new("search")
        .part("listings")
        .filters(&SearchFilters { city: "Berlin", page: 1 })
        .unwrap();
    let paris = CacheKey::new("search")
        .part("listings")
        .filters(&SearchFilters { city: "Paris", page: 1 })
        .unwrap();

    fill(&cache, berlin.as_str(), &[], &calls).await;
    fill(&cache, paris.as_str(), &[], &calls).await;
    fill(&cache, "company:1", &["companies"], &calls).await;

    let report = cache.purge_by_prefix("search:listings:").await.unwrap();
    assert_eq!(report.keys, 2);

    assert_eq!(fill(&cache, berlin.as_str(), &[], &calls).await, CacheStatus::Miss);
    assert_eq!(fill(&cache, "company:1", &["companies"], &calls).await, CacheStatus::Hit);
}

#[tokio::test]
async fn purge_all_empties_store_and_index() {
    let cache = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    fill(&cache, "listing:1", &["listings"], &calls).await;
    fill(&cache, "company:1", &["companies"], &calls).await;

    let before = cache.stats().await.unwrap();
    assert_eq!(before.store, "memory");
    assert_eq!(before.tags, 2);
    assert_eq!(before.tagged_keys, 2);

    let report = cache.purge_all().await.unwrap();
    assert_eq!(report.keys, 2);

    let after = cache.stats().await.unwrap();
    assert_eq!(after.tags, 0);
    assert_eq!(after.tagged_keys, 0);
    assert_eq!(fill(&cache, "listing:1", &["listings"], &calls).await, CacheStatus::Miss);
}
