use std::time::Duration;

use coalescer_cache::{AsyncMruCache, CacheConfig, CacheEntry, CacheError, FetchFn};
use coalescer_test::{self as test, HitCounter};
use futures::future::{BoxFuture, join_all};
use tokio::runtime::Handle;

fn slow_upper(
    hits: HitCounter,
) -> FetchFn<String, String, impl Fn(String) -> BoxFuture<'static, CacheEntry<String>> + Send + Sync>
{
    FetchFn::new(move |key: String| {
        hits.hit(&key);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, CacheError>(key.to_uppercase())
        }) as BoxFuture<'static, _>
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dedup_across_tasks() {
    test::setup();
    let hits = HitCounter::new();
    let config = CacheConfig {
        max_cache_size: 10,
        max_concurrent_fetches: 2,
    };
    let cache = AsyncMruCache::new("dedup", slow_upper(hits.clone()), &config, Handle::current())
        .unwrap();

    let tasks: Vec<_> = (0..64)
        .map(|i| {
            let cache = cache.clone();
            let key = ["a", "b", "c"][i % 3].to_owned();
            tokio::spawn(async move { cache.async_get(key).await })
        })
        .collect();

    let mut results: Vec<_> = join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.unwrap().unwrap())
        .collect();
    results.sort();
    results.dedup();

    assert_eq!(results, ["A", "B", "C"]);
    assert_eq!(hits.get("a"), 1);
    assert_eq!(hits.get("b"), 1);
    assert_eq!(hits.get("c"), 1);
}

#[tokio::test]
async fn test_subscribers_share_pending_channel() {
    test::setup();
    let hits = HitCounter::new();
    let cache = AsyncMruCache::new(
        "pending",
        slow_upper(hits.clone()),
        &CacheConfig::default(),
        Handle::current(),
    )
    .unwrap();

    let first = cache.async_get("x".to_owned());
    // the channel is registered before the computation finishes
    let channels = cache.cached_values();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].peek(), None);

    let second = cache.try_get("x").unwrap();
    assert_eq!(first.await, Ok("X".to_owned()));
    assert_eq!(second.await, Ok("X".to_owned()));
    assert_eq!(channels[0].subscribe().await, Ok("X".to_owned()));
    assert_eq!(hits.total(), 1);
}

#[tokio::test]
async fn test_timeout_does_not_cancel() {
    test::setup();
    let hits = HitCounter::new();
    let cache = AsyncMruCache::new(
        "timeout",
        slow_upper(hits.clone()),
        &CacheConfig::default(),
        Handle::current(),
    )
    .unwrap();

    let timed_out =
        tokio::time::timeout(Duration::from_millis(1), cache.async_get("y".to_owned())).await;
    assert!(timed_out.is_err());

    // the computation kept running and is shared with later callers
    assert_eq!(cache.async_get("y".to_owned()).await, Ok("Y".to_owned()));
    assert_eq!(hits.get("y"), 1);
}
