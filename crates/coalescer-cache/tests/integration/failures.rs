use std::time::Duration;

use coalescer_cache::{AsyncMruCache, CacheConfig, CacheError, Fetcher};
use coalescer_test::{self as test, HitCounter};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::runtime::Handle;

/// Parses its key, panicking on `"panic"`.
struct Parser {
    hits: HitCounter,
}

impl Fetcher for Parser {
    type Key = &'static str;
    type Value = u64;

    fn fetch(&self, key: &'static str) -> BoxStream<'static, Result<u64, CacheError>> {
        self.hits.hit(key);
        stream::once(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if key == "panic" {
                panic!("the parser panicked");
            }
            key.parse::<u64>().map_err(CacheError::from_std_error)
        })
        .boxed()
    }
}

fn parser_cache(hits: &HitCounter, max_concurrent_fetches: usize) -> AsyncMruCache<Parser> {
    let config = CacheConfig {
        max_cache_size: 10,
        max_concurrent_fetches,
    };
    let fetcher = Parser { hits: hits.clone() };
    AsyncMruCache::new("parser", fetcher, &config, Handle::current()).unwrap()
}

#[tokio::test]
async fn test_failure_isolation() {
    test::setup();
    let hits = HitCounter::new();
    let cache = parser_cache(&hits, 1);

    let bad = cache.async_get("nope");
    let good = cache.async_get("42");

    assert!(matches!(bad.await, Err(CacheError::Computation(_))));
    assert_eq!(good.await, Ok(42));

    // the error is replayed without computing again
    let err = cache.async_get("nope").await.unwrap_err();
    assert_eq!(err.to_string(), "computation failed: invalid digit found in string");
    assert_eq!(hits.get("nope"), 1);
}

#[tokio::test]
async fn test_panicking_computation() {
    test::setup();
    let hits = HitCounter::new();
    let cache = parser_cache(&hits, 1);

    assert_eq!(cache.async_get("panic").await, Err(CacheError::Cancelled));
    assert_eq!(cache.async_get("panic").await, Err(CacheError::Cancelled));

    // the slot of the panicked computation was released
    assert_eq!(cache.async_get("7").await, Ok(7));
    assert_eq!(hits.get("panic"), 1);
}

#[tokio::test]
async fn test_retry_after_invalidate() {
    test::setup();
    let hits = HitCounter::new();
    let cache = parser_cache(&hits, 2);

    assert!(cache.async_get("x").await.is_err());
    cache.invalidate("x");
    assert!(cache.async_get("x").await.is_err());

    assert_eq!(hits.get("x"), 2);
    assert_eq!(cache.len(), 1);
}
