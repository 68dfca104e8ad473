use std::sync::{Arc, Mutex};
use std::time::Duration;

use coalescer_cache::{AsyncMruCache, CacheConfig, CacheError, FetchFn};
use coalescer_test::{self as test, ConcurrencyProbe};
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::time::Instant;

#[tokio::test]
async fn test_bounded_concurrency() {
    test::setup();
    tokio::time::pause();

    let probe = ConcurrencyProbe::new();
    let fetcher = {
        let probe = probe.clone();
        FetchFn::new(move |key: usize| {
            let probe = probe.clone();
            async move {
                let _guard = probe.enter();
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, CacheError>(key)
            }
        })
    };
    let config = CacheConfig {
        max_cache_size: 100,
        max_concurrent_fetches: 2,
    };
    let cache = AsyncMruCache::new("bounded", fetcher, &config, Handle::current()).unwrap();

    let start = Instant::now();
    let results = join_all((0..6).map(|key| cache.async_get(key))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(probe.peak(), 2);
    assert_eq!(probe.total(), 6);
    // three waves of two computations each
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(400));
    assert_eq!(cache.admission().granted(), 0);
    assert_eq!(cache.admission().queued(), 0);
}

#[tokio::test]
async fn test_fifo_admission() {
    test::setup();
    tokio::time::pause();

    let started = Arc::new(Mutex::new(Vec::new()));
    let fetcher = {
        let started = Arc::clone(&started);
        FetchFn::new(move |key: u32| {
            started.lock().unwrap().push(key);
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, CacheError>(key)
            }
        })
    };
    let config = CacheConfig {
        max_cache_size: 100,
        max_concurrent_fetches: 1,
    };
    let cache = AsyncMruCache::new("fifo", fetcher, &config, Handle::current()).unwrap();

    let keys = [5, 3, 9, 1, 7];
    let requests: Vec<_> = keys.iter().map(|key| cache.async_get(*key)).collect();
    assert_eq!(cache.admission().queued() + cache.admission().granted(), 5);

    join_all(requests).await;
    assert_eq!(*started.lock().unwrap(), keys);
}
