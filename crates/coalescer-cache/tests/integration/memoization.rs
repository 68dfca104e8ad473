use std::sync::{Arc, Mutex};

use coalescer_cache::MruCache;
use coalescer_test::HitCounter;

#[test]
fn test_memoization() {
    let hits = HitCounter::new();
    let mut cache = {
        let hits = hits.clone();
        MruCache::new(10, move |key: &String, _: ()| {
            hits.hit(key);
            Ok::<_, std::convert::Infallible>(key.len())
        })
        .unwrap()
    };

    for _ in 0..3 {
        assert_eq!(cache.get("hello".into(), ()), Ok(5));
        assert_eq!(cache.get("hi".into(), ()), Ok(2));
    }
    assert_eq!(hits.get("hello"), 1);
    assert_eq!(hits.get("hi"), 1);
}

#[test]
fn test_lru_order() {
    let released = Arc::new(Mutex::new(Vec::new()));
    let mut cache = {
        let released = Arc::clone(&released);
        MruCache::new(2, |key: &u32, _: ()| Ok::<_, std::convert::Infallible>(key * 2))
            .unwrap()
            .with_release(move |value| released.lock().unwrap().push(value))
    };

    cache.get(1, ()).unwrap();
    cache.get(2, ()).unwrap();
    cache.get(1, ()).unwrap();
    cache.get(3, ()).unwrap();

    assert!(cache.contains_key(&1));
    assert!(!cache.contains_key(&2));
    assert!(cache.contains_key(&3));
    assert_eq!(*released.lock().unwrap(), [4]);
}

#[test]
fn test_invalidate_recomputes() {
    let hits = HitCounter::new();
    let mut cache = {
        let hits = hits.clone();
        MruCache::new(4, move |key: &u32, _: ()| {
            hits.hit(key);
            Ok::<_, std::convert::Infallible>(*key)
        })
        .unwrap()
    };

    cache.get(1, ()).unwrap();
    cache.invalidate(&1);
    cache.get(1, ()).unwrap();
    cache.get(1, ()).unwrap();

    assert_eq!(hits.get(1), 2);
}

#[test]
fn test_release_is_exact() {
    let computed = HitCounter::new();
    let released = HitCounter::new();
    let mut cache = {
        let computed = computed.clone();
        let released = released.clone();
        MruCache::new(5, move |key: &u32, _: ()| {
            computed.hit(key);
            Ok::<_, std::convert::Infallible>(*key)
        })
        .unwrap()
        .with_release(move |value| released.hit(value))
    };

    // a mix of hits, misses and invalidations
    for key in [1, 2, 3, 1, 4, 5, 6, 7, 2, 8, 1, 9] {
        cache.get(key, ()).unwrap();
        if key % 4 == 0 {
            cache.invalidate(&(key - 1));
        }
    }
    assert_eq!(cache.len(), 5);
    cache.invalidate_all();

    // `1` and `2` were evicted and computed again
    assert_eq!(computed.get(1), 2);
    assert_eq!(computed.get(2), 2);
    assert_eq!(computed.total(), 11);
    // every computed value was released exactly once
    assert_eq!(released.accesses(), computed.accesses());
}
