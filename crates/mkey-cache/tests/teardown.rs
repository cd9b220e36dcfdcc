//! Teardown tests: draining in-flight work and destroying owned keys

use std::sync::Arc;
use std::time::Duration;

use mkey_cache::test_utils::MockBackend;
use mkey_cache::{CacheConfig, KeyCache};
use pretty_assertions::assert_eq;

/// Helper to build a config with explicit per-class limits.
fn config(min_order: u8, limits: Vec<u32>) -> CacheConfig {
    CacheConfig::new().with_min_order(min_order).with_limits(limits)
}

/// Helper that spins the scheduler until the cache holds exactly
/// `target_cur` keys with nothing in flight.
async fn settle(cache: &KeyCache, target_cur: u32) {
    for _ in 0..10_000 {
        let stats = cache.stats();
        if stats.total_cur() == target_cur && stats.total_pending() == 0 {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!(
        "cache never settled at {target_cur} keys, stats: {:?}",
        cache.stats()
    );
}

#[tokio::test(start_paused = true)]
async fn shutdown_destroys_idle_keys_and_is_idempotent() {
    let backend = Arc::new(MockBackend::new());
    let cache = KeyCache::new(backend.clone(), config(2, vec![2])).unwrap();
    settle(&cache, 4).await;

    cache.shutdown().await;

    let stats = cache.stats();
    assert!(stats.stopped);
    assert_eq!(stats.total_cur(), 0);
    assert_eq!(stats.destroyed, 4);
    assert_eq!(backend.destroys(), 4);
    assert!(cache.get(2).is_none());

    // A second shutdown changes nothing.
    cache.shutdown().await;
    assert_eq!(backend.destroys(), 4);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_in_flight_creations() {
    let backend = Arc::new(MockBackend::new());
    backend.hold_completions();
    let cache = Arc::new(KeyCache::new(backend.clone(), config(2, vec![2])).unwrap());

    for _ in 0..10_000 {
        if backend.held_count() == 4 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(backend.held_count(), 4);

    let teardown = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move {
            cache.shutdown().await;
        }
    });
    for _ in 0..10_000 {
        if cache.is_stopped() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(cache.is_stopped());

    // Creations that land against the stopped cache destroy their own
    // keys, which is what lets the drain finish.
    backend.complete_all();
    teardown.await.unwrap();

    for _ in 0..10_000 {
        if backend.destroys() == 4 {
            break;
        }
        tokio::task::yield_now().await;
    }
    let stats = cache.stats();
    assert_eq!(stats.total_pending(), 0);
    assert_eq!(stats.total_cur(), 0);
    assert_eq!(stats.destroyed, 4);
    assert_eq!(backend.destroys(), 4);
}

#[tokio::test(start_paused = true)]
async fn shutdown_gives_up_on_stuck_creations() {
    let backend = Arc::new(MockBackend::new());
    backend.hold_completions();
    let cache = KeyCache::new(
        backend.clone(),
        config(2, vec![1]).with_drain(Duration::from_millis(5), 3),
    )
    .unwrap();

    for _ in 0..10_000 {
        if backend.held_count() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }

    // The device never answers; the drain gives up after its bounded
    // wait instead of hanging.
    cache.shutdown().await;
    let stats = cache.stats();
    assert!(stats.stopped);
    assert_eq!(stats.total_pending(), 2);
    assert_eq!(backend.destroys(), 0);

    // Stragglers that complete later still destroy their keys.
    backend.complete_all();
    for _ in 0..10_000 {
        if backend.destroys() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(backend.destroys(), 2);
    assert_eq!(cache.stats().total_pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn keys_released_after_shutdown_are_destroyed() {
    let backend = Arc::new(MockBackend::new());
    let cache = KeyCache::new(backend.clone(), config(2, vec![1])).unwrap();
    settle(&cache, 2).await;

    let key = cache.get(2).expect("filled pool");
    cache.shutdown().await;
    assert_eq!(backend.destroys(), 1);
    assert_eq!(cache.stats().total_cur(), 1);

    // The late release goes straight to the device.
    cache.put(key).await;
    let stats = cache.stats();
    assert_eq!(stats.total_cur(), 0);
    assert_eq!(stats.destroyed, 2);
    assert_eq!(stats.releases, 0);
    assert_eq!(backend.destroys(), 2);
}

#[tokio::test(start_paused = true)]
async fn dropping_an_unstopped_cache_destroys_late_arrivals() {
    let backend = Arc::new(MockBackend::new());
    backend.hold_completions();
    let cache = KeyCache::new(backend.clone(), config(2, vec![1])).unwrap();

    for _ in 0..10_000 {
        if backend.held_count() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    drop(cache);

    // Completions arriving after the cache is gone have no owner left;
    // the keys are destroyed rather than leaked.
    backend.complete_all();
    for _ in 0..10_000 {
        if backend.destroys() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(backend.destroys(), 2);
}
