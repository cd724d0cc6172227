//! Tests for the single-flight TTL cache.

use super::*;
use std::sync::Arc;
use tokio::time::{advance, Duration};

fn cache(grace_secs: u64) -> QueryCache {
    QueryCache::new(
        64,
        Duration::from_secs(grace_secs),
        Duration::from_secs(30),
    )
}

#[tokio::test(start_paused = true)]
async fn test_set_then_get_fresh() {
    let cache = cache(10);
    cache.set(b"k", Bytes::from_static(b"v"), Duration::from_secs(10));

    let (bytes, flag) = cache.get(b"k").unwrap();
    assert_eq!(bytes, Bytes::from_static(b"v"));
    assert_eq!(flag, CacheFlag::Fresh);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_windows() {
    let cache = cache(10);
    cache.set(b"k", Bytes::from_static(b"v"), Duration::from_secs(10));

    // Within TTL.
    advance(Duration::from_secs(9)).await;
    assert_eq!(cache.get(b"k").unwrap().1, CacheFlag::Fresh);

    // Past TTL, within grace: first caller is elected to refresh.
    advance(Duration::from_secs(2)).await;
    let (bytes, flag) = cache.get(b"k").unwrap();
    assert_eq!(bytes, Bytes::from_static(b"v"));
    assert_eq!(flag, CacheFlag::Refresh);

    // A concurrent peer sees Stale while the refresh is in flight.
    assert_eq!(cache.get(b"k").unwrap().1, CacheFlag::Stale);

    // The refresher publishes; the entry is Fresh again.
    cache.set_and_notify(b"k", Bytes::from_static(b"v2"), Duration::from_secs(10));
    let (bytes, flag) = cache.get(b"k").unwrap();
    assert_eq!(bytes, Bytes::from_static(b"v2"));
    assert_eq!(flag, CacheFlag::Fresh);
    assert_eq!(cache.inflight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_beyond_grace_is_gone() {
    let cache = cache(10);
    cache.set(b"k", Bytes::from_static(b"v"), Duration::from_secs(10));

    advance(Duration::from_secs(21)).await;
    assert!(cache.get(b"k").is_none());
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_single_flight_fan_out() {
    let cache = Arc::new(cache(10));

    // First requester is elected.
    let (bytes, waited) = cache.get_or_wait(b"k").await;
    assert!(bytes.is_none());
    assert!(!waited);
    assert_eq!(cache.inflight_count(), 1);

    // Four peers pile onto the same inflight.
    let mut waiters = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        waiters.push(tokio::spawn(
            async move { cache.get_or_wait(b"k").await },
        ));
    }
    tokio::task::yield_now().await;
    assert_eq!(cache.inflight_count(), 1);

    cache.set_and_notify(b"k", Bytes::from_static(b"payload"), Duration::from_secs(10));

    for waiter in waiters {
        let (bytes, waited) = waiter.await.unwrap();
        assert_eq!(bytes, Some(Bytes::from_static(b"payload")));
        assert!(waited);
    }
    assert_eq!(cache.inflight_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_inflight_wakes_with_not_found() {
    let cache = Arc::new(cache(10));

    let (bytes, waited) = cache.get_or_wait(b"k").await;
    assert!(bytes.is_none() && !waited);

    let peer = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.get_or_wait(b"k").await })
    };
    tokio::task::yield_now().await;

    cache.cancel_inflight(b"k");

    let (bytes, waited) = peer.await.unwrap();
    assert!(bytes.is_none());
    assert!(waited);

    // The key is untouched; the next requester is elected again.
    let (bytes, waited) = cache.get_or_wait(b"k").await;
    assert!(bytes.is_none() && !waited);
}

#[tokio::test(start_paused = true)]
async fn test_get_or_wait_sees_entry_set_meanwhile() {
    let cache = cache(10);
    cache.set(b"k", Bytes::from_static(b"v"), Duration::from_secs(10));

    let (bytes, waited) = cache.get_or_wait(b"k").await;
    assert_eq!(bytes, Some(Bytes::from_static(b"v")));
    assert!(!waited);
}

#[tokio::test(start_paused = true)]
async fn test_waiter_times_out() {
    let cache = Arc::new(QueryCache::new(
        64,
        Duration::from_secs(10),
        Duration::from_secs(5),
    ));

    let (bytes, waited) = cache.get_or_wait(b"k").await;
    assert!(bytes.is_none() && !waited);

    // The elected fetcher never resolves; the waiter gives up at the
    // deadline and fetches for itself.
    let (bytes, waited) = cache.get_or_wait(b"k").await;
    assert!(bytes.is_none());
    assert!(waited);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_refresher_is_replaced() {
    let cache = QueryCache::new(64, Duration::from_secs(60), Duration::from_secs(5));
    cache.set(b"k", Bytes::from_static(b"v"), Duration::from_secs(1));

    advance(Duration::from_secs(2)).await;
    assert_eq!(cache.get(b"k").unwrap().1, CacheFlag::Refresh);

    // The elected refresher vanishes without resolving.
    advance(Duration::from_secs(6)).await;
    assert_eq!(cache.get(b"k").unwrap().1, CacheFlag::Refresh);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_under_ceiling() {
    let cache = QueryCache::new(2, Duration::from_secs(10), Duration::from_secs(30));

    cache.set(b"a", Bytes::from_static(b"1"), Duration::from_secs(10));
    cache.set(b"b", Bytes::from_static(b"2"), Duration::from_secs(10));
    cache.set(b"c", Bytes::from_static(b"3"), Duration::from_secs(10));

    assert_eq!(cache.len(), 2);
    // Least recently used entry was reclaimed; callers tolerate the
    // cold miss.
    assert!(cache.get(b"a").is_none());
    assert!(cache.get(b"c").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_fresh_readers_share_bytes() {
    let cache = cache(10);
    cache.set(b"k", Bytes::from_static(b"shared"), Duration::from_secs(10));

    let first = cache.get(b"k").unwrap();
    let second = cache.get(b"k").unwrap();
    assert_eq!(first.0, second.0);
    assert_eq!(first.1, CacheFlag::Fresh);
    assert_eq!(second.1, CacheFlag::Fresh);
}
