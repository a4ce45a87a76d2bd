//! Pool behaviour against the scripted server

mod common;

use common::{config, init_tracing, MockProvider, Reply, Script};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use wirepool::{Connection, ConnectionPool, ConnectionState, Error};

fn pool(provider: &MockProvider, max: usize) -> ConnectionPool {
    let cfg = config().max_connections(max).build().unwrap();
    ConnectionPool::new(cfg, provider.shared()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_released_connection_is_reused() {
    init_tracing();
    let provider = MockProvider::default();
    let pool = pool(&provider, 4);

    let conn = assert_ok!(pool.acquire().await);
    let id = conn.id();
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.idle_count(), 0);

    assert_ok!(pool.release(conn).await);
    assert_eq!(pool.idle_count(), 1);

    let again = assert_ok!(pool.acquire().await);
    assert_eq!(again.id(), id);
    assert_eq!(provider.log.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_most_recently_released_is_reused_first() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 4);

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let b_id = b.id();
    pool.release(a).await.unwrap();
    pool.release(b).await.unwrap();

    assert_eq!(pool.acquire().await.unwrap().id(), b_id);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_pool_suspends_instead_of_failing() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 2);

    let _a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();

    let third = tokio::time::timeout(Duration::from_millis(100), pool.acquire()).await;
    assert!(third.is_err(), "third acquire should still be waiting");
    assert_eq!(pool.size(), 2);
    assert_eq!(provider.log.opens(), 2);

    // The abandoned waiter is skipped
    assert_eq!(pool.waiting(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_release_hands_same_connection_to_waiter() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 1);

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(pool.waiting(), 1);
    assert!(!waiter.is_finished());

    pool.release(conn).await.unwrap();
    let handed = waiter.await.unwrap().unwrap();
    assert_eq!(handed.id(), id);
    assert_eq!(provider.log.opens(), 1);
    assert_eq!(pool.idle_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handed_off_connection_returns_when_waiter_cancelled() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 1);

    let conn = pool.acquire().await.unwrap();
    let id = conn.id();

    // Queue a waiter, then abandon it after the hand-off but before it collects
    let mut pending = Box::pin(pool.acquire());
    assert!(pending.as_mut().now_or_never().is_none());
    assert_eq!(pool.waiting(), 1);

    pool.release(conn).await.unwrap();
    drop(pending);

    assert_eq!(pool.size(), 1);
    assert_eq!(pool.idle_count(), 1);

    let again = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
        .await
        .expect("acquire should not hang")
        .unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(provider.log.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_resolve_in_request_order() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 2);

    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for i in 0..5 {
        let pool = pool.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            order.lock().push(i);
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(conn).await.unwrap();
        }));
        // Register waiters one at a time
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(pool.waiting(), 5);

    pool.release(first).await.unwrap();
    pool.release(second).await.unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    assert_eq!(provider.log.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_never_more_than_max_connections() {
    let script = Script::default().reply(
        "SELECT work",
        Reply::delayed(Duration::from_millis(20), Reply::Rows(json!([]))),
    );
    let provider = MockProvider::new(script);
    let pool = pool(&provider, 3);

    let checked_out = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let pool = pool.clone();
            let checked_out = checked_out.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                let now = checked_out.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                conn.query("SELECT work").await.unwrap();
                checked_out.fetch_sub(1, Ordering::SeqCst);
                pool.release(conn).await.unwrap();
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(pool.size() <= 3);
    assert!(provider.log.opens() <= 3);
    assert_eq!(provider.log.sql().len(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_double_release_is_protocol_misuse() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 2);

    let conn = pool.acquire().await.unwrap();
    assert_ok!(pool.release(conn.clone()).await);

    let err = assert_err!(pool.release(conn).await);
    assert!(matches!(err, Error::ProtocolMisuse(_)));
    assert!(err.to_string().contains("released twice"), "got {}", err);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_foreign_release_is_protocol_misuse() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 2);

    let foreign = Connection::connect(config().build().unwrap(), provider.shared())
        .await
        .unwrap();
    let err = assert_err!(pool.release(foreign).await);
    assert!(matches!(err, Error::ProtocolMisuse(_)));
    assert!(err.to_string().contains("does not belong"), "got {}", err);
    assert_eq!(pool.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_fails_waiters_and_later_acquires() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 1);

    let conn = pool.acquire().await.unwrap();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    pool.close().await;
    assert!(pool.is_closed());

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::ConnectionClosed));
    let err = assert_err!(pool.acquire().await);
    assert!(matches!(err, Error::ConnectionClosed));

    // Returned after close: closed instead of pooled
    assert_ok!(pool.release(conn.clone()).await);
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(pool.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_close_closes_idle_connections() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 2);

    let conn = pool.acquire().await.unwrap();
    pool.release(conn.clone()).await.unwrap();

    pool.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.size(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_idle_connection_is_replaced() {
    let provider = MockProvider::default();
    let cfg = config()
        .idle_timeout(Duration::from_secs(1))
        .build()
        .unwrap();
    let pool = ConnectionPool::new(cfg, provider.shared()).unwrap();

    let conn = pool.acquire().await.unwrap();
    let stale_id = conn.id();
    pool.release(conn).await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let fresh = assert_ok!(pool.acquire().await);
    assert_ne!(fresh.id(), stale_id);
    assert_eq!(fresh.state(), ConnectionState::Ready);
    assert_eq!(pool.size(), 1);
    assert_eq!(provider.log.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_closed_release_opens_replacement_for_waiter() {
    let script = Script::default().reply("SELECT crash", Reply::Hangup);
    let provider = MockProvider::new(script);
    let pool = pool(&provider, 1);

    let conn = pool.acquire().await.unwrap();
    let broken_id = conn.id();
    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move { pool.acquire().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_err!(conn.query("SELECT crash").await);
    assert!(!conn.is_open());
    pool.release(conn).await.unwrap();

    let replacement = waiter.await.unwrap().unwrap();
    assert_ne!(replacement.id(), broken_id);
    assert_ok!(replacement.query("SELECT 1").await);
    assert_eq!(pool.size(), 1);
    assert_eq!(provider.log.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_connect_gives_slot_back() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 1);

    provider.refuse_connections(true);
    let err = assert_err!(pool.acquire().await);
    assert!(matches!(err, Error::Connect { .. }));
    assert_eq!(pool.size(), 0);

    provider.refuse_connections(false);
    assert_ok!(pool.acquire().await);
    assert_eq!(pool.size(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_introspection() {
    let provider = MockProvider::default();
    let pool = pool(&provider, 3);
    assert_eq!(pool.max_connections(), 3);
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.waiting(), 0);
    assert!(!pool.is_closed());
    assert_eq!(pool.config().database(), "orders");
}
