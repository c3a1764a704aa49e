// Pool accounting, waiting, pruning and host-selection scenarios.

use std::time::Duration;

use crate::cancellation::CancelToken;
use crate::config::ConnectionString;
use crate::errors::Error;
use crate::mock_backend::{MockConfig, MockServer};
use crate::pool::{get_or_create_pool, ConnectionPool};

fn pool_for(server: &MockServer, extra: &str) -> ConnectionPool {
    let settings = ConnectionString::parse(&server.connection_string(extra)).unwrap();
    ConnectionPool::new(settings).unwrap()
}

#[tokio::test]
async fn rent_reuses_idle_connectors() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let pool = pool_for(&server, "MaxPoolSize=5");

    let mut conn = pool.rent(&CancelToken::none()).await.unwrap();
    conn.execute("SELECT 1", &[], &CancelToken::none())
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    conn.checkin().await;

    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.busy_count(), 0);

    let conn = pool.rent(&CancelToken::none()).await.unwrap();
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.busy_count(), 1);
    conn.checkin().await;

    // The second rent was served from the idle queue.
    assert_eq!(server.connections_opened(), 1);
}

#[tokio::test]
async fn pool_cap_blocks_then_wakes_waiters() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let pool = pool_for(&server, "MaxPoolSize=2;Timeout=1");

    let first = pool.rent(&CancelToken::none()).await.unwrap();
    let second = pool.rent(&CancelToken::none()).await.unwrap();
    assert_eq!(pool.busy_count(), 2);
    assert!(pool.idle_count() + pool.busy_count() <= 2);

    // The third renter parks until a return frees a slot.
    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move {
        waiter_pool.rent(&CancelToken::none()).await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiter.is_finished());

    first.checkin().await;
    let third = waiter.await.unwrap().unwrap();
    assert_eq!(pool.busy_count(), 2);

    // With the pool full again, a renter that outlives Timeout fails.
    let err = pool.rent(&CancelToken::none()).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err}");

    second.checkin().await;
    third.checkin().await;
    assert_eq!(pool.busy_count(), 0);
    assert_eq!(pool.idle_count(), 2);
}

#[tokio::test]
async fn broken_connectors_never_leak_capacity() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let pool = pool_for(&server, "MaxPoolSize=1;Timeout=2");

    let mut conn = pool.rent(&CancelToken::none()).await.unwrap();
    conn.mark_broken("induced failure");
    drop(conn);

    // The slot came back even though the connector was discarded.
    let conn = pool.rent(&CancelToken::none()).await.unwrap();
    assert!(conn.is_ready());
    conn.checkin().await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.busy_count(), 0);
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(server.connections_opened(), 2);
}

#[tokio::test]
async fn rent_cancellation_is_immediate() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let pool = pool_for(&server, "MaxPoolSize=1;Timeout=30");

    let held = pool.rent(&CancelToken::none()).await.unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = pool.rent(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::Canceled), "{err}");
    held.checkin().await;
}

#[tokio::test]
async fn pruner_closes_idle_connectors_but_preserves_min() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let pool = pool_for(
        &server,
        "MaxPoolSize=4;MinPoolSize=0;ConnectionIdleLifetime=1;ConnectionPruningInterval=1",
    );

    let a = pool.rent(&CancelToken::none()).await.unwrap();
    let b = pool.rent(&CancelToken::none()).await.unwrap();
    a.checkin().await;
    b.checkin().await;
    assert_eq!(pool.idle_count(), 2);

    // Two pruning ticks comfortably exceed the idle lifetime.
    tokio::time::sleep(Duration::from_millis(2600)).await;
    assert_eq!(pool.idle_count(), 0);
    assert_eq!(pool.busy_count(), 0);
}

#[tokio::test]
async fn min_pool_size_is_topped_up() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let pool = pool_for(
        &server,
        "MaxPoolSize=4;MinPoolSize=2;ConnectionPruningInterval=1",
    );

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert!(pool.idle_count() >= 2, "idle={}", pool.idle_count());
    assert!(server.connections_opened() >= 2);
}

#[tokio::test]
async fn registry_deduplicates_by_canonical_string() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let settings_a = ConnectionString::parse(&server.connection_string("MaxPoolSize=7")).unwrap();
    // Same options, different key spellings.
    let settings_b = ConnectionString::parse(
        &server
            .connection_string("Max Pool Size=7")
            .replace("Username", "User Id"),
    )
    .unwrap();

    let pool_a = get_or_create_pool(&settings_a).unwrap();
    let pool_b = get_or_create_pool(&settings_b).unwrap();
    assert_eq!(
        settings_a.canonical_string(),
        settings_b.canonical_string()
    );
    // One pool: renting from either shows up in both views.
    let conn = pool_a.rent(&CancelToken::none()).await.unwrap();
    assert_eq!(pool_b.busy_count(), 1);
    conn.checkin().await;
}

#[tokio::test]
async fn primary_target_rejects_a_standby_host() {
    let standby = MockServer::spawn(MockConfig {
        in_recovery: true,
        ..Default::default()
    })
    .await;

    let pool = pool_for(&standby, "TargetSessionAttributes=primary;Timeout=2");
    let err = pool.rent(&CancelToken::none()).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed(_)), "{err}");

    // prefer-primary falls through to whatever is reachable.
    let pool = pool_for(&standby, "TargetSessionAttributes=prefer-primary;Timeout=2");
    let conn = pool.rent(&CancelToken::none()).await.unwrap();
    assert!(conn.is_ready());
    conn.checkin().await;
}

#[tokio::test]
async fn read_only_target_follows_recovery_state() {
    let standby = MockServer::spawn(MockConfig {
        in_recovery: true,
        ..Default::default()
    })
    .await;
    let pool = pool_for(&standby, "TargetSessionAttributes=read-only;Timeout=2");
    let conn = pool.rent(&CancelToken::none()).await.unwrap();
    assert!(conn.is_ready());
    conn.checkin().await;

    let primary = MockServer::spawn(MockConfig::default()).await;
    let pool = pool_for(&primary, "TargetSessionAttributes=read-only;Timeout=2");
    let err = pool.rent(&CancelToken::none()).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed(_)), "{err}");
}

#[tokio::test]
async fn offline_host_with_parked_idle_never_exceeds_capacity() {
    let server_a = MockServer::spawn(MockConfig::default()).await;
    let server_b = MockServer::spawn(MockConfig::default()).await;
    let settings = ConnectionString::parse(&format!(
        "Host=127.0.0.1:{},127.0.0.1:{};Username=u;Password=p;Database=d;MaxPoolSize=2;Timeout=2",
        server_a.port, server_b.port
    ))
    .unwrap();
    let pool = ConnectionPool::new(settings.clone()).unwrap();

    // Park an idle connector on the first host...
    let conn = pool.rent(&CancelToken::none()).await.unwrap();
    assert_eq!(conn.host().port, server_a.port);
    conn.checkin().await;
    assert_eq!(pool.idle_count(), 1);

    // ...then knock that host out of the open rotation.
    crate::hosts::mark_offline(&settings.hosts[0]);

    // Both slots can still be filled and the parked connector keeps
    // counting against MaxPoolSize: it is reused, not orphaned.
    let first = pool.rent(&CancelToken::none()).await.unwrap();
    let second = pool.rent(&CancelToken::none()).await.unwrap();
    assert!(pool.idle_count() + pool.busy_count() <= 2);
    assert_eq!(pool.busy_count(), 2);
    assert_eq!(first.host().port, server_a.port);
    assert_eq!(second.host().port, server_b.port);
    assert_eq!(server_a.connections_opened(), 1);
    assert_eq!(server_b.connections_opened(), 1);

    // A third renter waits out the cap instead of opening a connection
    // beyond MaxPoolSize.
    let err = pool.rent(&CancelToken::none()).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err}");

    first.checkin().await;
    second.checkin().await;
    assert!(pool.idle_count() + pool.busy_count() <= 2);
    assert_eq!(pool.busy_count(), 0);
}

#[tokio::test]
async fn refused_connections_surface_and_mark_offline() {
    // Bind-then-drop guarantees a port with no listener.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let settings = ConnectionString::parse(&format!(
        "Host=127.0.0.1;Port={port};Username=u;Password=p;Timeout=2"
    ))
    .unwrap();
    let pool = ConnectionPool::new(settings).unwrap();
    let err = pool.rent(&CancelToken::none()).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed(_)), "{err}");
    assert_eq!(pool.busy_count(), 0);
}
