// Multiplexing scheduler scenarios: many logical commands sharing a small
// set of connectors.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::cancellation::CancelToken;
use crate::config::ConnectionString;
use crate::errors::Error;
use crate::mock_backend::{MockConfig, MockServer};
use crate::pool::ConnectionPool;
use crate::stats::COUNTERS;

fn mux_pool(server: &MockServer, extra: &str) -> ConnectionPool {
    let settings = ConnectionString::parse(
        &server.connection_string(&format!("Multiplexing=true;{extra}")),
    )
    .unwrap();
    ConnectionPool::new(settings).unwrap()
}

#[tokio::test]
async fn hundred_commands_share_four_connectors() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let pool = mux_pool(&server, "MaxPoolSize=4");

    let batches_before = COUNTERS.multiplexing_batches_sent.load(Ordering::Relaxed);

    let mut pending = Vec::new();
    for i in 0..100 {
        pending.push((i, pool.submit(&format!("SELECT {i}"), Vec::new()).await.unwrap()));
    }

    for (i, command) in pending {
        let result = command.wait().await.unwrap();
        // Results route back to the handle that submitted them.
        assert_eq!(result.rows[0].get_str(0), Some(format!("{i}").as_str()));
        assert_eq!(result.command_tag, "SELECT 1");
    }

    let batches_after = COUNTERS.multiplexing_batches_sent.load(Ordering::Relaxed);
    assert!(batches_after > batches_before);
    assert!(server.connections_opened() <= 4);

    // Connectors all found their way back to the pool.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.busy_count(), 0);
    assert!(pool.idle_count() >= 1);
}

#[tokio::test]
async fn batch_error_fails_only_its_own_command() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let pool = mux_pool(&server, "MaxPoolSize=1");

    let good_before = pool.submit("SELECT 11", Vec::new()).await.unwrap();
    let bad = pool.submit("error out", Vec::new()).await.unwrap();
    let good_after = pool.submit("SELECT 12", Vec::new()).await.unwrap();

    assert_eq!(
        good_before.wait().await.unwrap().rows[0].get_str(0),
        Some("11")
    );
    let err = bad.wait().await.unwrap_err();
    assert_eq!(err.sqlstate(), Some("42601"));
    assert_eq!(
        good_after.wait().await.unwrap().rows[0].get_str(0),
        Some("12")
    );
}

#[tokio::test]
async fn canceling_a_submitted_command_resolves_it() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let pool = mux_pool(&server, "MaxPoolSize=1");

    let blocked = pool
        .submit("select blocking_marker", Vec::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    blocked.cancel();

    let err = blocked.wait().await.unwrap_err();
    assert!(matches!(err, Error::Canceled), "{err}");

    // The scheduler keeps working afterwards.
    let next = pool.submit("SELECT 5", Vec::new()).await.unwrap();
    assert_eq!(next.wait().await.unwrap().rows[0].get_str(0), Some("5"));
}

#[tokio::test]
async fn submit_requires_multiplexing() {
    let server = MockServer::spawn(MockConfig::default()).await;
    let settings = ConnectionString::parse(&server.connection_string("MaxPoolSize=2")).unwrap();
    let pool = ConnectionPool::new(settings).unwrap();
    let err = pool.submit("SELECT 1", Vec::new()).await.unwrap_err();
    assert!(matches!(err, Error::ConfigurationInvalid(_)), "{err}");
}
