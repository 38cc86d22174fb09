// ABOUTME: Failure scenarios: daemon crash mid-call, protocol errors, unreachable daemon

use super::fake_daemon::FakeDaemon;
use super::{eventually, quiet_config};
use goxel_pool::{
    CallError, ConnectionPool, ErrorKind, PoolError, SessionId, UnixSocketConnector,
};
use std::sync::Arc;

#[tokio::test]
async fn test_crash_mid_call_is_replaced_to_minimum() {
    let daemon = FakeDaemon::start();
    let pool = ConnectionPool::new(quiet_config(2, 4), daemon.connector()).unwrap();
    pool.initialize().await.unwrap();
    let before: Vec<SessionId> = pool.get_connections().iter().map(|s| s.id).collect();

    let err = pool.execute("crash", None).await.unwrap_err();
    assert_eq!(err, PoolError::Call(CallError::ConnectionLost));
    assert_eq!(err.kind(), ErrorKind::Connection);

    let probe = pool.clone();
    eventually(move || {
        let sessions = probe.get_connections();
        sessions.len() == 2 && sessions.iter().all(|s| s.connected)
    })
    .await;

    let after: Vec<SessionId> = pool.get_connections().iter().map(|s| s.id).collect();
    assert_eq!(after.iter().filter(|id| before.contains(id)).count(), 1);
    assert_eq!(daemon.accepted(), 3);

    // The replacement serves calls
    pool.execute("ping", None).await.unwrap();
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_protocol_error_is_not_retried() {
    let daemon = FakeDaemon::start();
    let mut config = quiet_config(1, 1);
    config.call.max_attempts = 3;
    let pool = ConnectionPool::new(config, daemon.connector()).unwrap();
    pool.initialize().await.unwrap();

    let err = pool.execute("fail", None).await.unwrap_err();
    match &err {
        PoolError::Call(CallError::Rpc { code, message, .. }) => {
            assert_eq!(*code, -1001);
            assert_eq!(message, "operation failed");
        }
        other => panic!("expected an RPC error, got {other:?}"),
    }
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(daemon.requests(), 1);
    assert_eq!(pool.get_statistics().failed_requests, 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_daemon_fails_initialize() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(UnixSocketConnector::new(dir.path().join("missing.sock")));
    let pool = ConnectionPool::new(quiet_config(2, 2), connector).unwrap();

    let err = pool.initialize().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(pool.get_connections().is_empty());
}
