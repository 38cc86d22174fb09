// ABOUTME: Lifecycle scenarios: startup, growth under load, rotation and shutdown

use super::fake_daemon::FakeDaemon;
use super::{eventually, quiet_config};
use goxel_pool::{ConnectionPool, PoolConfig, PoolError, PoolStatus};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_initialize_opens_exactly_minimum() {
    let daemon = FakeDaemon::start();
    let pool = ConnectionPool::new(quiet_config(2, 5), daemon.connector()).unwrap();

    pool.initialize().await.unwrap();

    assert_eq!(pool.status(), PoolStatus::Ready);
    assert_eq!(pool.get_connections().len(), 2);
    assert_eq!(daemon.accepted(), 2);

    let status = pool.execute("goxel.get_status", None).await.unwrap();
    assert_eq!(status, json!({"status": "idle"}));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_excess_demand_grows_to_max_then_queues() {
    let daemon = FakeDaemon::start();
    let pool = ConnectionPool::new(quiet_config(2, 3), daemon.connector()).unwrap();
    pool.initialize().await.unwrap();

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute("slow", Some(json!({"ms": 150}))).await })
        })
        .collect();

    for call in calls {
        assert_eq!(call.await.unwrap().unwrap(), json!({"slept": 150}));
    }

    let stats = pool.get_statistics();
    assert_eq!(stats.total_sessions, 3);
    assert_eq!(stats.demands_queued, 2);
    assert_eq!(stats.total_requests, 5);
    assert_eq!(stats.failed_requests, 0);
    assert_eq!(stats.queue_size, 0);
    assert_eq!(daemon.accepted(), 3);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_fails_every_queued_demand() {
    let daemon = FakeDaemon::start();
    let pool = ConnectionPool::new(quiet_config(1, 1), daemon.connector()).unwrap();
    pool.initialize().await.unwrap();

    let held = pool.acquire().await.unwrap();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(30)).await })
        })
        .collect();

    let probe = pool.clone();
    eventually(move || probe.get_queue_size() == 3).await;

    pool.shutdown().await.unwrap();

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().unwrap_err(), PoolError::Shutdown);
    }
    assert!(pool.get_connections().is_empty());
    assert_eq!(pool.status(), PoolStatus::Shutdown);

    // Releasing after shutdown is a no-op
    held.release();
    assert!(pool.get_connections().is_empty());
}

#[tokio::test]
async fn test_rotation_after_request_quota() {
    let daemon = FakeDaemon::start();
    let config = PoolConfig {
        max_requests_per_connection: 2,
        ..quiet_config(1, 1)
    };
    let pool = ConnectionPool::new(config, daemon.connector()).unwrap();
    pool.initialize().await.unwrap();
    let first_id = pool.get_connections()[0].id;

    pool.execute("ping", None).await.unwrap();
    pool.execute("ping", None).await.unwrap();

    let probe = pool.clone();
    eventually(move || {
        let sessions = probe.get_connections();
        sessions.len() == 1 && sessions[0].id != first_id
    })
    .await;

    assert_eq!(pool.get_statistics().sessions_rotated, 1);
    assert_eq!(daemon.accepted(), 2);
    assert_eq!(pool.execute("ping", None).await.unwrap(), json!("pong"));

    pool.shutdown().await.unwrap();
}
