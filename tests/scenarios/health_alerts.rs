// ABOUTME: Health scenarios driven by the live monitor loop and ping latency

use super::fake_daemon::FakeDaemon;
use super::{eventually, quiet_config};
use goxel_pool::{AlertKind, ConnectionPool, HealthConfig, HealthTier, PoolConfig, PoolStatus};
use std::time::Duration;

fn probing_config() -> PoolConfig {
    PoolConfig {
        health_check_interval: Duration::from_millis(50),
        health: HealthConfig {
            probe_timeout: Duration::from_secs(1),
            healthy_latency: Duration::from_millis(20),
            degraded_latency: Duration::from_millis(300),
            ..HealthConfig::default()
        },
        ..quiet_config(1, 1)
    }
}

#[tokio::test]
async fn test_degraded_latency_alerts_exactly_once() {
    let daemon = FakeDaemon::start();
    daemon.set_ping_delay(Duration::from_millis(60));
    let pool = ConnectionPool::new(probing_config(), daemon.connector()).unwrap();
    let mut alerts = pool.subscribe_alerts();
    pool.initialize().await.unwrap();

    let monitor = pool.health_monitor().clone();
    eventually(move || monitor.aggregated_stats().total_checks >= 4).await;

    let mut degraded = 0;
    while let Ok(alert) = alerts.try_recv() {
        assert_ne!(alert.kind, AlertKind::Unhealthy);
        if alert.kind == AlertKind::Degraded {
            degraded += 1;
        }
    }
    assert_eq!(degraded, 1);

    let probe = pool.clone();
    eventually(move || probe.status() == PoolStatus::Degraded).await;
    assert_eq!(pool.get_connections()[0].health, HealthTier::Degraded);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recovered_latency_restores_ready() {
    let daemon = FakeDaemon::start();
    daemon.set_ping_delay(Duration::from_millis(60));
    let pool = ConnectionPool::new(probing_config(), daemon.connector()).unwrap();
    let mut alerts = pool.subscribe_alerts();
    pool.initialize().await.unwrap();

    let probe = pool.clone();
    eventually(move || probe.status() == PoolStatus::Degraded).await;

    daemon.set_ping_delay(Duration::ZERO);
    let probe = pool.clone();
    eventually(move || probe.status() == PoolStatus::Ready).await;

    let mut kinds = Vec::new();
    while let Ok(alert) = alerts.try_recv() {
        kinds.push(alert.kind);
    }
    assert!(kinds.contains(&AlertKind::Recovered));

    pool.shutdown().await.unwrap();
}
