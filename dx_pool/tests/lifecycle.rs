//! ABOUTME: End-to-end lifecycle of the pool registry and health checker
//! ABOUTME: Startup with a dead source, outage, recovery, and shutdown

use dx_config::SourceConfig;
use dx_pool::testing::FakeConnector;
use dx_pool::{HealthCheckMetrics, HealthChecker, HealthCheckerConfig, HealthStatus, PoolRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig::new("inventory", "fake://inventory:5432/app").with_priority(1),
        SourceConfig::new("payments", "fake://payments:5432/app").with_priority(2),
        SourceConfig::new("reporting", "fake://reporting:5432/app").with_priority(3),
    ]
}

#[tokio::test]
async fn source_outage_and_recovery_is_tracked() {
    test_support::init_test_tracing();

    let connector = Arc::new(FakeConnector::new());
    let registry = Arc::new(PoolRegistry::new(
        connector.clone(),
        Duration::from_millis(100),
    ));
    assert_eq!(registry.init_all(&sources()).await.unwrap(), 3);

    let checker = Arc::new(HealthChecker::new(
        HealthCheckerConfig {
            interval: Duration::from_millis(40),
            ping_timeout: Duration::from_millis(100),
        },
        registry.clone(),
        Arc::new(HealthCheckMetrics::new()),
    ));
    checker.start();

    connector.source("payments").set_ping_fails(true);
    sleep(Duration::from_millis(150)).await;

    let report = registry.health_report().unwrap();
    assert_eq!(report.healthy, 2);
    assert_eq!(report.unhealthy, 1);
    let payments = registry.get_pool("payments").unwrap().unwrap();
    assert_eq!(payments.health().status(), HealthStatus::Unhealthy);
    assert!(registry
        .get_healthy()
        .unwrap()
        .iter()
        .all(|p| p.name() != "payments"));

    connector.source("payments").set_ping_fails(false);
    sleep(Duration::from_millis(150)).await;

    assert_eq!(payments.health().status(), HealthStatus::Healthy);
    assert_eq!(registry.get_healthy().unwrap().len(), 3);

    checker.stop().await;
    registry.close().await;
    registry.close().await;
    checker.stop().await;
}

#[tokio::test]
async fn startup_survives_one_dead_source() {
    let connector = Arc::new(FakeConnector::new());
    connector.source("reporting").set_connect_fails(true);
    let registry = PoolRegistry::new(connector.clone(), Duration::from_millis(100));

    assert_eq!(registry.init_all(&sources()).await.unwrap(), 2);
    assert!(registry.get_pool("reporting").unwrap().is_none());
    assert!(registry.get_by_priority(3).unwrap().is_empty());

    let report = registry.health_report().unwrap();
    assert_eq!(report.total, 2);
    assert!(report
        .sources
        .iter()
        .all(|s| s.status == HealthStatus::Healthy));

    registry.close().await;
}
