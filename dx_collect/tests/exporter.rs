//! ABOUTME: Full scrape through the exporter with health, shared and per-source metrics
//! ABOUTME: Checks the rendered text carries per-source labels and skips unhealthy sources

use dx_collect::custom::{load_definitions, parse_definitions};
use dx_collect::{
    CollectionStrategy, CollectorFactory, CustomMetricsCollector, Exporter, HealthExposer,
    InjectorCache, MultiSourceCollector, QueryCollector, SourceCollector, StrategyEngine,
};
use dx_config::SourceConfig;
use dx_pool::testing::FakeConnector;
use dx_pool::{DbHandle, PoolRegistry, QueryRow, SqlValue};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SHARED: &str = r#"
[[metric]]
context = "up"
request = "SELECT 1 AS value FROM dual"

[metric.help]
value = "Source answered the shared query"
"#;

const TABLESPACES: &str = r#"
[[metric]]
context = "tablespace"
request = "SELECT tablespace, bytes FROM dba_tablespace_usage"
labels = ["tablespace"]

[metric.help]
bytes = "Tablespace size in bytes"
"#;

#[tokio::test]
async fn scrape_renders_labelled_metrics_for_every_source() {
    test_support::init_test_tracing();

    let tablespaces = test_support::write_temp_file(".toml", TABLESPACES);
    let connector = Arc::new(FakeConnector::new());
    connector.source("orders").set_rows(
        "SELECT 1 AS value FROM dual",
        vec![QueryRow::new().with("VALUE", SqlValue::Int(1))],
    );
    connector.source("orders").set_rows(
        "SELECT tablespace, bytes FROM dba_tablespace_usage",
        vec![QueryRow::new()
            .with("TABLESPACE", SqlValue::Text("USERS".to_string()))
            .with("BYTES", SqlValue::Int(2048))],
    );
    connector.source("billing").set_rows(
        "SELECT 1 AS value FROM dual",
        vec![QueryRow::new().with("VALUE", SqlValue::Int(1))],
    );

    let mut orders = SourceConfig::new("orders", "fake://orders/db").with_labels("env=prod");
    orders.custom_metrics = Some(tablespaces.path().display().to_string());
    let billing = SourceConfig::new("billing", "fake://billing/db").with_labels("env=prod");
    let archive = SourceConfig::new("archive", "fake://archive/db");

    let registry = Arc::new(PoolRegistry::new(connector.clone(), Duration::from_millis(100)));
    registry
        .init_all(&[orders, billing, archive])
        .await
        .unwrap();
    registry
        .get_pool("archive")
        .unwrap()
        .unwrap()
        .health()
        .record_failure("connection reset by peer");

    let mut exporter = Exporter::new("dbexporter", 64);
    let engine = StrategyEngine::new(CollectionStrategy::Concurrent, Duration::from_secs(1), 16)
        .with_error_counter(exporter.source_error_counter());
    let injectors = Arc::new(InjectorCache::new());

    let shared = Arc::new(parse_definitions(SHARED).unwrap());
    let factory: CollectorFactory = Arc::new(move |handle: DbHandle| {
        Box::new(QueryCollector::new("dbexporter", shared.clone(), handle)) as Box<dyn SourceCollector>
    });

    exporter.add_collector(Arc::new(
        HealthExposer::new("dbexporter", registry.clone()).with_injectors(injectors.clone()),
    ));
    exporter.add_collector(Arc::new(
        MultiSourceCollector::new("default_metrics", registry.clone(), engine.clone(), factory)
            .with_injectors(injectors.clone()),
    ));
    exporter.add_collector(Arc::new(
        CustomMetricsCollector::new("dbexporter", registry.clone(), engine).with_injectors(injectors),
    ));

    let body = exporter.render(CancellationToken::new()).await.unwrap();

    assert!(body.contains("dbexporter_datasource_health{datasource=\"archive\"} 0"));
    assert!(body.contains("dbexporter_datasource_health{datasource=\"orders\",env=\"prod\"} 1"));
    assert!(body.contains("dbexporter_up_value{datasource=\"billing\",env=\"prod\"} 1"));
    assert!(body.contains("dbexporter_up_value{datasource=\"orders\",env=\"prod\"} 1"));
    assert!(!body.contains("dbexporter_up_value{datasource=\"archive\"}"));
    assert!(body.contains(
        "dbexporter_tablespace_bytes{tablespace=\"USERS\",datasource=\"orders\",env=\"prod\"} 2048"
    ));
    assert_eq!(connector.source("archive").queries(), 0);

    // the second scrape reuses the cached definitions and the same output shape
    let again = exporter.render(CancellationToken::new()).await.unwrap();
    assert!(again.contains("dbexporter_exporter_scrapes_total 2"));
    assert!(load_definitions(tablespaces.path()).is_ok());

    registry.close().await;
}
