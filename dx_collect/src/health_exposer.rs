//! ABOUTME: Per-source health gauge built from in-memory health snapshots
//! ABOUTME: Never touches the network, so it answers even when every source is down

use async_trait::async_trait;
use dx_core::Result;
use dx_pool::PoolRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::collector::Collector;
use crate::context::MetricSink;
use crate::labels::InjectorCache;
use crate::sample::{MetricDesc, MetricSample};

const HELP: &str = "Whether the data source passed its latest health check (1) or not (0)";

pub struct HealthExposer {
    metric_name: String,
    registry: Arc<PoolRegistry>,
    injectors: Arc<InjectorCache>,
}

impl HealthExposer {
    pub fn new(namespace: &str, registry: Arc<PoolRegistry>) -> Self {
        Self {
            metric_name: format!("{}_datasource_health", namespace),
            registry,
            injectors: Arc::new(InjectorCache::new()),
        }
    }

    pub fn with_injectors(mut self, injectors: Arc<InjectorCache>) -> Self {
        self.injectors = injectors;
        self
    }
}

#[async_trait]
impl Collector for HealthExposer {
    fn name(&self) -> &str {
        "datasource_health"
    }

    fn describe(&self) -> Vec<MetricDesc> {
        vec![MetricDesc::new(&self.metric_name, HELP).with_labels(["datasource"])]
    }

    async fn collect(&self, _cancel: CancellationToken, sink: MetricSink) -> Result<()> {
        for pool in self.registry.get_all()? {
            let status = pool.health().status();
            let sample = MetricSample::gauge(&self.metric_name, HELP, status.to_metric_value());
            sink.send(self.injectors.get(&pool).wrap(sample)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dx_config::SourceConfig;
    use dx_pool::testing::FakeConnector;
    use std::time::Duration;

    #[tokio::test]
    async fn test_one_gauge_per_enabled_source() {
        let connector = Arc::new(FakeConnector::new());
        let registry = Arc::new(PoolRegistry::new(connector.clone(), Duration::from_millis(100)));
        registry
            .init_all(&[
                SourceConfig::new("a", "fake://a/db").with_labels("env=prod"),
                SourceConfig::new("b", "fake://b/db"),
                SourceConfig::new("c", "fake://c/db"),
            ])
            .await
            .unwrap();
        registry
            .get_pool("b")
            .unwrap()
            .unwrap()
            .health()
            .record_failure("down");
        registry.disable("c").unwrap();

        connector.source("a").set_ping_fails(true);
        let pings_before = connector.source("a").pings();

        let exposer = HealthExposer::new("dbexporter", registry);
        let (sink, mut rx) = MetricSink::channel(8);
        exposer.collect(CancellationToken::new(), sink).await.unwrap();

        let a = rx.recv().await.unwrap();
        assert_eq!(a.name, "dbexporter_datasource_health");
        assert_eq!(a.label("datasource"), Some("a"));
        assert_eq!(a.label("env"), Some("prod"));
        assert_eq!(a.value.value(), 1.0);

        let b = rx.recv().await.unwrap();
        assert_eq!(b.label("datasource"), Some("b"));
        assert_eq!(b.value.value(), 0.0);

        assert!(rx.recv().await.is_none());
        assert_eq!(connector.source("a").pings(), pings_before);
    }
}
