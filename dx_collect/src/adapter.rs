//! ABOUTME: Lifts a single-source collector into one that covers every healthy pool
//! ABOUTME: Each pool gets its own collector instance, bounded context, and label injector

use async_trait::async_trait;
use dx_core::Result;
use dx_pool::{ConnectionPool, DbHandle, PoolRegistry};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::collector::{Collector, SourceCollector};
use crate::context::{CollectContext, MetricSink};
use crate::labels::InjectorCache;
use crate::sample::MetricDesc;
use crate::strategy::{PoolTask, StrategyEngine};

/// Builds a collector bound to one database handle
pub type CollectorFactory = Arc<dyn Fn(DbHandle) -> Box<dyn SourceCollector> + Send + Sync>;

/// Builds a collector for a pool, or `None` to leave the pool out
pub type PerSourceFactory =
    Arc<dyn Fn(&ConnectionPool) -> Option<Box<dyn SourceCollector>> + Send + Sync>;

/// Multi-source collector over the registry's healthy pools
pub struct MultiSourceCollector {
    name: String,
    registry: Arc<PoolRegistry>,
    engine: StrategyEngine,
    factory: PerSourceFactory,
    injectors: Arc<InjectorCache>,
}

impl MultiSourceCollector {
    /// Run the collector `factory` builds against every healthy pool
    pub fn new(
        name: impl Into<String>,
        registry: Arc<PoolRegistry>,
        engine: StrategyEngine,
        factory: CollectorFactory,
    ) -> Self {
        let per_source: PerSourceFactory =
            Arc::new(move |pool: &ConnectionPool| Some(factory(pool.handle())));
        Self::per_source(name, registry, engine, per_source)
    }

    /// Like [`MultiSourceCollector::new`] but the factory sees the whole pool
    /// and may skip it
    pub fn per_source(
        name: impl Into<String>,
        registry: Arc<PoolRegistry>,
        engine: StrategyEngine,
        factory: PerSourceFactory,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            engine,
            factory,
            injectors: Arc::new(InjectorCache::new()),
        }
    }

    /// Share label injectors with other collectors
    pub fn with_injectors(mut self, injectors: Arc<InjectorCache>) -> Self {
        self.injectors = injectors;
        self
    }

    pub fn engine(&self) -> &StrategyEngine {
        &self.engine
    }
}

#[async_trait]
impl Collector for MultiSourceCollector {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self) -> Vec<MetricDesc> {
        let pools = self.registry.get_all().unwrap_or_default();
        pools
            .iter()
            .find_map(|pool| (self.factory)(pool.as_ref()))
            .map(|collector| collector.describe())
            .unwrap_or_default()
    }

    #[instrument(skip_all, fields(collector = %self.name))]
    async fn collect(&self, cancel: CancellationToken, sink: MetricSink) -> Result<()> {
        let pools = self.registry.get_healthy()?;

        let mut collectors: HashMap<String, Arc<dyn SourceCollector>> = HashMap::new();
        let mut selected = Vec::with_capacity(pools.len());
        for pool in pools {
            if let Some(collector) = (self.factory)(pool.as_ref()) {
                collectors.insert(pool.name().to_string(), Arc::from(collector));
                selected.push(pool);
            }
        }

        if selected.is_empty() {
            debug!("No healthy data sources to collect from");
            return Ok(());
        }

        let collectors = Arc::new(collectors);
        let injectors = self.injectors.clone();
        let task: PoolTask = Arc::new(
            move |ctx: CollectContext,
                  pool: Arc<ConnectionPool>,
                  sink: MetricSink|
                  -> BoxFuture<'static, Result<()>> {
                let collector = collectors.get(pool.name()).cloned();
                let sink = sink.with_injector(injectors.get(&pool));
                Box::pin(async move {
                    match collector {
                        Some(collector) => collector.collect(&ctx, &sink).await,
                        None => Ok(()),
                    }
                })
            },
        );

        let summary = self.engine.execute(selected, &cancel, &sink, task).await;
        debug!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Multi-source collection finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::MetricSample;
    use crate::strategy::CollectionStrategy;
    use dx_config::SourceConfig;
    use dx_pool::testing::FakeConnector;
    use std::time::Duration;

    struct PingCollector {
        handle: DbHandle,
    }

    #[async_trait]
    impl SourceCollector for PingCollector {
        fn describe(&self) -> Vec<MetricDesc> {
            vec![MetricDesc::new("test_up", "Source answered a ping")]
        }

        async fn collect(&self, ctx: &CollectContext, sink: &MetricSink) -> Result<()> {
            ctx.run(self.handle.ping()).await?;
            sink.send(MetricSample::gauge("test_up", "Source answered a ping", 1.0))
                .await
        }
    }

    async fn registry(connector: Arc<FakeConnector>) -> Arc<PoolRegistry> {
        let registry = Arc::new(PoolRegistry::new(connector, Duration::from_millis(100)));
        registry
            .init_all(&[
                SourceConfig::new("east", "fake://east/db").with_labels("region=us-east"),
                SourceConfig::new("west", "fake://west/db").with_labels("region=us-west"),
            ])
            .await
            .unwrap();
        registry
    }

    fn factory() -> CollectorFactory {
        Arc::new(|handle: DbHandle| Box::new(PingCollector { handle }) as Box<dyn SourceCollector>)
    }

    #[tokio::test]
    async fn test_collects_every_healthy_pool_with_labels() {
        let registry = registry(Arc::new(FakeConnector::new())).await;
        let engine = StrategyEngine::new(CollectionStrategy::Sequential, Duration::from_secs(1), 8);
        let collector = MultiSourceCollector::new("ping", registry, engine, factory());

        let (sink, mut rx) = MetricSink::channel(16);
        collector.collect(CancellationToken::new(), sink).await.unwrap();

        let mut regions = Vec::new();
        while let Some(sample) = rx.recv().await {
            regions.push((
                sample.label("datasource").unwrap_or_default().to_string(),
                sample.label("region").unwrap_or_default().to_string(),
            ));
        }
        assert_eq!(
            regions,
            vec![
                ("east".to_string(), "us-east".to_string()),
                ("west".to_string(), "us-west".to_string()),
            ]
        );
        assert_eq!(collector.describe().len(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_pools_are_skipped() {
        let connector = Arc::new(FakeConnector::new());
        let registry = registry(connector.clone()).await;
        registry
            .get_pool("west")
            .unwrap()
            .unwrap()
            .health()
            .record_failure("gone");

        let engine = StrategyEngine::new(CollectionStrategy::Concurrent, Duration::from_secs(1), 8);
        let collector = MultiSourceCollector::new("ping", registry, engine, factory());

        let (sink, mut rx) = MetricSink::channel(16);
        collector.collect(CancellationToken::new(), sink).await.unwrap();

        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.label("datasource"), Some("east"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_per_source_factory_can_skip_pools() {
        let registry = registry(Arc::new(FakeConnector::new())).await;
        let engine = StrategyEngine::new(CollectionStrategy::Sequential, Duration::from_secs(1), 8);
        let factory: PerSourceFactory = Arc::new(|pool: &ConnectionPool| {
            (pool.name() == "west").then(|| {
                Box::new(PingCollector {
                    handle: pool.handle(),
                }) as Box<dyn SourceCollector>
            })
        });
        let collector = MultiSourceCollector::per_source("ping", registry, engine, factory);

        let (sink, mut rx) = MetricSink::channel(16);
        collector.collect(CancellationToken::new(), sink).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().label("datasource"), Some("west"));
        assert!(rx.recv().await.is_none());
    }
}
