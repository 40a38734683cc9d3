//! ABOUTME: Startup wiring shared by the binary and its end-to-end tests
//! ABOUTME: Builds the registry, health checker, collectors and HTTP state from configuration

use dx_collect::custom::load_definitions;
use dx_collect::{
    CollectorFactory, CustomMetricsCollector, Exporter, HealthExposer, InjectorCache,
    MultiSourceCollector, QueryCollector, SourceCollector, StrategyEngine,
};
use dx_config::Config;
use dx_core::{Error, Result};
use dx_obs::ObsState;
use dx_pool::{
    Connector, DbHandle, HealthCheckMetrics, HealthChecker, HealthCheckerConfig, PoolRegistry,
};
use std::sync::Arc;
use tracing::{info, instrument};

/// Everything the process runs, ready to start
pub struct Runtime {
    pub registry: Arc<PoolRegistry>,
    pub checker: Arc<HealthChecker>,
    pub state: ObsState,
}

impl Runtime {
    /// Start background health checks and report ready
    pub fn start(&self) {
        self.checker.start();
        self.state.readiness.set_ready(true);
    }

    /// Stop health checks and close every pool; safe to call twice
    pub async fn shutdown(&self) {
        self.state.readiness.set_ready(false);
        self.checker.stop().await;
        self.registry.close().await;
        info!("Shutdown complete");
    }
}

/// Connect every source and assemble the collectors
///
/// Fails on the errors that must stop the process: duplicate sources, no
/// reachable source, or an unreadable shared metrics file.
#[instrument(skip_all, fields(sources = config.sources.len()))]
pub async fn bootstrap(config: &Config, connector: Arc<dyn Connector>) -> Result<Runtime> {
    let collection = &config.collection;
    let namespace = collection.namespace.as_str();

    let registry = Arc::new(PoolRegistry::new(connector, collection.ping_timeout));
    registry.init_all(&config.sources).await?;

    let health_metrics = Arc::new(HealthCheckMetrics::new());
    let mut exporter = Exporter::new(namespace, collection.scrape_buffer);
    health_metrics.register(exporter.registry_mut(), namespace);

    let engine =
        StrategyEngine::from_config(collection).with_error_counter(exporter.source_error_counter());
    let injectors = Arc::new(InjectorCache::new());

    exporter.add_collector(Arc::new(
        HealthExposer::new(namespace, registry.clone()).with_injectors(injectors.clone()),
    ));

    if let Some(path) = collection.default_metrics.as_deref() {
        let definitions = load_definitions(path)
            .map_err(|e| Error::Config(format!("default metrics file {}: {}", path, e)))?;
        info!(path = %path, metrics = definitions.len(), "Loaded default metrics");

        let definitions = Arc::new(definitions);
        let ns = namespace.to_string();
        let factory: CollectorFactory = Arc::new(move |handle: DbHandle| {
            Box::new(QueryCollector::new(ns.clone(), definitions.clone(), handle))
                as Box<dyn SourceCollector>
        });
        exporter.add_collector(Arc::new(
            MultiSourceCollector::new("default_metrics", registry.clone(), engine.clone(), factory)
                .with_injectors(injectors.clone()),
        ));
    }

    if config.enabled_sources().any(|s| s.custom_metrics.is_some()) {
        exporter.add_collector(Arc::new(
            CustomMetricsCollector::new(namespace, registry.clone(), engine.clone())
                .with_injectors(injectors),
        ));
    }

    let checker = Arc::new(HealthChecker::new(
        HealthCheckerConfig {
            interval: collection.health_check_interval,
            ping_timeout: collection.ping_timeout,
        },
        registry.clone(),
        health_metrics,
    ));

    info!(
        strategy = %engine.strategy(),
        collectors = ?exporter.collector_names(),
        "Collectors ready"
    );

    let state = ObsState::new(Arc::new(exporter), registry.clone())
        .with_metrics_path(config.server.metrics_path.clone());

    Ok(Runtime {
        registry,
        checker,
        state,
    })
}
