//! ABOUTME: Collection strategies that fan a per-source task out over a set of pools
//! ABOUTME: Sequential, concurrent, or hybrid by priority band, each pool bounded and isolated

use dx_config::CollectionConfig;
use dx_core::{Error, Result};
use dx_pool::ConnectionPool;
use futures_util::future::BoxFuture;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::{CollectContext, MetricSink};

/// Per-source collection function the engine schedules
pub type PoolTask = Arc<
    dyn Fn(CollectContext, Arc<ConnectionPool>, MetricSink) -> BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// Per-source error counter labelled by `datasource`
pub type SourceErrorCounter = Family<Vec<(String, String)>, Counter>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStrategy {
    /// One pool at a time in pool order
    Sequential,
    /// Every pool at once
    Concurrent,
    /// Priority 1 sequentially, then priority 2 concurrently, then priority 3 concurrently
    Hybrid,
}

impl CollectionStrategy {
    /// Parse a configured name; anything unrecognised falls back to sequential
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "sequential" => CollectionStrategy::Sequential,
            "concurrent" => CollectionStrategy::Concurrent,
            "hybrid" => CollectionStrategy::Hybrid,
            other => {
                warn!(strategy = %other, "Unknown collection strategy, using sequential");
                CollectionStrategy::Sequential
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CollectionStrategy::Sequential => "sequential",
            CollectionStrategy::Concurrent => "concurrent",
            CollectionStrategy::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for CollectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome counts for one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl ExecutionSummary {
    fn record(&mut self, ok: bool) {
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    fn merge(&mut self, other: ExecutionSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

/// Runs a [`PoolTask`] over pools according to a [`CollectionStrategy`]
#[derive(Debug, Clone)]
pub struct StrategyEngine {
    strategy: CollectionStrategy,
    default_timeout: Duration,
    source_buffer: usize,
    errors: Option<SourceErrorCounter>,
}

impl StrategyEngine {
    pub fn new(strategy: CollectionStrategy, default_timeout: Duration, source_buffer: usize) -> Self {
        Self {
            strategy,
            default_timeout,
            source_buffer: source_buffer.max(1),
            errors: None,
        }
    }

    pub fn from_config(config: &CollectionConfig) -> Self {
        Self::new(
            CollectionStrategy::from_name(&config.strategy),
            config.query_timeout,
            config.source_buffer,
        )
    }

    /// Count failed per-source attempts in `errors`
    pub fn with_error_counter(mut self, errors: SourceErrorCounter) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn strategy(&self) -> CollectionStrategy {
        self.strategy
    }

    /// Run `task` for every pool and forward its samples into `sink`
    ///
    /// Returns once every pool has finished, failed, or hit its deadline.
    /// A failing pool is logged and never affects the others.
    pub async fn execute(
        &self,
        pools: Vec<Arc<ConnectionPool>>,
        cancel: &CancellationToken,
        sink: &MetricSink,
        task: PoolTask,
    ) -> ExecutionSummary {
        debug!(strategy = %self.strategy, pools = pools.len(), "Executing collection");

        match self.strategy {
            CollectionStrategy::Sequential => self.run_sequential(pools, cancel, sink, &task).await,
            CollectionStrategy::Concurrent => self.run_concurrent(pools, cancel, sink, &task).await,
            CollectionStrategy::Hybrid => {
                let (band1, rest): (Vec<_>, Vec<_>) =
                    pools.into_iter().partition(|p| p.priority() <= 1);
                let (band2, band3): (Vec<_>, Vec<_>) =
                    rest.into_iter().partition(|p| p.priority() == 2);

                let mut summary = self.run_sequential(band1, cancel, sink, &task).await;
                summary.merge(self.run_concurrent(band2, cancel, sink, &task).await);
                summary.merge(self.run_concurrent(band3, cancel, sink, &task).await);
                summary
            }
        }
    }

    async fn run_sequential(
        &self,
        pools: Vec<Arc<ConnectionPool>>,
        cancel: &CancellationToken,
        sink: &MetricSink,
        task: &PoolTask,
    ) -> ExecutionSummary {
        let mut summary = ExecutionSummary::default();
        for pool in pools {
            let ok = self
                .run_pool(pool, cancel.clone(), sink.clone(), task.clone())
                .await;
            summary.record(ok);
        }
        summary
    }

    async fn run_concurrent(
        &self,
        pools: Vec<Arc<ConnectionPool>>,
        cancel: &CancellationToken,
        sink: &MetricSink,
        task: &PoolTask,
    ) -> ExecutionSummary {
        let mut summary = ExecutionSummary::default();
        let mut workers = JoinSet::new();

        for pool in pools {
            let engine = self.clone();
            let cancel = cancel.clone();
            let sink = sink.clone();
            let task = task.clone();
            workers.spawn(async move { engine.run_pool(pool, cancel, sink, task).await });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(ok) => summary.record(ok),
                Err(e) => {
                    warn!(error = %e, "Collection worker panicked");
                    summary.record(false);
                }
            }
        }
        summary
    }

    async fn run_pool(
        &self,
        pool: Arc<ConnectionPool>,
        cancel: CancellationToken,
        sink: MetricSink,
        task: PoolTask,
    ) -> bool {
        let timeout = pool.config().effective_query_timeout(self.default_timeout);
        let ctx = CollectContext::new(pool.name(), timeout, &cancel);
        let (pool_sink, mut rx) = MetricSink::channel(self.source_buffer);

        let worker = ctx.run(task(ctx.clone(), pool.clone(), pool_sink));
        let forward = async move {
            let mut forwarded = 0usize;
            while let Some(sample) = rx.recv().await {
                if sink.send(sample).await.is_err() {
                    break;
                }
                forwarded += 1;
            }
            forwarded
        };

        let (result, forwarded) = tokio::join!(worker, forward);

        match result {
            Ok(()) => {
                debug!(datasource = %pool.name(), samples = forwarded, "Collection finished");
                true
            }
            Err(e) => {
                self.record_failure(&pool, &e);
                false
            }
        }
    }

    fn record_failure(&self, pool: &ConnectionPool, error: &Error) {
        if let Some(errors) = &self.errors {
            errors
                .get_or_create(&vec![("datasource".to_string(), pool.name().to_string())])
                .inc();
        }

        match error {
            Error::Cancelled(_) => {
                debug!(datasource = %pool.name(), error = %error, "Collection cancelled")
            }
            _ => warn!(datasource = %pool.name(), error = %error, "Collection failed for data source"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_names() {
        assert_eq!(CollectionStrategy::from_name("hybrid"), CollectionStrategy::Hybrid);
        assert_eq!(
            CollectionStrategy::from_name(" Concurrent "),
            CollectionStrategy::Concurrent
        );
        assert_eq!(
            CollectionStrategy::from_name("round-robin"),
            CollectionStrategy::Sequential
        );
        assert_eq!(CollectionStrategy::from_name(""), CollectionStrategy::Sequential);
        assert_eq!(CollectionStrategy::Hybrid.to_string(), "hybrid");
    }

    #[test]
    fn test_from_config_uses_collection_settings() {
        let config = CollectionConfig {
            strategy: "concurrent".to_string(),
            query_timeout: Duration::from_secs(7),
            ..CollectionConfig::default()
        };

        let engine = StrategyEngine::from_config(&config);
        assert_eq!(engine.strategy(), CollectionStrategy::Concurrent);
        assert_eq!(engine.default_timeout, Duration::from_secs(7));
    }
}
