//! ABOUTME: Registry owning one connection pool per configured data source
//! ABOUTME: Validates name/host uniqueness, probes on startup, and tears everything down on close

use dx_config::SourceConfig;
use dx_core::{to_rfc3339, Error, Result};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::driver::{close_within, probe, Connector};
use crate::dsn;
use crate::health::HealthStatus;
use crate::pool::ConnectionPool;

/// Health of one source as shown on the diagnostics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub name: String,
    pub host: String,
    pub priority: u8,
    pub status: HealthStatus,
    pub last_check_time: Option<String>,
    pub last_error: Option<String>,
}

/// Per-source health plus aggregate counts
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub sources: Vec<SourceHealth>,
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Owns every [`ConnectionPool`], keyed and iterated by source name
#[derive(Debug)]
pub struct PoolRegistry {
    connector: Arc<dyn Connector>,
    ping_timeout: Duration,
    pools: RwLock<BTreeMap<String, Arc<ConnectionPool>>>,
    initialized: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    tasks: TaskTracker,
}

impl PoolRegistry {
    pub fn new(connector: Arc<dyn Connector>, ping_timeout: Duration) -> Self {
        Self {
            connector,
            ping_timeout,
            pools: RwLock::new(BTreeMap::new()),
            initialized: AtomicBool::new(false),
            shutdown: Mutex::new(CancellationToken::new()),
            tasks: TaskTracker::new(),
        }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn ping_timeout(&self) -> Duration {
        self.ping_timeout
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Token cancelled when the registry closes
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Spawn a task that [`PoolRegistry::close`] waits for
    pub fn spawn_background<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task)
    }

    /// Open, configure and probe a pool for every enabled source
    ///
    /// Duplicate names or hosts abort before anything is opened. A source
    /// that cannot be reached is logged and left out. At least one pool
    /// must come up.
    #[instrument(skip(self, sources), fields(sources = sources.len()))]
    pub async fn init_all(&self, sources: &[SourceConfig]) -> Result<usize> {
        if self.is_initialized() {
            info!("Re-initializing pool registry");
            self.close().await;
        }

        let mut enabled: Vec<&SourceConfig> = sources.iter().filter(|s| s.enabled).collect();
        enabled.sort_by(|a, b| a.name.cmp(&b.name));

        let hosts = Self::check_unique(&enabled)?;

        let mut pools = BTreeMap::new();
        for (source, host) in enabled.into_iter().zip(hosts) {
            match self.open_pool(source, host).await {
                Ok(pool) => {
                    pools.insert(source.name.clone(), Arc::new(pool));
                }
                Err(e) => {
                    warn!(
                        datasource = %source.name,
                        error = %e,
                        "Data source unreachable at startup, skipping it"
                    );
                }
            }
        }

        if pools.is_empty() {
            return Err(Error::NoSources(format!(
                "none of the {} configured data sources could be reached",
                sources.iter().filter(|s| s.enabled).count()
            )));
        }

        let count = pools.len();
        self.reset_lifecycle();
        *self.pools.write().unwrap_or_else(|p| p.into_inner()) = pools;
        self.initialized.store(true, Ordering::SeqCst);

        info!(pools = count, "Pool registry initialized");
        Ok(count)
    }

    fn check_unique(sources: &[&SourceConfig]) -> Result<Vec<String>> {
        let mut names: HashMap<&str, ()> = HashMap::new();
        let mut hosts: HashMap<String, &str> = HashMap::new();
        let mut normalized = Vec::with_capacity(sources.len());

        for source in sources {
            if names.insert(source.name.as_str(), ()).is_some() {
                return Err(Error::DuplicateSource(source.name.clone()));
            }

            let host = dsn::normalized_host(source)?;
            if let Some(other) = hosts.get(&host) {
                return Err(Error::DuplicateHost(format!(
                    "'{}' and '{}' both point at {}",
                    other, source.name, host
                )));
            }
            hosts.insert(host.clone(), source.name.as_str());
            normalized.push(host);
        }

        Ok(normalized)
    }

    async fn open_pool(&self, source: &SourceConfig, host: String) -> Result<ConnectionPool> {
        let handle = self.connector.connect(source).await?;

        if let Err(e) = probe(&handle, self.ping_timeout).await {
            if !close_within(&handle, self.ping_timeout).await {
                warn!(datasource = %source.name, "Closing the unreachable handle timed out");
            }
            return Err(e);
        }

        let pool = ConnectionPool::new(Arc::new(source.clone()), host, handle);
        pool.health().record_success();

        debug!(
            datasource = %source.name,
            priority = source.priority,
            host = %pool.host(),
            "Data source connected"
        );
        Ok(pool)
    }

    fn reset_lifecycle(&self) {
        let mut token = self.shutdown.lock().unwrap_or_else(|p| p.into_inner());
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        self.tasks.reopen();
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(Error::NotInitialized(
                "pool registry used before init_all succeeded".to_string(),
            ))
        }
    }

    fn collect_pools<F>(&self, keep: F) -> Result<Vec<Arc<ConnectionPool>>>
    where
        F: Fn(&ConnectionPool) -> bool,
    {
        self.ensure_initialized()?;
        let pools = self.pools.read().unwrap_or_else(|p| p.into_inner());
        Ok(pools.values().filter(|p| keep(p)).cloned().collect())
    }

    pub fn get_pool(&self, name: &str) -> Result<Option<Arc<ConnectionPool>>> {
        self.ensure_initialized()?;
        let pools = self.pools.read().unwrap_or_else(|p| p.into_inner());
        Ok(pools.get(name).cloned())
    }

    /// Enabled pools in name order
    pub fn get_all(&self) -> Result<Vec<Arc<ConnectionPool>>> {
        self.collect_pools(|p| p.is_enabled())
    }

    /// Pools whose last probe succeeded
    pub fn get_healthy(&self) -> Result<Vec<Arc<ConnectionPool>>> {
        self.collect_pools(|p| p.is_enabled() && p.health().is_healthy())
    }

    /// Enabled pools in one priority band
    pub fn get_by_priority(&self, band: u8) -> Result<Vec<Arc<ConnectionPool>>> {
        self.collect_pools(|p| p.is_enabled() && p.priority() == band)
    }

    /// Take a source out of rotation until the next re-initialization
    pub fn disable(&self, name: &str) -> Result<()> {
        let pool = self
            .get_pool(name)?
            .ok_or_else(|| Error::NotFound(format!("data source '{}'", name)))?;
        pool.health().mark_disabled();
        info!(datasource = %name, "Data source disabled");
        Ok(())
    }

    pub fn health_report(&self) -> Result<HealthReport> {
        self.ensure_initialized()?;
        let pools = self.pools.read().unwrap_or_else(|p| p.into_inner());

        let sources: Vec<SourceHealth> = pools
            .values()
            .map(|pool| {
                let snapshot = pool.health().snapshot();
                SourceHealth {
                    name: pool.name().to_string(),
                    host: pool.host().to_string(),
                    priority: pool.priority(),
                    status: snapshot.status,
                    last_check_time: snapshot.last_check_time.map(to_rfc3339),
                    last_error: snapshot.last_error,
                }
            })
            .collect();

        let healthy = sources
            .iter()
            .filter(|s| s.status == HealthStatus::Healthy)
            .count();
        let unhealthy = sources
            .iter()
            .filter(|s| matches!(s.status, HealthStatus::Unhealthy | HealthStatus::Unknown))
            .count();

        Ok(HealthReport {
            total: sources.len(),
            sources,
            healthy,
            unhealthy,
        })
    }

    /// Stop background tasks, close every handle and forget all pools
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        self.shutdown_token().cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let pools = {
            let mut guard = self.pools.write().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        self.initialized.store(false, Ordering::SeqCst);

        if pools.is_empty() {
            return;
        }

        let timeout = self.ping_timeout;
        join_all(pools.values().map(|pool| async move {
            if !close_within(&pool.handle(), timeout).await {
                warn!(datasource = %pool.name(), "Closing the handle timed out, abandoning it");
            }
        }))
        .await;
        info!(pools = pools.len(), "Pool registry closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeConnector;

    fn registry(connector: Arc<FakeConnector>) -> PoolRegistry {
        PoolRegistry::new(connector, Duration::from_millis(200))
    }

    fn sources() -> Vec<SourceConfig> {
        vec![
            SourceConfig::new("c-archive", "fake://archive:5432/db").with_priority(3),
            SourceConfig::new("a-orders", "fake://orders:5432/db").with_priority(1),
            SourceConfig::new("b-billing", "fake://billing:5432/db"),
        ]
    }

    #[tokio::test]
    async fn test_init_all_creates_pools_in_name_order() {
        let registry = registry(Arc::new(FakeConnector::new()));

        let count = registry.init_all(&sources()).await.unwrap();
        assert_eq!(count, 3);

        let names: Vec<String> = registry
            .get_all()
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["a-orders", "b-billing", "c-archive"]);
        assert_eq!(registry.get_healthy().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_source_is_skipped() {
        let connector = Arc::new(FakeConnector::new());
        connector.source("b-billing").set_ping_fails(true);
        let registry = registry(connector.clone());

        assert_eq!(registry.init_all(&sources()).await.unwrap(), 2);
        assert!(registry.get_pool("b-billing").unwrap().is_none());
        assert!(registry.get_pool("a-orders").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_slow_ping_is_bounded_and_skipped() {
        let connector = Arc::new(FakeConnector::new());
        connector.source("c-archive").set_ping_delay(Duration::from_secs(5));
        let registry = registry(connector);

        let started = std::time::Instant::now();
        assert_eq!(registry.init_all(&sources()).await.unwrap(), 2);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_all_unreachable_is_fatal() {
        let connector = Arc::new(FakeConnector::new());
        for source in sources() {
            connector.source(&source.name).set_connect_fails(true);
        }
        let registry = registry(connector);

        let err = registry.init_all(&sources()).await.unwrap_err();
        assert!(matches!(err, Error::NoSources(_)));
        assert!(err.is_fatal());
        assert!(!registry.is_initialized());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_fatal() {
        let connector = Arc::new(FakeConnector::new());
        let registry = registry(connector.clone());
        let sources = vec![
            SourceConfig::new("orders", "fake://orders-a:5432/db"),
            SourceConfig::new("orders", "fake://orders-b:5432/db"),
        ];

        let err = registry.init_all(&sources).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateSource(name) if name == "orders"));
        assert_eq!(connector.source("orders").connects(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_host_is_fatal_regardless_of_name() {
        let registry = registry(Arc::new(FakeConnector::new()));
        let sources = vec![
            SourceConfig::new("primary", "fake://db1:5432/app?sslmode=require"),
            SourceConfig::new("replica", "fake://db1:5432/app"),
        ];

        let err = registry.init_all(&sources).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateHost(_)));
    }

    #[tokio::test]
    async fn test_disabled_sources_are_not_connected() {
        let connector = Arc::new(FakeConnector::new());
        let registry = registry(connector.clone());
        let sources = vec![
            SourceConfig::new("live", "fake://live/db"),
            SourceConfig::new("off", "fake://off/db").disabled(),
        ];

        assert_eq!(registry.init_all(&sources).await.unwrap(), 1);
        assert_eq!(connector.source("off").connects(), 0);
    }

    #[tokio::test]
    async fn test_get_by_priority_and_disable() {
        let registry = registry(Arc::new(FakeConnector::new()));
        registry.init_all(&sources()).await.unwrap();

        let band1 = registry.get_by_priority(1).unwrap();
        assert_eq!(band1.len(), 1);
        assert_eq!(band1[0].name(), "a-orders");
        assert_eq!(registry.get_by_priority(2).unwrap().len(), 1);

        registry.disable("a-orders").unwrap();
        assert!(registry.get_by_priority(1).unwrap().is_empty());
        assert_eq!(registry.get_all().unwrap().len(), 2);
        assert!(matches!(registry.disable("nope"), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_use_before_init_fails_loudly() {
        let registry = registry(Arc::new(FakeConnector::new()));
        assert!(matches!(registry.get_all(), Err(Error::NotInitialized(_))));
        assert!(matches!(registry.get_healthy(), Err(Error::NotInitialized(_))));
        assert!(matches!(registry.health_report(), Err(Error::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_health_report_counts() {
        let registry = registry(Arc::new(FakeConnector::new()));
        registry.init_all(&sources()).await.unwrap();

        let pool = registry.get_pool("b-billing").unwrap().unwrap();
        pool.health().record_failure("connection reset");

        let report = registry.health_report().unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.healthy, 2);
        assert_eq!(report.unhealthy, 1);

        let billing = report.sources.iter().find(|s| s.name == "b-billing").unwrap();
        assert_eq!(billing.status, HealthStatus::Unhealthy);
        assert_eq!(billing.last_error.as_deref(), Some("connection reset"));
        assert_eq!(billing.host, "billing:5432/db");
        assert!(billing.last_check_time.is_some());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_closes_handles() {
        let registry = registry(Arc::new(FakeConnector::new()));
        registry.init_all(&sources()).await.unwrap();
        let handle = registry.get_pool("a-orders").unwrap().unwrap().handle();

        let token = registry.shutdown_token();
        registry.close().await;
        registry.close().await;

        assert!(token.is_cancelled());
        assert!(handle.is_closed());
        assert!(!registry.is_initialized());
        assert!(registry.get_all().is_err());
    }

    #[tokio::test]
    async fn test_close_does_not_wait_on_stuck_handles() {
        let connector = Arc::new(FakeConnector::new());
        connector.source("b-billing").set_close_delay(Duration::from_secs(30));
        let registry = registry(connector);
        registry.init_all(&sources()).await.unwrap();

        let started = tokio::time::Instant::now();
        registry.close().await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!registry.is_initialized());
    }

    #[tokio::test]
    async fn test_reinitialize_after_close() {
        let registry = registry(Arc::new(FakeConnector::new()));
        registry.init_all(&sources()).await.unwrap();
        registry.close().await;

        assert_eq!(registry.init_all(&sources()[..1]).await.unwrap(), 1);
        assert!(!registry.shutdown_token().is_cancelled());
        assert_eq!(registry.get_all().unwrap().len(), 1);
    }
}
