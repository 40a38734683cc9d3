//! ABOUTME: Background health checker that pings every enabled source on an interval
//! ABOUTME: Failed sources are reconnected and their handle swapped in place

use futures_util::future::join_all;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::driver::{close_within, probe, DbHandle};
use crate::health::HealthTransition;
use crate::metrics::HealthCheckMetrics;
use crate::pool::ConnectionPool;
use crate::registry::PoolRegistry;

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

/// Periodic prober for the pools of a [`PoolRegistry`]
#[derive(Debug)]
pub struct HealthChecker {
    config: HealthCheckerConfig,
    registry: Arc<PoolRegistry>,
    metrics: Arc<HealthCheckMetrics>,
    cancel: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckerConfig,
        registry: Arc<PoolRegistry>,
        metrics: Arc<HealthCheckMetrics>,
    ) -> Self {
        let cancel = registry.shutdown_token().child_token();
        Self {
            config,
            registry,
            metrics,
            cancel: Mutex::new(cancel),
            handle: Mutex::new(None),
        }
    }

    pub fn metrics(&self) -> &Arc<HealthCheckMetrics> {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Launch the check loop; calling it again while running does nothing
    ///
    /// The loop is tied to the registry's current lifecycle, so after the
    /// registry is re-initialized `start` picks up the new pools.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let lifecycle = self.registry.shutdown_token();
        if lifecycle.is_cancelled() || !self.registry.is_initialized() {
            warn!("Health checker not started: pool registry is not initialized");
            return;
        }

        let cancel = lifecycle.child_token();
        *self.cancel.lock().unwrap_or_else(|p| p.into_inner()) = cancel.clone();

        let checker = Arc::clone(self);
        *slot = Some(self.registry.spawn_background(async move {
            checker.run(cancel).await;
        }));

        info!(
            interval = ?self.config.interval,
            ping_timeout = ?self.config.ping_timeout,
            "Health checker started"
        );
    }

    async fn run(&self, cancel: CancellationToken) {
        self.check_now().await;

        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Health checker loop exiting");
                    break;
                }
                _ = ticker.tick() => {
                    self.check_now().await;
                }
            }
        }
    }

    /// Stop the loop and wait for it to exit; later calls are no-ops
    pub async fn stop(&self) {
        self.cancel_token().cancel();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Health checker task ended abnormally");
            }
            info!("Health checker stopped");
        }
    }

    /// Probe every enabled source once, concurrently
    #[instrument(skip(self))]
    pub async fn check_now(&self) {
        let pools = match self.registry.get_all() {
            Ok(pools) => pools,
            Err(e) => {
                debug!(error = %e, "Skipping health check");
                return;
            }
        };

        join_all(pools.iter().map(|pool| self.check_pool(pool))).await;

        let healthy = pools.iter().filter(|p| p.health().is_healthy()).count();
        self.metrics.set_healthy_sources(healthy as i64);
    }

    async fn check_pool(&self, pool: &Arc<ConnectionPool>) {
        self.metrics.record_probe();
        let handle = pool.handle();

        match probe(&handle, self.config.ping_timeout).await {
            Ok(()) => {
                let transition = pool.health().record_success();
                self.log_transition(pool, transition, None);
            }
            Err(e) => {
                self.metrics.record_probe_failure();
                let transition = pool.health().record_failure(e.to_string());
                self.log_transition(pool, transition, Some(&e.to_string()));
                self.reconnect(pool).await;
            }
        }
    }

    async fn reconnect(&self, pool: &Arc<ConnectionPool>) {
        if self.registry.shutdown_token().is_cancelled() {
            return;
        }
        self.metrics.record_reconnect();

        self.retire(pool, pool.handle());

        let fresh = match self.registry.connector().connect(pool.config()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.metrics.record_reconnect_failure();
                pool.health().record_failure(e.to_string());
                debug!(datasource = %pool.name(), error = %e, "Reconnect failed");
                return;
            }
        };

        match probe(&fresh, self.config.ping_timeout).await {
            Ok(()) => {
                pool.replace_handle(fresh);
                let transition = pool.health().record_success();
                self.log_transition(pool, transition, None);
            }
            Err(e) => {
                self.retire(pool, fresh);
                self.metrics.record_reconnect_failure();
                pool.health().record_failure(e.to_string());
                debug!(datasource = %pool.name(), error = %e, "Reconnected source still unreachable");
            }
        }
    }

    /// Close a handle in the background with a bounded wait
    fn retire(&self, pool: &ConnectionPool, handle: DbHandle) {
        let timeout = self.config.ping_timeout;
        let datasource = pool.name().to_string();
        self.registry.spawn_background(async move {
            if !close_within(&handle, timeout).await {
                warn!(datasource = %datasource, "Closing the old handle timed out, abandoning it");
            }
        });
    }

    fn log_transition(
        &self,
        pool: &ConnectionPool,
        transition: Option<HealthTransition>,
        error: Option<&str>,
    ) {
        match transition {
            Some(HealthTransition::Failed) => warn!(
                datasource = %pool.name(),
                error = error.unwrap_or_default(),
                "Data source became unhealthy"
            ),
            Some(HealthTransition::Recovered) => {
                info!(datasource = %pool.name(), "Data source recovered")
            }
            Some(HealthTransition::Initial(status)) => {
                debug!(datasource = %pool.name(), %status, "First health result")
            }
            None => {}
        }
    }
}
