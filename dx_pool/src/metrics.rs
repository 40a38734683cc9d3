//! ABOUTME: Health checker metrics
//! ABOUTME: Provides Prometheus counters for probes and reconnects

use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;

/// Metrics for background health checking
#[derive(Debug, Clone, Default)]
pub struct HealthCheckMetrics {
    /// Total number of pings issued
    pub probes: Counter,
    /// Pings that failed or timed out
    pub probe_failures: Counter,
    /// Reconnect attempts after a failed ping
    pub reconnects: Counter,
    /// Reconnect attempts that did not produce a working handle
    pub reconnect_failures: Counter,
    /// Sources healthy after the latest pass
    pub healthy_sources: Gauge,
}

impl HealthCheckMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `<prefix>_health_check_*`
    pub fn register(&self, registry: &mut Registry, prefix: &str) {
        registry.register(
            format!("{}_health_check_probes", prefix),
            "Total number of data source pings",
            self.probes.clone(),
        );
        registry.register(
            format!("{}_health_check_probe_failures", prefix),
            "Total number of failed data source pings",
            self.probe_failures.clone(),
        );
        registry.register(
            format!("{}_health_check_reconnects", prefix),
            "Total number of reconnect attempts",
            self.reconnects.clone(),
        );
        registry.register(
            format!("{}_health_check_reconnect_failures", prefix),
            "Total number of failed reconnect attempts",
            self.reconnect_failures.clone(),
        );
        registry.register(
            format!("{}_health_check_healthy_sources", prefix),
            "Data sources healthy after the latest health check",
            self.healthy_sources.clone(),
        );
    }

    pub fn record_probe(&self) {
        self.probes.inc();
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures.inc();
    }

    pub fn record_reconnect(&self) {
        self.reconnects.inc();
    }

    pub fn record_reconnect_failure(&self) {
        self.reconnect_failures.inc();
    }

    pub fn set_healthy_sources(&self, count: i64) {
        self.healthy_sources.set(count);
    }
}
