//! ABOUTME: Connection pool registry, per-source health state, and background health checker
//! ABOUTME: Owns every data source handle and keeps its health current

pub mod checker;
pub mod driver;
pub mod dsn;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use checker::{HealthChecker, HealthCheckerConfig};
pub use driver::{close_within, probe, Connector, Database, DbHandle, QueryRow, SqlValue, SqlxConnector};
pub use health::{HealthSnapshot, HealthState, HealthStatus, HealthTransition};
pub use metrics::HealthCheckMetrics;
pub use pool::ConnectionPool;
pub use registry::{HealthReport, PoolRegistry, SourceHealth};
