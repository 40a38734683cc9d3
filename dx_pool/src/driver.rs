//! ABOUTME: Database driver seam used by the registry, the health checker and collectors
//! ABOUTME: sqlx `Any` implementation plus the row type collectors scan into

use async_trait::async_trait;
use dx_config::SourceConfig;
use dx_core::{Error, Result};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Connection, Row};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::dsn;

/// Shared handle to one data source
pub type DbHandle = Arc<dyn Database>;

/// Operations the orchestration layer needs from a live database handle
#[async_trait]
pub trait Database: Send + Sync + fmt::Debug {
    /// Round trip to the server without running a user query
    async fn ping(&self) -> Result<()>;

    /// Run a query and return every row
    async fn query(&self, sql: &str) -> Result<Vec<QueryRow>>;

    /// Close the handle; later calls fail with a connection error
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens handles for data sources
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Build a handle with the source's pool limits applied
    ///
    /// The handle is not required to be connected yet; callers confirm
    /// connectivity with [`probe`].
    async fn connect(&self, source: &SourceConfig) -> Result<DbHandle>;
}

/// Ping a handle with an upper bound on how long it may take
pub async fn probe(handle: &DbHandle, timeout: Duration) -> Result<()> {
    match tokio::time::timeout(timeout, handle.ping()).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("ping did not answer within {:?}", timeout))),
    }
}

/// Close a handle, giving up after `timeout`
///
/// A pool closes only once its checked-out connections come back, which a
/// connection stuck on a dead socket may never do. Returns false if the
/// close was abandoned.
pub async fn close_within(handle: &DbHandle, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, handle.close()).await.is_ok()
}

/// A single scanned column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl SqlValue {
    /// Numeric view of the value; text is parsed, NULL has none
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Null => None,
            SqlValue::Int(v) => Some(*v as f64),
            SqlValue::Float(v) => Some(*v),
            SqlValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            SqlValue::Text(v) => v.trim().parse().ok(),
        }
    }

    /// String view of the value, used for label values
    pub fn as_label(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Bool(v) => v.to_string(),
            SqlValue::Text(v) => v.clone(),
        }
    }
}

/// One result row with its column names
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRow {
    columns: Vec<(String, SqlValue)>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: SqlValue) -> Self {
        self.columns.push((column.into(), value));
        self
    }

    /// Look up a column ignoring ASCII case
    ///
    /// Some servers fold unquoted identifiers to upper case, others to lower
    /// case, so definitions match columns case-insensitively.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Connector backed by sqlx's runtime-selected driver
#[derive(Debug, Clone)]
pub struct SqlxConnector {
    acquire_timeout: Duration,
}

impl SqlxConnector {
    pub fn new(acquire_timeout: Duration) -> Self {
        sqlx::any::install_default_drivers();
        Self { acquire_timeout }
    }
}

#[async_trait]
impl Connector for SqlxConnector {
    async fn connect(&self, source: &SourceConfig) -> Result<DbHandle> {
        let url = dsn::connection_string(source)?;

        let pool = AnyPoolOptions::new()
            .max_connections(source.max_open_connections)
            .min_connections(source.min_idle_connections)
            .max_lifetime(source.conn_max_lifetime)
            .idle_timeout(source.idle_timeout)
            .acquire_timeout(self.acquire_timeout)
            .connect_lazy(&url)
            .map_err(Error::from_sqlx)?;

        debug!(
            datasource = %source.name,
            max_connections = source.max_open_connections,
            "Created connection pool"
        );

        Ok(Arc::new(SqlxDatabase { pool }))
    }
}

/// [`Database`] over an sqlx pool
#[derive(Debug, Clone)]
pub struct SqlxDatabase {
    pool: AnyPool,
}

impl SqlxDatabase {
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}

#[async_trait]
impl Database for SqlxDatabase {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(Error::from_sqlx)?;
        conn.ping().await.map_err(Error::from_sqlx)
    }

    async fn query(&self, sql: &str) -> Result<Vec<QueryRow>> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from_sqlx)?;
        Ok(rows.iter().map(scan_row).collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

fn scan_row(row: &AnyRow) -> QueryRow {
    let columns = row
        .columns()
        .iter()
        .map(|column| {
            let index = column.ordinal();
            (column.name().to_string(), scan_value(row, index))
        })
        .collect();
    QueryRow { columns }
}

// The Any driver only exposes a handful of wire types; try them widest first.
fn scan_value(row: &AnyRow, index: usize) -> SqlValue {
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(SqlValue::Int).unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v.map(SqlValue::Float).unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map(SqlValue::Bool).unwrap_or(SqlValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(SqlValue::Text).unwrap_or(SqlValue::Null);
    }
    SqlValue::Null
}
