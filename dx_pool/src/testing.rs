//! ABOUTME: In-memory fake driver with scriptable failures and latency
//! ABOUTME: Lets registry, health checker and collector tests run without a server

use async_trait::async_trait;
use dx_config::SourceConfig;
use dx_core::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::driver::{Connector, Database, DbHandle, QueryRow};

/// Behaviour shared by every handle the fake opens for one source name
#[derive(Debug, Default)]
pub struct FakeSource {
    connect_fails: AtomicBool,
    ping_fails: AtomicBool,
    query_fails: AtomicBool,
    ping_delay_ms: AtomicU64,
    query_delay_ms: AtomicU64,
    close_delay_ms: AtomicU64,
    connects: AtomicUsize,
    pings: AtomicUsize,
    queries: AtomicUsize,
    rows: Mutex<HashMap<String, Vec<QueryRow>>>,
    default_rows: Mutex<Vec<QueryRow>>,
}

impl FakeSource {
    pub fn set_connect_fails(&self, fails: bool) {
        self.connect_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.ping_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_query_fails(&self, fails: bool) {
        self.query_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        self.ping_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        self.query_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Closing a handle marks it closed at once, then waits this long
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Rows returned for exactly this SQL text
    pub fn set_rows(&self, sql: &str, rows: Vec<QueryRow>) {
        let mut map = self.rows.lock().unwrap_or_else(|p| p.into_inner());
        map.insert(sql.to_string(), rows);
    }

    /// Rows returned for any SQL without a specific entry
    pub fn set_default_rows(&self, rows: Vec<QueryRow>) {
        *self.default_rows.lock().unwrap_or_else(|p| p.into_inner()) = rows;
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn rows_for(&self, sql: &str) -> Vec<QueryRow> {
        let map = self.rows.lock().unwrap_or_else(|p| p.into_inner());
        match map.get(sql) {
            Some(rows) => rows.clone(),
            None => self
                .default_rows
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .clone(),
        }
    }
}

/// Connector that hands out [`FakeDatabase`] handles keyed by source name
#[derive(Debug, Default)]
pub struct FakeConnector {
    sources: Mutex<HashMap<String, Arc<FakeSource>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behaviour for `name`, created on first use
    pub fn source(&self, name: &str) -> Arc<FakeSource> {
        let mut sources = self.sources.lock().unwrap_or_else(|p| p.into_inner());
        sources
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FakeSource::default()))
            .clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, source: &SourceConfig) -> Result<DbHandle> {
        let state = self.source(&source.name);
        state.connects.fetch_add(1, Ordering::SeqCst);

        if state.connect_fails.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!(
                "{}: connection refused",
                source.name
            )));
        }

        Ok(Arc::new(FakeDatabase {
            name: source.name.clone(),
            state,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Handle produced by [`FakeConnector`]
#[derive(Debug)]
pub struct FakeDatabase {
    name: String,
    state: Arc<FakeSource>,
    closed: AtomicBool,
}

impl FakeDatabase {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("{}: handle is closed", self.name)));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn ping(&self) -> Result<()> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.ping_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_open()?;
        if self.state.ping_fails.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!("{}: server went away", self.name)));
        }
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<Vec<QueryRow>> {
        self.state.queries.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.query_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_open()?;
        if self.state.query_fails.load(Ordering::SeqCst) {
            return Err(Error::Query(format!("{}: relation does not exist", self.name)));
        }
        Ok(self.state.rows_for(sql))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let delay = self.state.close_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
