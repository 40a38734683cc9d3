//! ABOUTME: One managed data source: its handle, its configuration, and its health
//! ABOUTME: The handle can be swapped in place on reconnect without changing identity

use dx_config::SourceConfig;
use std::sync::{Arc, RwLock};

use crate::driver::DbHandle;
use crate::health::HealthState;

/// Managed handle plus health for a single data source
#[derive(Debug)]
pub struct ConnectionPool {
    name: String,
    host: String,
    config: Arc<SourceConfig>,
    handle: RwLock<DbHandle>,
    health: HealthState,
}

impl ConnectionPool {
    pub fn new(config: Arc<SourceConfig>, host: String, handle: DbHandle) -> Self {
        Self {
            name: config.name.clone(),
            host,
            config,
            handle: RwLock::new(handle),
            health: HealthState::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized host, see [`crate::dsn::normalized_host`]
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn config(&self) -> &Arc<SourceConfig> {
        &self.config
    }

    pub fn priority(&self) -> u8 {
        self.config.priority
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    /// Enabled in configuration and not disabled at runtime
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.health.is_disabled()
    }

    /// Current handle; the lock is released before the caller uses it
    pub fn handle(&self) -> DbHandle {
        match self.handle.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install a new handle and return the previous one
    pub fn replace_handle(&self, handle: DbHandle) -> DbHandle {
        let mut guard = match self.handle.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *guard, handle)
    }
}
