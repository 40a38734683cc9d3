//! ABOUTME: Per-source health state machine guarded by the source's own lock
//! ABOUTME: Every read and write goes through synchronized accessors

use chrono::{DateTime, Utc};
use dx_core::utc_now;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// Health classification of one data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Not probed yet
    Unknown,
    Healthy,
    Unhealthy,
    /// Switched off by the operator; probes leave it alone
    Disabled,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Disabled => "disabled",
        }
    }

    /// Gauge value: 1 for healthy, 0 for everything else
    pub fn to_metric_value(self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            _ => 0.0,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of a source's health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub last_check_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Status change produced by recording a probe result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    /// First probe result for a source that was never checked
    Initial(HealthStatus),
    /// healthy -> unhealthy
    Failed,
    /// unhealthy -> healthy
    Recovered,
}

/// Mutable health of one source
///
/// Transitions are returned rather than logged here so callers log once per
/// change and not on every tick.
#[derive(Debug)]
pub struct HealthState {
    inner: Mutex<HealthSnapshot>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HealthSnapshot {
                status: HealthStatus::Unknown,
                last_check_time: None,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HealthSnapshot> {
        // A panic while holding the lock cannot leave the snapshot half-written
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.lock().clone()
    }

    pub fn status(&self) -> HealthStatus {
        self.lock().status
    }

    pub fn is_healthy(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    pub fn is_disabled(&self) -> bool {
        self.status() == HealthStatus::Disabled
    }

    /// Record a successful probe
    pub fn record_success(&self) -> Option<HealthTransition> {
        self.record(HealthStatus::Healthy, None)
    }

    /// Record a failed probe along with its error
    pub fn record_failure(&self, error: impl Into<String>) -> Option<HealthTransition> {
        self.record(HealthStatus::Unhealthy, Some(error.into()))
    }

    /// Move to the terminal disabled state
    pub fn mark_disabled(&self) {
        let mut inner = self.lock();
        inner.status = HealthStatus::Disabled;
        inner.last_check_time = Some(utc_now());
    }

    fn record(&self, next: HealthStatus, error: Option<String>) -> Option<HealthTransition> {
        let mut inner = self.lock();
        let previous = inner.status;

        if previous == HealthStatus::Disabled {
            return None;
        }

        inner.status = next;
        inner.last_check_time = Some(utc_now());
        inner.last_error = error;

        match (previous, next) {
            (HealthStatus::Unknown, status) => Some(HealthTransition::Initial(status)),
            (HealthStatus::Healthy, HealthStatus::Unhealthy) => Some(HealthTransition::Failed),
            (HealthStatus::Unhealthy, HealthStatus::Healthy) => Some(HealthTransition::Recovered),
            _ => None,
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}
