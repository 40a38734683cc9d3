// ABOUTME: Utilities for working with times and timestamps.
// ABOUTME: Provides RFC3339 formatting and monotonic timers.
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::{Duration, Instant};

/// Get the current wall-clock time in UTC
///
/// # Examples
///
/// ```
/// use dx_core::utc_now;
/// let now = utc_now();
/// assert!(now.timestamp() > 0);
/// ```
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a UTC timestamp to an RFC3339 string
///
/// # Examples
///
/// ```
/// use dx_core::to_rfc3339;
/// use chrono::{TimeZone, Utc};
///
/// let time = Utc.timestamp_opt(1_609_459_200, 0).unwrap(); // 2021-01-01
/// assert_eq!(to_rfc3339(time), "2021-01-01T00:00:00Z");
/// ```
pub fn to_rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Monotonic duration measurer used for scrape and probe latencies
pub struct MonotonicTimer {
    start: Instant,
}

impl MonotonicTimer {
    /// Create a new timer starting now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time since creation
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time as fractional seconds, the unit Prometheus expects
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

impl Default for MonotonicTimer {
    fn default() -> Self {
        Self::new()
    }
}
