// ABOUTME: Connection lifecycle states and the statistics each connection keeps
// ABOUTME: Stats tracker applies EMA latency smoothing and bounded connect-time history

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::resilience::CircuitBreakerState;

/// Smoothing factor for the operation latency moving average
const LATENCY_ALPHA: f64 = 0.1;

/// Connect durations kept for the connection-time average
const CONNECT_HISTORY_LEN: usize = 10;

// === Connection State ===

/// Lifecycle state of one upstream connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Serving, but health checks failed; fallbacks are preferred
    Degraded,
    Reconnecting,
    /// Terminal until an explicit reconnect
    Failed,
    /// The circuit breaker is rejecting calls
    CircuitOpen,
}

impl ConnectionState {
    /// Whether calls go to the live client in this state
    #[must_use]
    pub const fn is_serving(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Degraded => "DEGRADED",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
        };
        f.write_str(name)
    }
}

/// Outcome of the most recent health check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

// === Statistics ===

/// Snapshot of a connection's counters and timings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub total_connections: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub total_operations: u64,
    pub failed_operations: u64,

    /// Operations in flight right now
    pub current_operations: usize,

    /// Failed connect attempts and health checks since the last success
    pub consecutive_failures: u32,

    pub health_check_status: HealthStatus,
    pub circuit_breaker_state: CircuitBreakerState,

    pub last_connection_attempt: Option<DateTime<Utc>>,
    pub last_successful_connection: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_operation: Option<DateTime<Utc>>,

    /// Mean of the recent successful connect durations
    pub average_connection_time_ms: f64,

    /// Exponential moving average of live operation latency
    pub average_response_time_ms: f64,
}

/// Mutable stats owned by one connection
#[derive(Debug, Default)]
pub(crate) struct StatsTracker {
    stats: ConnectionStats,
    connect_times: VecDeque<f64>,
    last_activity: Option<Instant>,
}

impl StatsTracker {
    pub(crate) fn snapshot(&self) -> ConnectionStats {
        self.stats.clone()
    }

    pub(crate) const fn current_operations(&self) -> usize {
        self.stats.current_operations
    }

    pub(crate) const fn consecutive_failures(&self) -> u32 {
        self.stats.consecutive_failures
    }

    /// Time since the last operation or successful connect
    pub(crate) fn idle_for(&self) -> Option<Duration> {
        self.last_activity.map(|at| at.elapsed())
    }

    pub(crate) fn connect_attempt(&mut self) {
        self.stats.total_connections += 1;
        self.stats.last_connection_attempt = Some(Utc::now());
    }

    pub(crate) fn connect_succeeded(&mut self, elapsed: Duration) {
        self.stats.successful_connections += 1;
        self.stats.consecutive_failures = 0;
        self.stats.last_successful_connection = Some(Utc::now());
        self.last_activity = Some(Instant::now());

        if self.connect_times.len() == CONNECT_HISTORY_LEN {
            self.connect_times.pop_front();
        }
        self.connect_times.push_back(elapsed.as_secs_f64() * 1_000.0);
        #[allow(clippy::cast_precision_loss)]
        let count = self.connect_times.len() as f64;
        self.stats.average_connection_time_ms = self.connect_times.iter().sum::<f64>() / count;
    }

    pub(crate) fn connect_failed(&mut self) {
        self.stats.failed_connections += 1;
        self.record_failure();
    }

    pub(crate) fn record_failure(&mut self) {
        self.stats.consecutive_failures = self.stats.consecutive_failures.saturating_add(1);
        self.stats.last_failure = Some(Utc::now());
    }

    pub(crate) fn health_passed(&mut self) {
        self.stats.health_check_status = HealthStatus::Healthy;
        self.stats.consecutive_failures = 0;
    }

    /// Returns the consecutive failure count after this failure
    pub(crate) fn health_failed(&mut self) -> u32 {
        self.stats.health_check_status = HealthStatus::Unhealthy;
        self.record_failure();
        self.stats.consecutive_failures
    }

    pub(crate) fn operation_started(&mut self) {
        self.stats.current_operations += 1;
        self.stats.total_operations += 1;
        self.stats.last_operation = Some(Utc::now());
        self.last_activity = Some(Instant::now());
    }

    pub(crate) fn operation_finished(&mut self) {
        self.stats.current_operations = self.stats.current_operations.saturating_sub(1);
    }

    pub(crate) fn operation_failed(&mut self) {
        self.stats.failed_operations += 1;
    }

    pub(crate) fn record_latency(&mut self, elapsed: Duration) {
        let sample = elapsed.as_secs_f64() * 1_000.0;
        let avg = &mut self.stats.average_response_time_ms;
        *avg = if *avg == 0.0 {
            sample
        } else {
            LATENCY_ALPHA.mul_add(sample, (1.0 - LATENCY_ALPHA) * *avg)
        };
    }

    pub(crate) fn set_breaker_state(&mut self, state: CircuitBreakerState) {
        self.stats.circuit_breaker_state = state;
    }
}
