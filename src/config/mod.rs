// ABOUTME: Configuration for resilient connections and the pool manager
//
// Defines every tunable parameter of the resilience layer:
// - Retry/backoff, circuit breaker, health check, connection limits, degraded mode
// - Pool routing, request queue, alert thresholds and metrics cadence
// - Per-server launch settings and logging
//
// All sections default independently and can be replaced at runtime through the
// `*Update` types (shallow merge: a present section replaces the whole section).

mod loader;
mod validation;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use loader::{load_from_path, load_from_str, ConfigError, ConfigFormat};
pub use validation::{validate_pool, validate_resilience, validate_settings, ValidationError};

use crate::connection::{FallbackStrategy, HealthCheckStrategy};
use crate::pool::{FailoverStrategy, LoadBalancingStrategy};

// === Connection-level resilience ===

/// Complete resilience configuration for one connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Connect retry policy
    pub retry: RetryConfig,

    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,

    /// Periodic health checking
    pub health_check: HealthCheckConfig,

    /// Connection limits and timeouts
    pub connection: ConnectionConfig,

    /// Fallback behavior when the server misbehaves
    pub degraded_mode: DegradedModeConfig,
}

impl ResilienceConfig {
    /// Apply a partial update, replacing every section it carries
    pub fn merge(&mut self, update: ResilienceConfigUpdate) {
        if let Some(retry) = update.retry {
            self.retry = retry;
        }
        if let Some(circuit_breaker) = update.circuit_breaker {
            self.circuit_breaker = circuit_breaker;
        }
        if let Some(health_check) = update.health_check {
            self.health_check = health_check;
        }
        if let Some(connection) = update.connection {
            self.connection = connection;
        }
        if let Some(degraded_mode) = update.degraded_mode {
            self.degraded_mode = degraded_mode;
        }
    }

    /// Return a copy with `update` merged on top
    #[must_use]
    pub fn merged(&self, update: ResilienceConfigUpdate) -> Self {
        let mut config = self.clone();
        config.merge(update);
        config
    }
}

/// Partial resilience configuration; `None` keeps the current section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_mode: Option<DegradedModeConfig>,
}

/// Connect retry policy (exponential backoff with jitter)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum connect attempts before the connection is marked FAILED
    pub max_retry_attempts: u32,

    /// Delay before the second attempt; doubles every attempt
    #[serde(rename = "base_retry_delay_ms", with = "duration_ms")]
    pub base_retry_delay: Duration,

    /// Cap applied to the exponential delay (before jitter)
    #[serde(rename = "max_retry_delay_ms", with = "duration_ms")]
    pub max_retry_delay: Duration,

    /// Random extra delay, as a fraction of the capped delay
    pub retry_jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            base_retry_delay: Duration::from_millis(1_000),
            max_retry_delay: Duration::from_millis(30_000),
            retry_jitter_factor: 0.1,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit
    pub failure_threshold: u32,

    /// How long an open circuit rejects calls before probing
    #[serde(rename = "recovery_timeout_ms", with = "duration_ms")]
    pub recovery_timeout: Duration,

    /// Failed probes tolerated in half-open before reopening
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(60_000),
            half_open_max_attempts: 3,
        }
    }
}

/// Periodic health checking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Interval between probes while CONNECTED
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,

    /// Bound on a single probe
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,

    /// Which probe to run
    pub strategy: HealthCheckStrategy,

    /// Failed probes in a row before degrading or reconnecting
    pub consecutive_failure_threshold: u32,

    /// Interval between probes while DEGRADED or CIRCUIT_OPEN
    #[serde(rename = "recovery_check_interval_ms", with = "duration_ms")]
    pub recovery_check_interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(30_000),
            timeout: Duration::from_millis(5_000),
            strategy: HealthCheckStrategy::BasicPing,
            consecutive_failure_threshold: 3,
            recovery_check_interval: Duration::from_millis(10_000),
        }
    }
}

/// Connection limits and timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on a single client connect call
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Inactivity after which the connection reports itself idle
    #[serde(rename = "idle_timeout_ms", with = "duration_ms")]
    pub idle_timeout: Duration,

    /// Operations allowed in flight on this connection
    pub max_concurrent_operations: usize,

    /// How long disconnect waits for in-flight operations
    #[serde(rename = "graceful_shutdown_timeout_ms", with = "duration_ms")]
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(10_000),
            idle_timeout: Duration::from_millis(300_000),
            max_concurrent_operations: 10,
            graceful_shutdown_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Degraded-mode fallback behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradedModeConfig {
    /// Master switch for caching and fallbacks
    pub enabled: bool,

    /// How long cached responses stay usable
    #[serde(rename = "cache_responses_ms", with = "duration_ms")]
    pub cache_responses: Duration,

    /// Strategies tried in order until one yields a response
    pub fallback_strategies: Vec<FallbackStrategy>,
}

impl Default for DegradedModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_responses: Duration::from_millis(300_000),
            fallback_strategies: vec![
                FallbackStrategy::CachedResponse,
                FallbackStrategy::DefaultResponse,
                FallbackStrategy::ErrorResponse,
            ],
        }
    }
}

// === Pool-level configuration ===

/// Configuration for the pool manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of registered servers
    pub max_total_connections: usize,

    /// Requests executing at once across the pool
    pub max_concurrent_requests: usize,

    /// Requests allowed to wait for a free slot
    pub max_queue_size: usize,

    /// Bound on queue wait plus execution
    #[serde(rename = "request_timeout_ms", with = "duration_ms")]
    pub request_timeout: Duration,

    /// How a connection is picked when no preferred server applies
    pub load_balancing: LoadBalancingStrategy,

    /// What happens when the picked connection fails
    pub failover: FailoverStrategy,

    /// Selection weight of a DEGRADED server relative to a healthy one (0..=1)
    pub health_threshold: f64,

    /// Metrics collection and alert evaluation cadence
    #[serde(rename = "metrics_interval_ms", with = "duration_ms")]
    pub metrics_interval: Duration,

    /// Alerts retained in memory (oldest trimmed first)
    pub max_alerts: usize,

    /// Keep a server registered when its initial connect fails
    pub fallback_to_legacy: bool,

    /// Thresholds that raise alerts
    pub alert_thresholds: AlertThresholds,

    /// Default resilience settings for every connection
    pub resilience: ResilienceConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total_connections: 50,
            max_concurrent_requests: 100,
            max_queue_size: 1_000,
            request_timeout: Duration::from_millis(30_000),
            load_balancing: LoadBalancingStrategy::RoundRobin,
            failover: FailoverStrategy::CircuitBreaker,
            health_threshold: 0.5,
            metrics_interval: Duration::from_millis(30_000),
            max_alerts: 1_000,
            fallback_to_legacy: true,
            alert_thresholds: AlertThresholds::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Apply a partial update, replacing every field it carries
    pub fn merge(&mut self, update: PoolConfigUpdate) {
        if let Some(v) = update.max_total_connections {
            self.max_total_connections = v;
        }
        if let Some(v) = update.max_concurrent_requests {
            self.max_concurrent_requests = v;
        }
        if let Some(v) = update.max_queue_size {
            self.max_queue_size = v;
        }
        if let Some(v) = update.request_timeout {
            self.request_timeout = v;
        }
        if let Some(v) = update.load_balancing {
            self.load_balancing = v;
        }
        if let Some(v) = update.failover {
            self.failover = v;
        }
        if let Some(v) = update.health_threshold {
            self.health_threshold = v;
        }
        if let Some(v) = update.metrics_interval {
            self.metrics_interval = v;
        }
        if let Some(v) = update.max_alerts {
            self.max_alerts = v;
        }
        if let Some(v) = update.fallback_to_legacy {
            self.fallback_to_legacy = v;
        }
        if let Some(v) = update.alert_thresholds {
            self.alert_thresholds = v;
        }
        if let Some(v) = update.resilience {
            self.resilience.merge(v);
        }
    }
}

/// Partial pool configuration; `None` keeps the current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfigUpdate {
    pub max_total_connections: Option<usize>,
    pub max_concurrent_requests: Option<usize>,
    pub max_queue_size: Option<usize>,
    #[serde(rename = "request_timeout_ms", with = "opt_duration_ms")]
    pub request_timeout: Option<Duration>,
    pub load_balancing: Option<LoadBalancingStrategy>,
    pub failover: Option<FailoverStrategy>,
    pub health_threshold: Option<f64>,
    #[serde(rename = "metrics_interval_ms", with = "opt_duration_ms")]
    pub metrics_interval: Option<Duration>,
    pub max_alerts: Option<usize>,
    pub fallback_to_legacy: Option<bool>,
    pub alert_thresholds: Option<AlertThresholds>,
    pub resilience: Option<ResilienceConfigUpdate>,
}

/// Thresholds evaluated on every metrics collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    /// Per-server error rate over one metrics interval
    pub error_rate_percent: f64,

    /// Pool-wide average response time
    pub response_time_ms: f64,

    /// Share of registered servers that are not healthy
    pub unhealthy_server_percent: f64,

    /// Consecutive failures on a single server
    pub consecutive_failures_threshold: u32,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate_percent: 10.0,
            response_time_ms: 5_000.0,
            unhealthy_server_percent: 50.0,
            consecutive_failures_threshold: 5,
        }
    }
}

// === Servers, logging and the settings file ===

/// Launch settings for one upstream server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Unique server name
    pub name: String,

    /// Command that starts the server process
    pub command: String,

    /// Command arguments
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Per-server overrides merged over the pool defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resilience: Option<ResilienceConfigUpdate>,
}

impl ServerConfig {
    /// Minimal server definition
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON lines
    #[default]
    Json,
    /// Human-readable lines
    Pretty,
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Append logs to this file instead of stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "mcp_resilience=info".to_string(),
            format: LogFormat::Json,
            file: None,
        }
    }
}

/// Everything a settings file may contain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingConfig,
    pub pool: PoolConfig,
    pub servers: Vec<ServerConfig>,
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde helper for optional Duration as milliseconds
mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
