// ABOUTME: Semantic validation of resilience, pool and settings configuration
//
// Serde handles syntax; these checks catch values that parse but cannot work
// (zero thresholds, inverted delay bounds, out-of-range ratios). Every problem is
// reported, not just the first.

use std::collections::HashSet;
use std::fmt;

use super::{PoolConfig, ResilienceConfig, Settings};

/// One invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a resilience configuration
pub fn validate_resilience(config: &ResilienceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_resilience(config, "resilience", &mut errors);
    finish(errors)
}

/// Validate a pool configuration (including its default resilience settings)
pub fn validate_pool(config: &PoolConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_pool(config, &mut errors);
    finish(errors)
}

/// Validate a whole settings file
pub fn validate_settings(settings: &Settings) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    check_pool(&settings.pool, &mut errors);

    let mut seen = HashSet::new();
    for (i, server) in settings.servers.iter().enumerate() {
        let field = format!("servers[{i}]");
        if server.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
        } else if !seen.insert(server.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{field}.name"),
                format!("duplicate server name '{}'", server.name),
            ));
        }

        if let Some(overrides) = &server.resilience {
            let effective = settings.pool.resilience.merged(overrides.clone());
            check_resilience(&effective, &format!("{field}.resilience"), &mut errors);
        }
    }

    if settings.servers.len() > settings.pool.max_total_connections {
        errors.push(ValidationError::new(
            "servers",
            format!(
                "{} servers exceed pool.max_total_connections ({})",
                settings.servers.len(),
                settings.pool.max_total_connections
            ),
        ));
    }

    finish(errors)
}

fn finish(errors: Vec<ValidationError>) -> Result<(), Vec<ValidationError>> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_pool(config: &PoolConfig, errors: &mut Vec<ValidationError>) {
    if config.max_total_connections == 0 {
        errors.push(ValidationError::new("pool.max_total_connections", "must be greater than 0"));
    }
    if config.max_concurrent_requests == 0 {
        errors.push(ValidationError::new("pool.max_concurrent_requests", "must be greater than 0"));
    }
    if config.request_timeout.is_zero() {
        errors.push(ValidationError::new("pool.request_timeout_ms", "must be greater than 0"));
    }
    if config.metrics_interval.is_zero() {
        errors.push(ValidationError::new("pool.metrics_interval_ms", "must be greater than 0"));
    }
    if !(0.0..=1.0).contains(&config.health_threshold) {
        errors.push(ValidationError::new("pool.health_threshold", "must be between 0 and 1"));
    }
    if config.max_alerts == 0 {
        errors.push(ValidationError::new("pool.max_alerts", "must be greater than 0"));
    }
    check_resilience(&config.resilience, "pool.resilience", errors);
}

fn check_resilience(config: &ResilienceConfig, prefix: &str, errors: &mut Vec<ValidationError>) {
    let mut push = |field: &str, message: &str| {
        errors.push(ValidationError::new(format!("{prefix}.{field}"), message));
    };

    let retry = &config.retry;
    if retry.max_retry_attempts == 0 {
        push("retry.max_retry_attempts", "must be at least 1");
    }
    if retry.base_retry_delay > retry.max_retry_delay {
        push("retry.base_retry_delay_ms", "must not exceed max_retry_delay_ms");
    }
    if !(0.0..=1.0).contains(&retry.retry_jitter_factor) {
        push("retry.retry_jitter_factor", "must be between 0 and 1");
    }

    let breaker = &config.circuit_breaker;
    if breaker.failure_threshold == 0 {
        push("circuit_breaker.failure_threshold", "must be at least 1");
    }
    if breaker.half_open_max_attempts == 0 {
        push("circuit_breaker.half_open_max_attempts", "must be at least 1");
    }

    let health = &config.health_check;
    if health.interval.is_zero() {
        push("health_check.interval_ms", "must be greater than 0");
    }
    if health.recovery_check_interval.is_zero() {
        push("health_check.recovery_check_interval_ms", "must be greater than 0");
    }
    if health.timeout >= health.interval {
        push("health_check.timeout_ms", "must be shorter than interval_ms");
    }
    if health.consecutive_failure_threshold == 0 {
        push("health_check.consecutive_failure_threshold", "must be at least 1");
    }

    if config.connection.max_concurrent_operations == 0 {
        push("connection.max_concurrent_operations", "must be greater than 0");
    }
    if config.connection.connect_timeout.is_zero() {
        push("connection.connect_timeout_ms", "must be greater than 0");
    }

    let degraded = &config.degraded_mode;
    if degraded.enabled && degraded.fallback_strategies.is_empty() {
        push("degraded_mode.fallback_strategies", "must not be empty when degraded mode is enabled");
    }
}
