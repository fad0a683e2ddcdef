// ABOUTME: Per-connection circuit breaker gating calls to a failing upstream
//
// Stops calling a dependency after repeated failures and probes recovery once
// the cool-down elapses. The breaker knows nothing about the wrapped operation:
// it records the outcome and hands the operation's own error back.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{ResilienceError, Result};

// === Circuit Breaker State ===

/// Circuit breaker state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    /// Normal operation, calls flow through
    #[default]
    Closed,
    /// Calls rejected until the recovery deadline
    Open,
    /// Probing whether the upstream recovered
    HalfOpen,
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    failure_count: u32,
    half_open_attempts: u32,
    next_attempt: Option<Instant>,
    config: CircuitBreakerConfig,
}

// === Circuit Breaker Implementation ===

/// Circuit breaker protecting one upstream connection
///
/// State transitions:
/// - Closed -> Open: `failure_threshold` consecutive failures
/// - Open -> `HalfOpen`: first call after `recovery_timeout` elapsed
/// - `HalfOpen` -> Closed: any success
/// - `HalfOpen` -> Open: `half_open_max_attempts` failed probes
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                failure_count: 0,
                half_open_attempts: 0,
                next_attempt: None,
                config,
            }),
        }
    }

    /// Run `operation` through the breaker
    ///
    /// Rejects with [`ResilienceError::CircuitOpen`] without invoking the
    /// operation while the circuit is open and the recovery deadline has not
    /// passed. Otherwise the outcome is recorded and returned unchanged.
    pub async fn execute<T, F, Fut>(&self, label: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit(label)?;

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(label);
                Err(err)
            }
        }
    }

    fn admit(&self, label: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != CircuitBreakerState::Open {
            return Ok(());
        }

        let now = Instant::now();
        if let Some(deadline) = inner.next_attempt {
            if now < deadline {
                return Err(ResilienceError::CircuitOpen {
                    label: label.to_string(),
                    retry_in: deadline - now,
                });
            }
        }

        inner.state = CircuitBreakerState::HalfOpen;
        inner.half_open_attempts = 0;
        debug!(label = %label, "Circuit breaker half-open, probing recovery");
        Ok(())
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.half_open_attempts = 0;
        if inner.state != CircuitBreakerState::Closed {
            info!(previous = %inner.state, "Circuit breaker closed");
            inner.state = CircuitBreakerState::Closed;
            inner.next_attempt = None;
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, label: &str) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);

        match inner.state {
            CircuitBreakerState::HalfOpen => {
                inner.half_open_attempts = inner.half_open_attempts.saturating_add(1);
                if inner.half_open_attempts >= inner.config.half_open_max_attempts {
                    Self::open(&mut inner, label);
                }
            }
            CircuitBreakerState::Closed => {
                if inner.failure_count >= inner.config.failure_threshold {
                    Self::open(&mut inner, label);
                }
            }
            CircuitBreakerState::Open => {
                // Late failure from a call admitted before the circuit opened
            }
        }
    }

    fn open(inner: &mut BreakerInner, label: &str) {
        inner.state = CircuitBreakerState::Open;
        inner.next_attempt = Some(Instant::now() + inner.config.recovery_timeout);
        warn!(
            label = %label,
            failures = inner.failure_count,
            recovery_ms = inner.config.recovery_timeout.as_millis(),
            "Circuit breaker opened"
        );
    }

    /// Current state (for monitoring)
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Whether calls are currently rejected outright
    pub fn is_open(&self) -> bool {
        self.retry_in().is_some()
    }

    /// Time left before a probe is admitted, if the circuit is open
    pub fn retry_in(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != CircuitBreakerState::Open {
            return None;
        }
        let remaining = inner
            .next_attempt
            .map_or(Duration::ZERO, |deadline| deadline.saturating_duration_since(Instant::now()));
        (!remaining.is_zero()).then_some(remaining)
    }

    /// Consecutive failures recorded since the last success
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Failed probes recorded in the current half-open window
    pub fn half_open_attempts(&self) -> u32 {
        self.inner.lock().half_open_attempts
    }

    /// Force the breaker closed (operator override)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitBreakerState::Closed;
        inner.failure_count = 0;
        inner.half_open_attempts = 0;
        inner.next_attempt = None;
    }

    /// Replace thresholds; the current state is kept
    pub fn update_config(&self, config: CircuitBreakerConfig) {
        self.inner.lock().config = config;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
