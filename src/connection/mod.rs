// ABOUTME: Resilient connection to one upstream MCP server
// ABOUTME: Connect retries, circuit breaking, health checks, caching and degraded-mode fallbacks

//! Resilient connection management for a single upstream server.
//!
//! A [`ResilientConnection`] owns one [`McpClient`] and everything needed to
//! keep it usable:
//! - Connect with exponential backoff and a per-attempt timeout
//! - A circuit breaker around every live call and connect attempt
//! - A background health check timer (one of five strategies)
//! - A response cache and a fallback chain for degraded operation
//!
//! # State machine
//!
//! ```text
//!  DISCONNECTED ──connect──▶ CONNECTING ──ok──▶ CONNECTED ◀──probe ok──▶ DEGRADED
//!                                │                  │   ▲                    │
//!                           retries exhausted   breaker  breaker         probes keep
//!                                │              opens   closes           failing
//!                                ▼                  ▼   │                    ▼
//!                             FAILED ◀──────────── CIRCUIT_OPEN        RECONNECTING
//!                                ▲                                          │
//!                                └──────────── retries exhausted ───────────┘
//! ```
//!
//! FAILED is terminal until [`ResilientConnection::reconnect`] is called.
//! CIRCUIT_OPEN becomes routable again once the breaker's recovery timeout
//! has passed (see [`ResilientConnection::is_routable`]); the next call is the
//! half-open probe. Health-driven reconnects also wait for that deadline.

pub mod cache;
pub mod fallback;
pub mod health;
pub mod state;

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use cache::ResponseCache;
pub use fallback::{FallbackStrategy, OperationKind};
pub use health::HealthCheckStrategy;
pub use state::{ConnectionState, ConnectionStats, HealthStatus};

use crate::client::{ClientError, McpClient};
use crate::config::{ResilienceConfig, ResilienceConfigUpdate};
use crate::error::{ResilienceError, Result};
use crate::events::{ConnectionEvent, EVENT_CHANNEL_CAPACITY};
use crate::resilience::{CircuitBreaker, CircuitBreakerState, RetryBackoff};
use state::StatsTracker;

/// Poll interval while waiting for in-flight operations to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ConnectionInner {
    name: String,
    client: Arc<dyn McpClient>,
    config: RwLock<ResilienceConfig>,
    state: Mutex<ConnectionState>,
    stats: Mutex<StatsTracker>,
    breaker: CircuitBreaker,
    /// Breaker state last reported to subscribers
    observed_breaker: Mutex<CircuitBreakerState>,
    cache: Mutex<ResponseCache>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    /// Held for the whole disconnect+connect cycle
    reconnect_lock: Arc<tokio::sync::Mutex<()>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(handle) = self.health_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Decrements the in-flight counter when an operation ends or is cancelled
struct InFlight<'a>(&'a Mutex<StatsTracker>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().operation_finished();
    }
}

/// Handle to a resilient upstream connection
///
/// Cloning is cheap; all clones share the same state.
#[derive(Clone)]
pub struct ResilientConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for ResilientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientConnection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("breaker", &self.inner.breaker.state())
            .finish_non_exhaustive()
    }
}

impl ResilientConnection {
    /// Create a disconnected connection around `client`
    pub fn new(name: impl Into<String>, client: Arc<dyn McpClient>, config: ResilienceConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ConnectionInner {
                name: name.into(),
                client,
                breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
                observed_breaker: Mutex::new(CircuitBreakerState::Closed),
                cache: Mutex::new(ResponseCache::new(config.degraded_mode.cache_responses)),
                config: RwLock::new(config),
                state: Mutex::new(ConnectionState::Disconnected),
                stats: Mutex::new(StatsTracker::default()),
                health_task: Mutex::new(None),
                reconnect_lock: Arc::new(tokio::sync::Mutex::new(())),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current effective configuration
    pub fn config(&self) -> ResilienceConfig {
        self.inner.config.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Copy of the current statistics
    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.lock().snapshot()
    }

    /// Operations in flight right now
    pub fn current_operations(&self) -> usize {
        self.inner.stats.lock().current_operations()
    }

    pub fn circuit_breaker_state(&self) -> CircuitBreakerState {
        self.inner.breaker.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connected and not degraded
    pub fn is_healthy(&self) -> bool {
        self.is_connected()
    }

    /// Serving live calls (CONNECTED or DEGRADED)
    pub fn is_available(&self) -> bool {
        self.state().is_serving()
    }

    /// Can take a request now
    ///
    /// True while serving, and for CIRCUIT_OPEN once the breaker's recovery
    /// deadline has passed: the next call is the half-open probe that closes
    /// the circuit again.
    pub fn is_routable(&self) -> bool {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Degraded => true,
            ConnectionState::CircuitOpen => self.inner.breaker.retry_in().is_none(),
            _ => false,
        }
    }

    /// No operation or connect for at least `idle_timeout`
    pub fn is_idle(&self) -> bool {
        let idle_timeout = self.inner.config.read().connection.idle_timeout;
        self.inner
            .stats
            .lock()
            .idle_for()
            .is_some_and(|idle| idle >= idle_timeout)
    }

    /// Receive this connection's events
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Drop every cached response
    pub fn clear_cache(&self) {
        self.inner.cache.lock().clear();
    }

    fn label(&self, operation: &str) -> String {
        format!("{} ({operation})", self.inner.name)
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.inner.state.lock();
            let old = *state;
            if old == new_state {
                return;
            }
            *state = new_state;
            old
        };

        debug!(server = %self.inner.name, from = %old_state, to = %new_state, "Connection state changed");
        // No subscribers is fine
        let _ = self.inner.events.send(ConnectionEvent::StateChange {
            new_state,
            old_state,
        });
    }

    /// Publish breaker transitions and mirror them in the connection state
    fn sync_breaker(&self) {
        let current = self.inner.breaker.state();
        {
            let mut observed = self.inner.observed_breaker.lock();
            if *observed == current {
                return;
            }
            *observed = current;
        }

        self.inner.stats.lock().set_breaker_state(current);
        let _ = self
            .inner
            .events
            .send(ConnectionEvent::CircuitBreakerStateChange { state: current });

        match current {
            CircuitBreakerState::Open if self.state().is_serving() => {
                warn!(server = %self.inner.name, "Circuit breaker opened, connection unavailable");
                self.set_state(ConnectionState::CircuitOpen);
            }
            CircuitBreakerState::Closed if self.state() == ConnectionState::CircuitOpen => {
                info!(server = %self.inner.name, "Circuit breaker closed, connection restored");
                self.set_state(ConnectionState::Connected);
            }
            _ => {}
        }
    }

    /// Force the circuit breaker closed
    pub fn reset_circuit_breaker(&self) {
        self.inner.breaker.reset();
        self.sync_breaker();
    }

    // === Connect / Disconnect ===

    /// Connect with retries; no-op when already CONNECTED
    pub async fn connect(&self) -> Result<()> {
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }
        if let Some(retry_in) = self.inner.breaker.retry_in() {
            return Err(ResilienceError::CircuitOpen {
                label: self.label("connect"),
                retry_in,
            });
        }
        self.connect_with_retries(ConnectionState::Connecting).await
    }

    async fn connect_with_retries(&self, attempt_state: ConnectionState) -> Result<()> {
        let (retry, connect_timeout) = {
            let config = self.inner.config.read();
            (config.retry.clone(), config.connection.connect_timeout)
        };
        let backoff = RetryBackoff::from_config(&retry);
        let attempts = retry.max_retry_attempts.max(1);
        let label = self.label("connect");
        let mut last_error = String::new();

        for attempt in 0..attempts {
            self.set_state(attempt_state);
            self.inner.stats.lock().connect_attempt();

            let started = Instant::now();
            let client = Arc::clone(&self.inner.client);
            let server = self.inner.name.clone();
            let result = self
                .inner
                .breaker
                .execute(&label, || async move {
                    match tokio::time::timeout(connect_timeout, client.connect()).await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(source)) => Err(ResilienceError::Operation { server, source }),
                        Err(_) => Err(ResilienceError::Timeout {
                            operation: format!("Connect to server '{server}'"),
                            timeout: connect_timeout,
                        }),
                    }
                })
                .await;
            self.sync_breaker();

            match result {
                Ok(()) => {
                    self.inner.stats.lock().connect_succeeded(started.elapsed());
                    self.set_state(ConnectionState::Connected);
                    self.start_health_checks();
                    info!(server = %self.inner.name, attempt = attempt + 1, "Connected to server");
                    return Ok(());
                }
                Err(err) => {
                    self.inner.stats.lock().connect_failed();
                    last_error = err.to_string();

                    if attempt + 1 < attempts {
                        let delay = backoff.delay(attempt);
                        warn!(
                            server = %self.inner.name,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            delay_ms = delay.as_millis(),
                            error = %err,
                            "Connect attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Failed);
        error!(
            server = %self.inner.name,
            attempts,
            error = %last_error,
            "Connection failed, giving up"
        );
        Err(ResilienceError::Connect {
            server: self.inner.name.clone(),
            attempts,
            last_error,
        })
    }

    /// Drain in-flight operations (bounded) and disconnect the client
    pub async fn disconnect(&self) -> Result<()> {
        let result = self.teardown().await;
        match &result {
            Ok(()) => {
                self.set_state(ConnectionState::Disconnected);
                info!(server = %self.inner.name, "Disconnected from server");
            }
            Err(err) => {
                self.set_state(ConnectionState::Failed);
                error!(server = %self.inner.name, error = %err, "Disconnect failed");
            }
        }
        result
    }

    async fn teardown(&self) -> Result<()> {
        self.stop_health_checks();

        let grace = self.inner.config.read().connection.graceful_shutdown_timeout;
        let deadline = Instant::now() + grace;
        loop {
            let in_flight = self.current_operations();
            if in_flight == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    server = %self.inner.name,
                    in_flight,
                    "Forcing disconnect with operations still in flight"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        self.inner
            .client
            .disconnect()
            .await
            .map_err(|source| ResilienceError::Disconnect {
                server: self.inner.name.clone(),
                source,
            })
    }

    /// Disconnect then connect again; also the way out of FAILED
    ///
    /// Only one cycle runs at a time. A caller that finds one in progress
    /// waits for it and returns straight away if it left the connection
    /// CONNECTED. While the circuit breaker is open this fails fast with a
    /// circuit-open error and leaves the state alone.
    pub async fn reconnect(&self) -> Result<()> {
        let lock = Arc::clone(&self.inner.reconnect_lock);
        let _cycle = match lock.try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(server = %self.inner.name, "Waiting for reconnect already in progress");
                let guard = Arc::clone(&self.inner.reconnect_lock).lock_owned().await;
                if self.state() == ConnectionState::Connected {
                    return Ok(());
                }
                guard
            }
        };
        self.reconnect_cycle().await
    }

    /// One disconnect+connect cycle; the caller holds `reconnect_lock`
    async fn reconnect_cycle(&self) -> Result<()> {
        if let Some(retry_in) = self.inner.breaker.retry_in() {
            debug!(
                server = %self.inner.name,
                retry_in_ms = retry_in.as_millis(),
                "Circuit breaker open, not reconnecting yet"
            );
            return Err(ResilienceError::CircuitOpen {
                label: self.label("reconnect"),
                retry_in,
            });
        }

        info!(server = %self.inner.name, from = %self.state(), "Reconnecting");
        self.set_state(ConnectionState::Reconnecting);

        if let Err(err) = self.teardown().await {
            debug!(server = %self.inner.name, error = %err, "Ignoring disconnect error during reconnect");
        }
        self.connect_with_retries(ConnectionState::Reconnecting).await
    }

    // === Operations ===

    /// Call a tool on the upstream server
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value> {
        let tool = name.to_string();
        self.execute_with_resilience(OperationKind::Tool, format!("callTool:{name}"), |client| async move {
            client.call_tool(&tool, args).await
        })
        .await
    }

    /// Read a resource from the upstream server
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        let target = uri.to_string();
        self.execute_with_resilience(OperationKind::Resource, format!("readResource:{uri}"), |client| async move {
            client.read_resource(&target).await
        })
        .await
    }

    async fn execute_with_resilience<F, Fut>(
        &self,
        kind: OperationKind,
        operation_id: String,
        call: F,
    ) -> Result<Value>
    where
        F: FnOnce(Arc<dyn McpClient>) -> Fut,
        Fut: Future<Output = std::result::Result<Value, ClientError>>,
    {
        let state = self.state();
        // CIRCUIT_OPEN still goes through the breaker so it can admit a probe
        if !state.is_serving() && state != ConnectionState::CircuitOpen {
            let err = ResilienceError::NotConnected {
                server: self.inner.name.clone(),
                state,
            };
            return self.degrade_or(kind, &operation_id, err);
        }

        let (degraded_enabled, limit) = {
            let config = self.inner.config.read();
            (config.degraded_mode.enabled, config.connection.max_concurrent_operations)
        };

        if state == ConnectionState::Degraded && degraded_enabled {
            let cached = self.inner.cache.lock().get(&operation_id);
            if let Some(value) = cached {
                debug!(server = %self.inner.name, operation = %operation_id, "Serving cached response while degraded");
                return Ok(value);
            }
        }

        let admitted = {
            let mut stats = self.inner.stats.lock();
            if stats.current_operations() >= limit {
                false
            } else {
                stats.operation_started();
                true
            }
        };
        if !admitted {
            let err = ResilienceError::Saturated {
                server: self.inner.name.clone(),
                limit,
            };
            return self.degrade_or(kind, &operation_id, err);
        }

        let started = Instant::now();
        let result = {
            let _in_flight = InFlight(&self.inner.stats);
            let client = Arc::clone(&self.inner.client);
            let server = self.inner.name.clone();
            let label = self.label(&operation_id);
            self.inner
                .breaker
                .execute(&label, || async move {
                    call(client)
                        .await
                        .map_err(|source| ResilienceError::Operation { server, source })
                })
                .await
        };
        self.sync_breaker();

        match result {
            Ok(value) => {
                self.inner.stats.lock().record_latency(started.elapsed());
                if degraded_enabled {
                    self.inner.cache.lock().insert(operation_id, value.clone());
                }
                Ok(value)
            }
            Err(err) => {
                self.inner.stats.lock().operation_failed();
                warn!(
                    server = %self.inner.name,
                    operation = %operation_id,
                    error = %err,
                    "Operation failed"
                );
                self.degrade_or(kind, &operation_id, err)
            }
        }
    }

    /// Run the fallback chain for a failed operation, or return `err` when
    /// degraded mode is off
    fn degrade_or(&self, kind: OperationKind, operation_id: &str, err: ResilienceError) -> Result<Value> {
        let degraded = self.inner.config.read().degraded_mode.clone();
        if !degraded.enabled {
            return Err(err);
        }

        let cached = if degraded
            .fallback_strategies
            .contains(&FallbackStrategy::CachedResponse)
        {
            self.inner.cache.lock().get(operation_id)
        } else {
            None
        };

        let message = format!("Server '{}' unavailable: {err}", self.inner.name);
        match fallback::resolve(&degraded.fallback_strategies, kind, cached, &message) {
            Some((strategy, value)) => {
                info!(
                    server = %self.inner.name,
                    operation = %operation_id,
                    ?strategy,
                    error = %err,
                    "Serving fallback response"
                );
                Ok(value)
            }
            None => {
                warn!(
                    server = %self.inner.name,
                    operation = %operation_id,
                    error = %err,
                    "Fallback strategies exhausted"
                );
                Err(ResilienceError::FallbackExhausted {
                    server: self.inner.name.clone(),
                    operation: operation_id.to_string(),
                })
            }
        }
    }

    // === Health Checking ===

    /// Run one health check now and apply its outcome
    pub async fn force_health_check(&self) -> bool {
        self.perform_health_check(true).await
    }

    /// Health check that records the result but never degrades or reconnects
    pub(crate) async fn probe_health(&self) -> bool {
        self.perform_health_check(false).await
    }

    async fn perform_health_check(&self, escalate: bool) -> bool {
        let (strategy, timeout, threshold, degraded_enabled) = {
            let config = self.inner.config.read();
            (
                config.health_check.strategy,
                config.health_check.timeout,
                config.health_check.consecutive_failure_threshold,
                config.degraded_mode.enabled,
            )
        };

        let client = Arc::clone(&self.inner.client);
        let healthy = tokio::time::timeout(timeout, strategy.probe(client.as_ref()))
            .await
            .unwrap_or_else(|_| {
                debug!(server = %self.inner.name, timeout_ms = timeout.as_millis(), "Health check timed out");
                false
            });

        if healthy {
            self.inner.stats.lock().health_passed();
            if self.state() == ConnectionState::Degraded {
                info!(server = %self.inner.name, "Health restored, leaving degraded mode");
                self.set_state(ConnectionState::Connected);
            }
            return true;
        }

        let failures = self.inner.stats.lock().health_failed();
        warn!(
            server = %self.inner.name,
            ?strategy,
            consecutive_failures = failures,
            threshold,
            "Health check failed"
        );

        if escalate && failures >= threshold {
            let state = self.state();
            if state == ConnectionState::CircuitOpen && self.inner.breaker.is_open() {
                debug!(server = %self.inner.name, "Circuit breaker open, reconnect waits for its recovery deadline");
            } else if degraded_enabled && state == ConnectionState::Connected {
                warn!(server = %self.inner.name, "Entering degraded mode");
                self.set_state(ConnectionState::Degraded);
            } else if matches!(
                state,
                ConnectionState::Connected | ConnectionState::Degraded | ConnectionState::CircuitOpen
            ) {
                self.spawn_reconnect();
            }
        }
        false
    }

    /// Reconnect on a separate task so stopping the health timer cannot cancel it
    ///
    /// The reconnect lock is taken before spawning, so a cycle already running
    /// (or an explicit `reconnect`) is never doubled up.
    fn spawn_reconnect(&self) {
        let Ok(cycle) = Arc::clone(&self.inner.reconnect_lock).try_lock_owned() else {
            debug!(server = %self.inner.name, "Reconnect already in progress");
            return;
        };
        let connection = self.clone();
        tokio::spawn(async move {
            let _cycle = cycle;
            if let Err(err) = connection.reconnect_cycle().await {
                warn!(server = %connection.inner.name, error = %err, "Reconnect after failed health checks did not succeed");
            }
        });
    }

    fn start_health_checks(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(health_check_loop(weak));
        if let Some(previous) = self.inner.health_task.lock().replace(handle) {
            previous.abort();
        }
        debug!(server = %self.inner.name, "Health checks started");
    }

    fn stop_health_checks(&self) {
        if let Some(handle) = self.inner.health_task.lock().take() {
            handle.abort();
            debug!(server = %self.inner.name, "Health checks stopped");
        }
    }

    // === Configuration ===

    /// Merge `update` into the configuration and apply it to the breaker,
    /// cache and health timer
    pub fn update_config(&self, update: ResilienceConfigUpdate) {
        let config = {
            let mut config = self.inner.config.write();
            config.merge(update);
            config.clone()
        };

        self.inner.breaker.update_config(config.circuit_breaker);
        self.inner
            .cache
            .lock()
            .set_ttl(config.degraded_mode.cache_responses);

        let health_running = self.inner.health_task.lock().is_some();
        if health_running {
            self.start_health_checks();
        }
        debug!(server = %self.inner.name, "Connection configuration updated");
    }
}

/// Periodic health checks; exits once the connection is dropped
async fn health_check_loop(connection: Weak<ConnectionInner>) {
    loop {
        let delay = {
            let Some(inner) = connection.upgrade() else {
                break;
            };
            let state = *inner.state.lock();
            let config = inner.config.read();
            match state {
                ConnectionState::Degraded | ConnectionState::CircuitOpen => {
                    config.health_check.recovery_check_interval
                }
                _ => config.health_check.interval,
            }
        };

        tokio::time::sleep(delay).await;

        let Some(inner) = connection.upgrade() else {
            break;
        };
        ResilientConnection { inner }.perform_health_check(true).await;
    }
}
