// ABOUTME: Pool manager presenting many resilient connections as one service
// ABOUTME: Routing, request queue, failover, alerting and periodic metrics collection

//! Pool manager for resilient upstream connections.
//!
//! # Request flow
//!
//! ```text
//! call_tool / read_resource
//!     → request timeout starts (covers queue wait + execution)
//!     → backpressure.rs (take a slot, wait FIFO, or reject when the queue is full)
//!     → select connection: preferred server, else balancer.rs strategy
//!     → ResilientConnection executes (breaker, fallback chain)
//!     → on failure with IMMEDIATE failover: next best connection
//!     → counters updated, slot released
//! ```
//!
//! A background task collects [`SystemMetrics`] every `metrics_interval`,
//! evaluates alert thresholds and publishes `metricsUpdated`.

pub mod alerts;
pub mod backpressure;
pub mod balancer;
pub mod metrics;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use alerts::{Alert, AlertLog, AlertSeverity};
pub use backpressure::{QueueStatus, RequestPermit, RequestQueue};
pub use balancer::{Balancer, Candidate, FailoverStrategy, LoadBalancingStrategy};
pub use metrics::{BreachKind, BreachTracker, PoolCounters, ServerSample, SystemMetrics};

use crate::client::ClientFactory;
use crate::config::{PoolConfig, PoolConfigUpdate, ResilienceConfigUpdate, ServerConfig};
use crate::connection::{ConnectionState, ConnectionStats, ResilientConnection};
use crate::error::{ResilienceError, Result};
use crate::events::{ConnectionEvent, PoolEvent, EVENT_CHANNEL_CAPACITY};
use crate::resilience::CircuitBreakerState;

struct ServerEntry {
    connection: ResilientConnection,
    /// Forwards connection events to pool subscribers
    forwarder: JoinHandle<()>,
}

struct PoolInner {
    config: RwLock<PoolConfig>,
    factory: Arc<dyn ClientFactory>,
    /// Registration order drives round-robin order
    servers: RwLock<Vec<ServerEntry>>,
    balancer: Balancer,
    queue: RequestQueue,
    alerts: Mutex<AlertLog>,
    counters: PoolCounters,
    /// Per-server (total, failed) operations at the last collection
    error_window: Mutex<HashMap<String, (u64, u64)>>,
    breaches: Mutex<BreachTracker>,
    last_metrics: Mutex<Option<SystemMetrics>>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<PoolEvent>,
    shut_down: AtomicBool,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(handle) = self.metrics_task.get_mut().take() {
            handle.abort();
        }
        for entry in self.servers.get_mut().drain(..) {
            entry.forwarder.abort();
        }
    }
}

/// Status of one registered server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    pub healthy: bool,
    pub idle: bool,
    pub circuit_breaker_state: CircuitBreakerState,
    pub current_operations: usize,
}

/// Operator view of the whole pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub servers: Vec<ServerStatus>,
    pub queue: QueueStatus,
    pub unacknowledged_alerts: usize,
    /// Most recent periodic collection, if one ran
    pub last_metrics: Option<SystemMetrics>,
    pub shutting_down: bool,
}

/// Manager of a named set of resilient connections
///
/// Cloning is cheap; all clones share the same pool. Must be created inside a
/// tokio runtime (it spawns the metrics timer).
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("servers", &self.server_names())
            .field("queue", &self.inner.queue.status())
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    /// Create an empty pool and start metrics collection
    pub fn new(config: PoolConfig, factory: impl ClientFactory + 'static) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pool = Self {
            inner: Arc::new(PoolInner {
                queue: RequestQueue::new(config.max_concurrent_requests, config.max_queue_size),
                alerts: Mutex::new(AlertLog::new(config.max_alerts)),
                config: RwLock::new(config),
                factory: Arc::new(factory),
                servers: RwLock::new(Vec::new()),
                balancer: Balancer::new(),
                counters: PoolCounters::new(),
                error_window: Mutex::new(HashMap::new()),
                breaches: Mutex::new(BreachTracker::default()),
                last_metrics: Mutex::new(None),
                metrics_task: Mutex::new(None),
                events,
                shut_down: AtomicBool::new(false),
            }),
        };
        pool.start_metrics_collection();
        info!("Pool manager started");
        pool
    }

    /// Receive pool events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Registered server names in registration order
    pub fn server_names(&self) -> Vec<String> {
        self.inner
            .servers
            .read()
            .iter()
            .map(|entry| entry.connection.name().to_string())
            .collect()
    }

    /// Connection handle for a registered server
    pub fn connection(&self, name: &str) -> Option<ResilientConnection> {
        self.inner
            .servers
            .read()
            .iter()
            .find(|entry| entry.connection.name() == name)
            .map(|entry| entry.connection.clone())
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.config.read().clone()
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    // === Server Management ===

    /// Register and connect a server
    ///
    /// `overrides` are merged over the pool defaults and the server's own
    /// resilience section. A failed connect raises an alert and keeps the
    /// server registered, unless `fallback_to_legacy` is off.
    pub async fn add_server(
        &self,
        server: ServerConfig,
        overrides: Option<ResilienceConfigUpdate>,
    ) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ResilienceError::ShuttingDown);
        }

        let (resilience, fallback_to_legacy) = {
            let config = self.inner.config.read();
            let mut resilience = config.resilience.clone();
            if let Some(own) = server.resilience.clone() {
                resilience.merge(own);
            }
            if let Some(overrides) = overrides {
                resilience.merge(overrides);
            }
            (resilience, config.fallback_to_legacy)
        };

        let name = server.name.clone();
        let client = self.inner.factory.create(&server);
        let connection = ResilientConnection::new(name.clone(), client, resilience);

        {
            let max = self.inner.config.read().max_total_connections;
            let mut servers = self.inner.servers.write();
            if servers.len() >= max {
                return Err(ResilienceError::Capacity { max });
            }
            if servers.iter().any(|entry| entry.connection.name() == name) {
                return Err(ResilienceError::DuplicateServer(name));
            }
            let forwarder = tokio::spawn(forward_connection_events(
                Arc::downgrade(&self.inner),
                name.clone(),
                connection.subscribe(),
            ));
            servers.push(ServerEntry {
                connection: connection.clone(),
                forwarder,
            });
        }

        if let Err(err) = connection.connect().await {
            self.create_alert(
                AlertSeverity::Error,
                format!("Failed to connect to server '{name}': {err}"),
                Some(&name),
            );
            if !fallback_to_legacy {
                self.unregister(&name);
                return Err(err);
            }
            warn!(server = %name, "Server registered without a live connection");
        }

        info!(server = %name, state = %connection.state(), "Server added");
        self.emit(PoolEvent::ServerAdded { server_name: name });
        Ok(())
    }

    fn unregister(&self, name: &str) -> Option<ResilientConnection> {
        let entry = {
            let mut servers = self.inner.servers.write();
            let index = servers
                .iter()
                .position(|entry| entry.connection.name() == name)?;
            servers.remove(index)
        };
        entry.forwarder.abort();
        self.inner.error_window.lock().remove(name);
        self.inner.breaches.lock().forget_server(name);
        Some(entry.connection)
    }

    /// Disconnect and discard a server; unknown names are a no-op
    ///
    /// The server is removed even if its disconnect fails; that error is
    /// returned.
    pub async fn remove_server(&self, name: &str) -> Result<()> {
        let Some(connection) = self.unregister(name) else {
            debug!(server = %name, "Remove requested for unknown server");
            return Ok(());
        };

        let result = connection.disconnect().await;
        info!(server = %name, "Server removed");
        self.emit(PoolEvent::ServerRemoved {
            server_name: name.to_string(),
        });
        result
    }

    // === Request Routing ===

    /// Call a tool, preferring `preferred_server` when it is usable
    pub async fn call_tool(
        &self,
        name: &str,
        args: Value,
        preferred_server: Option<&str>,
    ) -> Result<Value> {
        let operation = format!("callTool:{name}");
        self.dispatch(&operation, preferred_server, |connection| {
            let args = args.clone();
            async move { connection.call_tool(name, args).await }
        })
        .await
    }

    /// Read a resource, preferring `preferred_server` when it is usable
    pub async fn read_resource(&self, uri: &str, preferred_server: Option<&str>) -> Result<Value> {
        let operation = format!("readResource:{uri}");
        self.dispatch(&operation, preferred_server, |connection| async move {
            connection.read_resource(uri).await
        })
        .await
    }

    async fn dispatch<F, Fut>(
        &self,
        operation: &str,
        preferred_server: Option<&str>,
        call: F,
    ) -> Result<Value>
    where
        F: Fn(ResilientConnection) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(ResilienceError::ShuttingDown);
        }

        let timeout = self.inner.config.read().request_timeout;
        self.inner.counters.request_started();

        let result = match tokio::time::timeout(timeout, self.run_request(preferred_server, &call)).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.counters.request_timed_out();
                warn!(operation = %operation, timeout_ms = timeout.as_millis(), "Request timed out");
                return Err(ResilienceError::Timeout {
                    operation: format!("Request {operation}"),
                    timeout,
                });
            }
        };

        match &result {
            Ok(_) => self.inner.counters.request_succeeded(),
            Err(ResilienceError::QueueFull { .. }) => self.inner.counters.request_rejected(),
            Err(err) => {
                self.inner.counters.request_failed();
                debug!(operation = %operation, error = %err, "Request failed");
            }
        }
        result
    }

    async fn run_request<F, Fut>(&self, preferred_server: Option<&str>, call: &F) -> Result<Value>
    where
        F: Fn(ResilientConnection) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let _permit = self.inner.queue.acquire().await?;
        let failover = self.inner.config.read().failover;

        let mut tried: Vec<String> = Vec::new();
        let mut last_error = None;
        loop {
            let preferred = if tried.is_empty() { preferred_server } else { None };
            let Some(connection) = self.select(preferred, &tried) else {
                return Err(last_error.unwrap_or(ResilienceError::NoAvailableServer));
            };

            match call(connection.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if failover == FailoverStrategy::Immediate && err.is_retryable() => {
                    warn!(server = %connection.name(), error = %err, "Request failed, failing over");
                    tried.push(connection.name().to_string());
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pick a connection: the preferred one if usable, else by strategy
    fn select(&self, preferred: Option<&str>, exclude: &[String]) -> Option<ResilientConnection> {
        let (strategy, health_threshold) = {
            let config = self.inner.config.read();
            (config.load_balancing, config.health_threshold)
        };
        let servers = self.inner.servers.read();

        if let Some(name) = preferred {
            // An open circuit past its recovery deadline takes the call as its probe
            let usable = servers.iter().find(|entry| {
                entry.connection.name() == name
                    && match entry.connection.state() {
                        ConnectionState::Failed => false,
                        ConnectionState::CircuitOpen => entry.connection.is_routable(),
                        _ => true,
                    }
            });
            if let Some(entry) = usable {
                return Some(entry.connection.clone());
            }
            debug!(server = %name, "Preferred server unusable, load balancing instead");
        }

        let candidates: Vec<Candidate> = servers
            .iter()
            .map(|entry| {
                let state = entry.connection.state();
                Candidate {
                    eligible: entry.connection.is_routable()
                        && !exclude.iter().any(|name| name == entry.connection.name()),
                    degraded: state == ConnectionState::Degraded,
                    in_flight: entry.connection.current_operations(),
                }
            })
            .collect();

        let index = self
            .inner
            .balancer
            .select(strategy, &candidates, health_threshold)?;
        Some(servers[index].connection.clone())
    }

    // === Alerts ===

    /// Record an alert and publish it
    pub fn create_alert(
        &self,
        severity: AlertSeverity,
        message: impl Into<String>,
        server_name: Option<&str>,
    ) -> Alert {
        let alert = self.inner.alerts.lock().push(severity, message, server_name);
        match severity {
            AlertSeverity::Error | AlertSeverity::Critical => {
                error!(id = %alert.id, %severity, server = ?alert.server_name, message = %alert.message, "Alert raised");
            }
            AlertSeverity::Warning => {
                warn!(id = %alert.id, %severity, server = ?alert.server_name, message = %alert.message, "Alert raised");
            }
            AlertSeverity::Info => {
                info!(id = %alert.id, %severity, server = ?alert.server_name, message = %alert.message, "Alert raised");
            }
        }
        self.emit(PoolEvent::Alert {
            alert: alert.clone(),
        });
        alert
    }

    /// Acknowledge an alert; false if unknown or already acknowledged
    pub fn acknowledge_alert(&self, id: Uuid) -> bool {
        self.inner.alerts.lock().acknowledge(id)
    }

    /// Alerts oldest first
    pub fn get_alerts(&self, include_acknowledged: bool) -> Vec<Alert> {
        self.inner.alerts.lock().list(include_acknowledged)
    }

    fn on_connection_event(&self, server_name: &str, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChange {
                new_state,
                old_state,
            } => {
                if new_state == ConnectionState::Failed {
                    self.create_alert(
                        AlertSeverity::Critical,
                        format!("Server '{server_name}' entered FAILED state"),
                        Some(server_name),
                    );
                }
                self.emit(PoolEvent::ConnectionStateChange {
                    server_name: server_name.to_string(),
                    new_state,
                    old_state,
                });
            }
            ConnectionEvent::CircuitBreakerStateChange { state } => {
                if state == CircuitBreakerState::Open {
                    self.create_alert(
                        AlertSeverity::Warning,
                        format!("Circuit breaker opened for server '{server_name}'"),
                        Some(server_name),
                    );
                }
                self.emit(PoolEvent::CircuitBreakerStateChange {
                    server_name: server_name.to_string(),
                    state,
                });
            }
        }
    }

    // === Metrics and Status ===

    fn samples(&self) -> Vec<ServerSample> {
        self.inner
            .servers
            .read()
            .iter()
            .map(|entry| {
                let stats = entry.connection.stats();
                ServerSample {
                    name: entry.connection.name().to_string(),
                    healthy: entry.connection.is_healthy(),
                    total_operations: stats.total_operations,
                    failed_operations: stats.failed_operations,
                    consecutive_failures: stats.consecutive_failures,
                    average_response_time_ms: stats.average_response_time_ms,
                }
            })
            .collect()
    }

    fn snapshot(&self, samples: &[ServerSample]) -> SystemMetrics {
        let queue = self.inner.queue.status();
        SystemMetrics::aggregate(
            samples,
            self.inner.counters.snapshot(),
            queue.waiting,
            queue.in_flight,
            self.get_alerts(false),
        )
    }

    /// Current pool metrics (does not evaluate alert thresholds)
    pub fn get_metrics(&self) -> SystemMetrics {
        self.snapshot(&self.samples())
    }

    /// Collect metrics, alert on thresholds that became breached since the
    /// last collection, and publish `metricsUpdated`
    ///
    /// Runs on the metrics timer; callable directly for an immediate collection.
    pub fn collect_system_metrics(&self) -> SystemMetrics {
        let samples = self.samples();
        let metrics = self.snapshot(&samples);

        let thresholds = self.inner.config.read().alert_thresholds.clone();
        let breaches = {
            let mut window = self.inner.error_window.lock();
            metrics::evaluate_thresholds(&thresholds, &metrics, &samples, &mut window)
        };
        // Sustained breaches alerted at an earlier collection stay quiet
        let starting = self.inner.breaches.lock().starting(breaches);
        for breach in starting {
            self.create_alert(breach.severity, breach.message, breach.server_name.as_deref());
        }

        debug!(
            servers = metrics.total_servers,
            healthy = metrics.healthy_servers,
            error_rate = metrics.error_rate_percent,
            "Metrics collected"
        );
        *self.inner.last_metrics.lock() = Some(metrics.clone());
        self.emit(PoolEvent::MetricsUpdated {
            metrics: metrics.clone(),
        });
        metrics
    }

    /// Stats for one server, or for all when `name` is `None`
    pub fn get_server_stats(&self, name: Option<&str>) -> HashMap<String, ConnectionStats> {
        self.inner
            .servers
            .read()
            .iter()
            .filter(|entry| name.map_or(true, |name| entry.connection.name() == name))
            .map(|entry| (entry.connection.name().to_string(), entry.connection.stats()))
            .collect()
    }

    pub fn get_system_status(&self) -> SystemStatus {
        let servers = self
            .inner
            .servers
            .read()
            .iter()
            .map(|entry| {
                let connection = &entry.connection;
                ServerStatus {
                    name: connection.name().to_string(),
                    state: connection.state(),
                    healthy: connection.is_healthy(),
                    idle: connection.is_idle(),
                    circuit_breaker_state: connection.circuit_breaker_state(),
                    current_operations: connection.current_operations(),
                }
            })
            .collect();

        SystemStatus {
            servers,
            queue: self.inner.queue.status(),
            unacknowledged_alerts: self.inner.alerts.lock().unacknowledged_count(),
            last_metrics: self.inner.last_metrics.lock().clone(),
            shutting_down: self.inner.shut_down.load(Ordering::SeqCst),
        }
    }

    fn start_metrics_collection(&self) {
        let handle = tokio::spawn(metrics_loop(Arc::downgrade(&self.inner)));
        if let Some(previous) = self.inner.metrics_task.lock().replace(handle) {
            previous.abort();
        }
    }

    // === Recovery, Configuration, Shutdown ===

    /// Reset the breaker, probe the server, and reconnect if still unhealthy
    ///
    /// The probe only records its result, so the single reconnect here is the
    /// only one this call starts. Unknown names are a no-op.
    pub async fn force_recovery(&self, name: &str) -> Result<()> {
        let Some(connection) = self.connection(name) else {
            debug!(server = %name, "Recovery requested for unknown server");
            return Ok(());
        };

        info!(server = %name, state = %connection.state(), "Forcing recovery");
        connection.reset_circuit_breaker();
        if connection.probe_health().await && connection.is_available() {
            return Ok(());
        }
        connection.reconnect().await
    }

    /// Merge `update` into the pool configuration and apply it
    ///
    /// Resilience sections are pushed to every connection; queue limits and
    /// the alert cap take effect immediately.
    pub fn update_config(&self, update: PoolConfigUpdate) {
        let resilience = update.resilience.clone();
        let config = {
            let mut config = self.inner.config.write();
            config.merge(update);
            config.clone()
        };

        self.inner
            .queue
            .resize(config.max_concurrent_requests, config.max_queue_size);
        self.inner.alerts.lock().set_max_alerts(config.max_alerts);

        if let Some(resilience) = resilience {
            let connections: Vec<_> = self
                .inner
                .servers
                .read()
                .iter()
                .map(|entry| entry.connection.clone())
                .collect();
            for connection in connections {
                connection.update_config(resilience.clone());
            }
        }

        if !self.inner.shut_down.load(Ordering::SeqCst) {
            self.start_metrics_collection();
        }
        info!("Pool configuration updated");
    }

    /// Disconnect every server and stop background work
    ///
    /// Idempotent. Individual disconnect failures are logged and returned, not
    /// raised.
    pub async fn shutdown(&self) -> Vec<ResilienceError> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        info!("Shutting down pool manager");

        if let Some(handle) = self.inner.metrics_task.lock().take() {
            handle.abort();
        }
        self.inner.queue.close();

        let entries = std::mem::take(&mut *self.inner.servers.write());
        let results = join_all(entries.iter().map(|entry| entry.connection.disconnect())).await;

        let mut errors = Vec::new();
        for (entry, result) in entries.iter().zip(results) {
            entry.forwarder.abort();
            if let Err(err) = result {
                warn!(server = %entry.connection.name(), error = %err, "Error disconnecting server during shutdown");
                errors.push(err);
            }
        }

        info!(errors = errors.len(), "Pool manager shut down");
        errors
    }
}

/// Relay one connection's events to the pool until either side goes away
async fn forward_connection_events(
    pool: Weak<PoolInner>,
    server_name: String,
    mut events: broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(server = %server_name, skipped, "Pool lagged behind connection events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = pool.upgrade() else {
            break;
        };
        PoolManager { inner }.on_connection_event(&server_name, event);
    }
}

/// Periodic metrics collection; exits once the pool is dropped
async fn metrics_loop(pool: Weak<PoolInner>) {
    loop {
        let Some(inner) = pool.upgrade() else {
            break;
        };
        let interval = inner.config.read().metrics_interval;
        drop(inner);

        tokio::time::sleep(interval).await;

        let Some(inner) = pool.upgrade() else {
            break;
        };
        PoolManager { inner }.collect_system_metrics();
    }
}
