// ABOUTME: Library crate for mcp-resilience exposing the connection and pool API
//
// Layers, bottom up:
// - resilience: circuit breaker and retry backoff
// - connection: one upstream server with retries, health checks and degraded mode
// - pool: many connections behind one routing, queueing and alerting facade

#![allow(missing_docs)]

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod logging;
pub mod pool;
pub mod resilience;

pub use client::{ClientError, ClientFactory, McpClient, ResourceDescriptor, ToolDescriptor};
pub use config::{PoolConfig, ResilienceConfig, ServerConfig};
pub use connection::{ConnectionState, ConnectionStats, ResilientConnection};
pub use error::{ResilienceError, Result};
pub use events::{ConnectionEvent, PoolEvent};
pub use pool::{Alert, AlertSeverity, PoolManager, SystemMetrics, SystemStatus};
pub use resilience::{CircuitBreaker, CircuitBreakerState};
