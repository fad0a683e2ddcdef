// ABOUTME: Events published by connections and the pool manager
//
// Delivered over tokio broadcast channels. Each subscriber gets its own
// receiver; a lagging subscriber loses the oldest events, never blocks the
// publisher. `name()` returns the stable event name used in logs.

use serde::Serialize;

use crate::connection::ConnectionState;
use crate::pool::{Alert, SystemMetrics};
use crate::resilience::CircuitBreakerState;

/// Events buffered per subscriber before the oldest are dropped
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event emitted by a single connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ConnectionEvent {
    /// The connection moved to a new lifecycle state
    StateChange {
        new_state: ConnectionState,
        old_state: ConnectionState,
    },
    /// The connection's circuit breaker changed state
    CircuitBreakerStateChange { state: CircuitBreakerState },
}

impl ConnectionEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::StateChange { .. } => "stateChange",
            Self::CircuitBreakerStateChange { .. } => "circuitBreakerStateChange",
        }
    }
}

/// Event emitted by the pool manager
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum PoolEvent {
    ServerAdded { server_name: String },
    ServerRemoved { server_name: String },
    Alert { alert: Alert },
    MetricsUpdated { metrics: SystemMetrics },
    /// A member connection changed lifecycle state
    ConnectionStateChange {
        server_name: String,
        new_state: ConnectionState,
        old_state: ConnectionState,
    },
    /// A member connection's circuit breaker changed state
    CircuitBreakerStateChange {
        server_name: String,
        state: CircuitBreakerState,
    },
}

impl PoolEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ServerAdded { .. } => "serverAdded",
            Self::ServerRemoved { .. } => "serverRemoved",
            Self::Alert { .. } => "alert",
            Self::MetricsUpdated { .. } => "metricsUpdated",
            Self::ConnectionStateChange { .. } => "connectionStateChange",
            Self::CircuitBreakerStateChange { .. } => "circuitBreakerStateChange",
        }
    }
}
