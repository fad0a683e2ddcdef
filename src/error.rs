// ABOUTME: Error taxonomy for connections and the pool manager
//
// One enum covers every failure a caller can observe: exhausted connect retries,
// open circuits, timeouts, failed live calls, queue/capacity rejections and
// bookkeeping errors. Display strings are part of the public contract.

use std::time::Duration;

use thiserror::Error;

use crate::client::ClientError;
use crate::connection::ConnectionState;

/// Errors returned by connections and the pool manager
#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    /// Every connect attempt failed; the connection is now FAILED
    #[error("Failed to connect to server '{server}' after {attempts} attempts: {last_error}")]
    Connect {
        /// Server name
        server: String,
        /// Number of connect attempts made
        attempts: u32,
        /// Description of the last failure
        last_error: String,
    },

    /// The circuit breaker rejected the call without invoking it
    #[error("Circuit breaker is OPEN for {label}, retry in {}ms", retry_in.as_millis())]
    CircuitOpen {
        /// Label of the guarded operation
        label: String,
        /// Time left until a half-open probe is allowed
        retry_in: Duration,
    },

    /// A connect attempt or a pooled request exceeded its deadline
    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// What timed out
        operation: String,
        /// The bound that was exceeded
        timeout: Duration,
    },

    /// A live call to the upstream server failed
    #[error("Operation failed on server '{server}': {source}")]
    Operation {
        /// Server name
        server: String,
        /// Underlying client error
        #[source]
        source: ClientError,
    },

    /// The connection is not in a state that serves requests
    #[error("Server '{server}' is not connected (state: {state})")]
    NotConnected {
        /// Server name
        server: String,
        /// State at the time of the call
        state: ConnectionState,
    },

    /// The connection already runs its maximum number of operations
    #[error("Server '{server}' is saturated ({limit} concurrent operations)")]
    Saturated {
        /// Server name
        server: String,
        /// Configured per-connection limit
        limit: usize,
    },

    /// Degraded mode produced no response
    #[error("All fallback strategies exhausted for {operation} on server '{server}'")]
    FallbackExhausted {
        /// Server name
        server: String,
        /// Operation identifier (`callTool:<name>` / `readResource:<uri>`)
        operation: String,
    },

    /// The pool's wait queue is at capacity
    #[error("Request queue is full (capacity {capacity})")]
    QueueFull {
        /// Maximum number of waiting requests
        capacity: usize,
    },

    /// Adding another server would exceed the pool limit
    #[error("Maximum connection limit reached ({max})")]
    Capacity {
        /// Configured maximum
        max: usize,
    },

    /// No registered connection can take the request
    #[error("No available server to handle the request")]
    NoAvailableServer,

    /// A server with this name is already registered
    #[error("Server '{0}' is already registered")]
    DuplicateServer(String),

    /// The pool has been shut down
    #[error("Pool manager is shutting down")]
    ShuttingDown,

    /// The client's own disconnect failed
    #[error("Failed to disconnect server '{server}': {source}")]
    Disconnect {
        /// Server name
        server: String,
        /// Underlying client error
        #[source]
        source: ClientError,
    },
}

impl ResilienceError {
    /// Whether trying the same request on another server can help
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Operation { .. }
                | Self::Timeout { .. }
                | Self::CircuitOpen { .. }
                | Self::NotConnected { .. }
                | Self::Saturated { .. }
                | Self::FallbackExhausted { .. }
        )
    }
}

/// Result type for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;
