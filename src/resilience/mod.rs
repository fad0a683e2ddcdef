// ABOUTME: Resilience primitives shared by connections
//
// - circuit_breaker: closed/open/half-open gate around upstream calls
// - backoff: exponential connect-retry delays with jitter

pub mod backoff;
pub mod circuit_breaker;

pub use backoff::RetryBackoff;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
