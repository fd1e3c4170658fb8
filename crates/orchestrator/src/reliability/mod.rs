//! Reliability patterns for task execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Exponential backoff between attempts
//! - [`CircuitBreakerConfig`] / [`CircuitBreaker`] - Per-resource failure isolation
//! - [`CircuitBreakerRegistry`] - Breakers keyed by resource type

mod circuit_breaker;
mod registry;
mod retry;

pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use registry::{BreakerPermit, CircuitBreakerRegistry, CircuitOpenError};
pub use retry::RetryPolicy;
