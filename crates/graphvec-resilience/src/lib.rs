//! # Graphvec Resilience
//!
//! Resilience patterns for the embedding worker.
//! Provides retry classification and backoff, circuit breaker, and timeout.

pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::*;
pub use retry::*;
pub use timeout::*;
