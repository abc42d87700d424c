//! Circuit breaker implementation.

use graphvec_core::{Classify, ErrorKind, GraphvecError};
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed - requests are allowed.
    Closed,
    /// Circuit is open - requests are rejected.
    Open,
    /// Circuit is half-open - limited probe requests are allowed.
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Consecutive probe successes needed to close the circuit from half-open.
    pub success_threshold: u32,
    /// How long the circuit stays open before allowing a probe.
    pub cool_down: Duration,
    /// Concurrent probe calls allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cool_down: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
}

impl Inner {
    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Circuit breaker for protecting a dependency against load during an outage.
///
/// All state lives behind a single mutex which is never held across an
/// await point, so concurrent calls observe and apply transitions in order.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a new circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                half_open_in_flight: 0,
                opened_at: None,
            }),
        }
    }

    /// Creates a new circuit breaker with default configuration.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Returns the current state of the circuit breaker.
    ///
    /// An open circuit whose cool-down has elapsed still reports `Open`
    /// until the next call moves it to half-open.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns the current run of consecutive failures.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Returns the name of the circuit breaker.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Executes a function with circuit breaker protection.
    ///
    /// While the circuit is open the function is not invoked.
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().map_err(|retry_after| CircuitBreakerError::Open {
            name: self.name.clone(),
            retry_after,
        })?;

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let result = f().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.record_success(admission);
                Ok(value)
            }
            Err(e) => {
                self.record_failure(admission);
                Err(CircuitBreakerError::Failure(e))
            }
        }
    }

    /// Decides whether a call may proceed, returning how long to wait if not.
    fn admit(&self) -> Result<Admission, Duration> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let now = Instant::now();
                let elapsed = inner.opened_at.map_or(self.config.cool_down, |at| now - at);
                if elapsed < self.config.cool_down {
                    return Err(self.config.cool_down - elapsed);
                }

                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 1;
                debug!(breaker = %self.name, "Circuit breaker transitioning to half-open");
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    Ok(Admission::Probe)
                } else {
                    Err(Duration::ZERO)
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            // Only probe successes count toward closing.
            CircuitState::HalfOpen if admission == Admission::Normal => {}
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 0;
                    inner.opened_at = None;
                    info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
                }
            }
            // A call admitted before the circuit tripped; the open timer stands.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.trip(now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        cool_down_secs = self.config.cool_down.as_secs(),
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                let probe = admission == Admission::Probe;
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.trip(now);
                warn!(
                    breaker = %self.name,
                    probe,
                    "Circuit breaker reopened after failure in half-open state"
                );
            }
            CircuitState::Open => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
            }
        }
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Manually resets the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
        debug!(breaker = %self.name, "Circuit breaker manually reset");
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Frees a half-open probe slot if the wrapped future is dropped before
/// completing.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_probe();
        }
    }
}

/// Error type for circuit breaker operations.
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the call was rejected without being made.
    Open { name: String, retry_after: Duration },
    /// The underlying operation failed.
    Failure(E),
}

impl<E: std::fmt::Display> std::fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { name, retry_after } => {
                write!(f, "Circuit '{}' open, retry after {}s", name, retry_after.as_secs())
            }
            Self::Failure(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { .. } => None,
            Self::Failure(e) => Some(e),
        }
    }
}

impl<E: Classify> Classify for CircuitBreakerError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Open { .. } => ErrorKind::CircuitOpen,
            Self::Failure(e) => e.kind(),
        }
    }
}

impl From<CircuitBreakerError<GraphvecError>> for GraphvecError {
    fn from(err: CircuitBreakerError<GraphvecError>) -> Self {
        match err {
            CircuitBreakerError::Open { name, retry_after } => {
                GraphvecError::CircuitBreakerOpen { name, retry_after }
            }
            CircuitBreakerError::Failure(e) => e,
        }
    }
}
