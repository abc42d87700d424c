//! Graceful shutdown with bounded in-flight drain.

use crate::metrics::JobMetrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Shared count of jobs being processed.
#[derive(Debug, Clone, Default)]
pub struct InFlightCounter(Arc<AtomicUsize>);

impl InFlightCounter {
    /// Creates a counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a job as in flight until the returned guard is dropped.
    #[must_use]
    pub fn track(&self) -> InFlightGuard {
        let count = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        JobMetrics::in_flight(count);
        InFlightGuard(self.0.clone())
    }

    /// Returns the number of jobs in flight.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight count on drop.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let count = self.0.fetch_sub(1, Ordering::SeqCst) - 1;
        JobMetrics::in_flight(count);
    }
}

/// Coordinates `Running -> Draining -> Stopped`.
///
/// The cancellation token is the draining flag: the consumer stops taking
/// deliveries and the reconnect loop stops retrying once it is cancelled.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    in_flight: InFlightCounter,
    timeout: Duration,
    poll_interval: Duration,
    state: watch::Sender<ShutdownState>,
}

impl ShutdownCoordinator {
    /// Creates a coordinator driven by `token`.
    pub fn new(token: CancellationToken, in_flight: InFlightCounter, timeout: Duration, poll_interval: Duration) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            token,
            in_flight,
            timeout,
            poll_interval,
            state,
        }
    }

    /// Returns the cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns true once shutdown has been requested.
    pub fn is_draining(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns the in-flight counter.
    pub fn in_flight(&self) -> &InFlightCounter {
        &self.in_flight
    }

    /// Returns the current state.
    pub fn state(&self) -> ShutdownState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// Enters `Draining`, cancelling the token if nobody has yet.
    pub fn begin_drain(&self) {
        self.token.cancel();
        if self.state() == ShutdownState::Running {
            info!(in_flight = self.in_flight.get(), "Draining in-flight jobs");
            self.state.send_replace(ShutdownState::Draining);
        }
    }

    /// Waits up to the drain timeout for in-flight jobs to finish.
    ///
    /// Returns `false` if jobs were still running when the timeout elapsed.
    pub async fn drain(&self) -> bool {
        self.begin_drain();
        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = self.in_flight.get();
            if remaining == 0 {
                info!("All in-flight jobs finished");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    in_flight = remaining,
                    timeout_secs = self.timeout.as_secs(),
                    "Forced shutdown with jobs still in flight"
                );
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Enters `Stopped`.
    pub fn mark_stopped(&self) {
        self.state.send_replace(ShutdownState::Stopped);
        info!("Worker stopped");
    }
}
