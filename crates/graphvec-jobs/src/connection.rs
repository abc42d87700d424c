//! Broker connection lifecycle.

use crate::broker::{Broker, BrokerSession, QueueTopology};
use crate::error::JobResult;
use crate::metrics::JobMetrics;
use graphvec_config::WorkerSettings;
use graphvec_resilience::{RetryPolicy, Sleep, TokioSleep};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns broker connects and reconnects.
///
/// Every successful connect re-declares the work queue and re-applies the
/// prefetch limit before the session is handed out. Reconnecting is a
/// method the supervisor awaits, so only one reconnect loop can run.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    topology: QueueTopology,
    prefetch: u16,
    startup_policy: RetryPolicy,
    reconnect_policy: RetryPolicy,
    sleeper: Arc<dyn Sleep>,
    state: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    /// Creates a manager for the given broker and queue.
    pub fn new(broker: Arc<dyn Broker>, topology: QueueTopology, settings: &WorkerSettings) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let reconnect_policy = RetryPolicy::unbounded(settings.retry_delay(), settings.max_retry_delay());

        Self {
            broker,
            topology,
            prefetch: settings.prefetch,
            startup_policy: RetryPolicy {
                max_attempts: settings.initial_connect_attempts,
                ..reconnect_policy.clone()
            },
            reconnect_policy,
            sleeper: Arc::new(TokioSleep),
            state,
        }
    }

    /// Replaces the sleeper used between connection attempts.
    #[must_use]
    pub fn with_sleep(mut self, sleeper: Arc<dyn Sleep>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Returns the delay the reconnect loop waits before the given attempt.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.reconnect_policy.next_delay(attempt)
    }

    /// Connects at startup, giving up after the configured number of attempts.
    pub async fn connect(&self) -> JobResult<BrokerSession> {
        let result = self
            .startup_policy
            .execute_with_sleep(self.sleeper.as_ref(), || self.establish())
            .await;

        if let Err(e) = &result {
            error!(
                attempts = self.startup_policy.max_attempts,
                error = %e,
                "Broker unreachable at startup"
            );
        }
        result
    }

    /// Records that the current session is gone.
    pub fn mark_disconnected(&self, reason: &str) {
        warn!(reason = %reason, "Broker connection lost");
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Reconnects with capped exponential backoff until it succeeds.
    ///
    /// Returns `None` if `shutdown` is cancelled first.
    pub async fn reconnect(&self, shutdown: &CancellationToken) -> Option<BrokerSession> {
        let mut attempt: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, abandoning reconnect");
                return None;
            }

            attempt = attempt.saturating_add(1);
            let delay = self.reconnect_policy.next_delay(attempt);
            info!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconnecting to broker"
            );
            JobMetrics::broker_reconnect();

            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, abandoning reconnect");
                    return None;
                }
                () = self.sleeper.sleep(delay) => {}
            }

            match self.establish().await {
                Ok(session) => {
                    info!(attempt, "Reconnected to broker");
                    return Some(session);
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }
    }

    async fn establish(&self) -> JobResult<BrokerSession> {
        self.state.send_replace(ConnectionState::Connecting);

        match self.open().await {
            Ok(session) => {
                self.state.send_replace(ConnectionState::Connected);
                Ok(session)
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open(&self) -> JobResult<BrokerSession> {
        let session = self.broker.connect().await?;
        session.channel.declare_queue(&self.topology).await?;
        session.channel.set_prefetch(self.prefetch).await?;

        info!(
            queue = %self.topology.name,
            prefetch = self.prefetch,
            "Broker channel ready"
        );
        Ok(session)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("queue", &self.topology.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
