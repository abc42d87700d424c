//! Worker supervisor.

use crate::broker::{Broker, QueueTopology};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::consumer::{ConsumeExit, JobConsumer};
use crate::error::JobResult;
use crate::generation::GenerationService;
use crate::processor::JobProcessor;
use crate::shutdown::{InFlightCounter, ShutdownCoordinator};
use crate::stats::WorkerStats;
use crate::store::EntityStore;
use graphvec_config::AppConfig;
use graphvec_resilience::{CircuitBreaker, CircuitBreakerConfig, Sleep};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Embedding worker.
///
/// Owns the single consume/reconnect loop. Cancelling the token passed to
/// [`Worker::run`] stops consumption, drains in-flight jobs up to the
/// shutdown timeout, then closes the broker before the store.
pub struct Worker {
    connection: ConnectionManager,
    consumer: JobConsumer,
    store: Arc<dyn EntityStore>,
    in_flight: InFlightCounter,
    shutdown_timeout: Duration,
    drain_poll_interval: Duration,
}

impl Worker {
    /// Wires a worker from configuration and its collaborators.
    pub fn new(
        config: &AppConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn EntityStore>,
        generator: Arc<dyn GenerationService>,
    ) -> Self {
        let settings = &config.worker;
        let breaker = Arc::new(CircuitBreaker::new(
            "generation",
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker.failure_threshold,
                success_threshold: config.circuit_breaker.half_open_success_threshold,
                cool_down: config.circuit_breaker.cool_down(),
                half_open_max_calls: config.circuit_breaker.half_open_max_calls,
            },
        ));

        let processor = Arc::new(JobProcessor::new(store.clone(), generator, breaker, settings));
        let consumer = JobConsumer::new(processor, &config.broker, settings);
        let connection = ConnectionManager::new(broker, QueueTopology::from(&config.broker), settings);

        Self {
            connection,
            consumer,
            store,
            in_flight: InFlightCounter::new(),
            shutdown_timeout: settings.shutdown_timeout(),
            drain_poll_interval: settings.drain_poll_interval(),
        }
    }

    /// Replaces the sleeper used for reconnect and requeue backoff.
    #[must_use]
    pub fn with_sleep(mut self, sleeper: Arc<dyn Sleep>) -> Self {
        self.connection = self.connection.with_sleep(sleeper.clone());
        self.consumer = self.consumer.with_sleep(sleeper);
        self
    }

    /// Returns a snapshot of the worker's counters.
    pub fn stats(&self) -> WorkerStats {
        self.consumer.stats()
    }

    /// Returns the broker connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Returns the connection manager.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// Returns the number of jobs being processed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Fails only if the broker cannot be reached at startup.
    pub async fn run(&self, shutdown: CancellationToken) -> JobResult<()> {
        let coordinator = ShutdownCoordinator::new(
            shutdown,
            self.in_flight.clone(),
            self.shutdown_timeout,
            self.drain_poll_interval,
        );

        info!(queue = %self.consumer.queue(), "Starting worker");

        let connected = tokio::select! {
            () = coordinator.token().cancelled() => None,
            result = self.connection.connect() => Some(result?),
        };

        let Some(mut session) = connected else {
            info!("Shutdown requested before the broker connected");
            self.store.close().await;
            coordinator.mark_stopped();
            return Ok(());
        };

        let mut live = true;
        loop {
            let reason = match self.consumer.consume(&mut session, &coordinator).await {
                Ok(ConsumeExit::Shutdown) => break,
                Ok(ConsumeExit::Disconnected(reason)) => reason,
                Err(e) => e.to_string(),
            };

            self.connection.mark_disconnected(&reason);
            if let Err(e) = session.channel.close().await {
                warn!(error = %e, "Failed to close broker connection before reconnecting");
            }
            match self.connection.reconnect(coordinator.token()).await {
                Some(next) => session = next,
                None => {
                    live = false;
                    break;
                }
            }
        }

        coordinator.drain().await;

        if live {
            if let Err(e) = session.channel.close().await {
                warn!(error = %e, "Failed to close broker connection");
            }
        }
        self.store.close().await;
        coordinator.mark_stopped();
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("consumer", &self.consumer)
            .field("connection", &self.connection)
            .field("in_flight", &self.in_flight.get())
            .finish_non_exhaustive()
    }
}
