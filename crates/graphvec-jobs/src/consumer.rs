//! Queue consumer and acknowledgement protocol.

use crate::broker::{BrokerChannel, BrokerSession, ConnectionEvent, Delivery};
use crate::error::{JobError, JobResult};
use crate::job::{Disposition, Job, ProcessingOutcome};
use crate::metrics::JobMetrics;
use crate::processor::JobProcessor;
use crate::shutdown::ShutdownCoordinator;
use crate::stats::{StatsCounters, WorkerStats};
use futures::StreamExt;
use graphvec_config::{BrokerConfig, WorkerSettings};
use graphvec_resilience::{Sleep, TokioSleep};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Why a consume loop returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeExit {
    /// Shutdown was requested and the subscription cancelled.
    Shutdown,
    /// The broker connection was lost.
    Disconnected(String),
}

/// Subscribes to the work queue and settles every delivery.
///
/// Each delivery runs in its own task, bounded by a semaphore sized to the
/// prefetch. A delivery is settled exactly once: acked after success, a
/// terminal error, a malformed payload or exhausted retries, and acked after
/// its replacement with `retryCount + 1` has been published on requeue.
/// If that publish fails the original is nacked back onto the queue instead.
#[derive(Clone)]
pub struct JobConsumer {
    processor: Arc<JobProcessor>,
    queue: String,
    consumer_tag_prefix: String,
    dead_letter_queue: Option<String>,
    prefetch: u16,
    sleeper: Arc<dyn Sleep>,
    stats: Arc<StatsCounters>,
}

impl JobConsumer {
    /// Creates a consumer for the configured queue.
    pub fn new(processor: Arc<JobProcessor>, broker: &BrokerConfig, settings: &WorkerSettings) -> Self {
        Self {
            processor,
            queue: broker.queue_name.clone(),
            consumer_tag_prefix: broker.consumer_tag_prefix.clone(),
            dead_letter_queue: settings.dead_letter_queue.clone(),
            prefetch: settings.prefetch,
            sleeper: Arc::new(TokioSleep),
            stats: Arc::default(),
        }
    }

    /// Replaces the sleeper used for requeue backoff.
    #[must_use]
    pub fn with_sleep(mut self, sleeper: Arc<dyn Sleep>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Returns the queue this consumer reads.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Returns a snapshot of the consumer's counters.
    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }

    /// Consumes from `session` until shutdown or connection loss.
    ///
    /// On shutdown the subscription is cancelled and the call returns
    /// without waiting for in-flight jobs; draining them is the
    /// coordinator's job.
    pub async fn consume(
        &self,
        session: &mut BrokerSession,
        coordinator: &ShutdownCoordinator,
    ) -> JobResult<ConsumeExit> {
        let channel = session.channel.clone();
        let token = coordinator.token();
        let consumer_tag = format!("{}-{}", self.consumer_tag_prefix, Uuid::new_v4());

        let mut deliveries = channel.consume(&self.queue, &consumer_tag).await?;
        let permits = Arc::new(Semaphore::new(usize::from(self.prefetch.max(1))));

        info!(
            queue = %self.queue,
            consumer_tag = %consumer_tag,
            prefetch = self.prefetch,
            "Consuming jobs"
        );

        loop {
            let permit = tokio::select! {
                biased;
                () = token.cancelled() => {
                    self.cancel(channel.as_ref(), &consumer_tag).await;
                    return Ok(ConsumeExit::Shutdown);
                }
                event = session.events.recv() => return Ok(Self::disconnected(event)),
                permit = permits.clone().acquire_owned() => {
                    permit.map_err(|e| JobError::broker(format!("Worker semaphore closed: {e}")))?
                }
            };

            let delivery = tokio::select! {
                biased;
                () = token.cancelled() => {
                    self.cancel(channel.as_ref(), &consumer_tag).await;
                    return Ok(ConsumeExit::Shutdown);
                }
                event = session.events.recv() => return Ok(Self::disconnected(event)),
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => return Ok(ConsumeExit::Disconnected(e.to_string())),
                    None => return Ok(ConsumeExit::Disconnected("delivery stream ended".to_string())),
                },
            };

            let guard = coordinator.in_flight().track();
            let consumer = self.clone();
            let channel = channel.clone();
            let token = token.clone();

            tokio::spawn(async move {
                let _guard = guard;
                let _permit = permit;
                consumer.handle(channel.as_ref(), delivery, &token).await;
            });
        }
    }

    fn disconnected(event: Option<ConnectionEvent>) -> ConsumeExit {
        match event {
            Some(ConnectionEvent::Disconnected { reason }) => ConsumeExit::Disconnected(reason),
            None => ConsumeExit::Disconnected("connection event channel closed".to_string()),
        }
    }

    async fn cancel(&self, channel: &dyn BrokerChannel, consumer_tag: &str) {
        info!(consumer_tag = %consumer_tag, "Cancelling subscription");
        if let Err(e) = channel.cancel(consumer_tag).await {
            warn!(consumer_tag = %consumer_tag, error = %e, "Failed to cancel subscription");
        }
    }

    /// Processes one delivery and settles it.
    async fn handle(&self, channel: &dyn BrokerChannel, delivery: Delivery, shutdown: &CancellationToken) {
        let tag = delivery.tag;
        StatsCounters::bump(&self.stats.received);
        JobMetrics::job_received(&self.queue);

        let job = match Job::decode(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(delivery_tag = tag, error = %e, "Discarding malformed job payload");
                StatsCounters::bump(&self.stats.malformed);
                JobMetrics::job_malformed(&self.queue);
                self.ack(channel, tag).await;
                return;
            }
        };

        if delivery.redelivered {
            debug!(delivery_tag = tag, entity_id = %job.entity_id, "Processing redelivered job");
        }

        let settled = match self.processor.process(&job).await {
            ProcessingOutcome::Acked(Disposition::Succeeded) => {
                StatsCounters::bump(&self.stats.succeeded);
                true
            }
            ProcessingOutcome::Acked(Disposition::Discarded) => {
                StatsCounters::bump(&self.stats.discarded);
                true
            }
            ProcessingOutcome::Acked(Disposition::Exhausted) => {
                StatsCounters::bump(&self.stats.exhausted);
                self.dead_letter(channel, &job).await
            }
            ProcessingOutcome::Requeued(next_attempt) => {
                let requeued = self.requeue(channel, &job, next_attempt, shutdown).await;
                if requeued {
                    StatsCounters::bump(&self.stats.requeued);
                }
                requeued
            }
        };

        if settled {
            self.ack(channel, tag).await;
        } else {
            self.nack(channel, tag).await;
        }
    }

    /// Waits out the backoff, then publishes the job with its next attempt.
    ///
    /// Shutdown cuts the wait short so the drain is not held up by backoff.
    async fn requeue(
        &self,
        channel: &dyn BrokerChannel,
        job: &Job,
        next_attempt: u32,
        shutdown: &CancellationToken,
    ) -> bool {
        let delay = self.processor.retry_policy().next_delay(next_attempt);
        info!(
            entity_type = %job.entity_kind,
            entity_id = %job.entity_id,
            attempt = next_attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Requeueing job"
        );

        tokio::select! {
            () = shutdown.cancelled() => {
                debug!(entity_id = %job.entity_id, "Shutdown requested, requeueing without backoff");
            }
            () = self.sleeper.sleep(delay) => {}
        }

        let retry = job.clone().with_attempt(next_attempt);
        match self.publish(channel, &self.queue, &retry).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    entity_id = %job.entity_id,
                    attempt = next_attempt,
                    error = %e,
                    "Failed to republish job"
                );
                false
            }
        }
    }

    /// Routes an exhausted job to the dead letter queue, if one is configured.
    async fn dead_letter(&self, channel: &dyn BrokerChannel, job: &Job) -> bool {
        let Some(dlq) = self.dead_letter_queue.as_deref() else {
            warn!(
                entity_type = %job.entity_kind,
                entity_id = %job.entity_id,
                attempt = job.attempt,
                "Dropping job after exhausting retries"
            );
            return true;
        };

        match self.publish(channel, dlq, job).await {
            Ok(()) => {
                warn!(
                    entity_type = %job.entity_kind,
                    entity_id = %job.entity_id,
                    attempt = job.attempt,
                    queue = %dlq,
                    "Job dead-lettered"
                );
                StatsCounters::bump(&self.stats.dead_lettered);
                JobMetrics::job_dead_lettered(dlq);
                true
            }
            Err(e) => {
                error!(
                    entity_id = %job.entity_id,
                    queue = %dlq,
                    error = %e,
                    "Failed to dead-letter job"
                );
                false
            }
        }
    }

    async fn publish(&self, channel: &dyn BrokerChannel, queue: &str, job: &Job) -> JobResult<()> {
        let payload = job.encode()?;
        channel.publish(queue, &payload).await
    }

    async fn ack(&self, channel: &dyn BrokerChannel, tag: u64) {
        if let Err(e) = channel.ack(tag).await {
            error!(delivery_tag = tag, error = %e, "Failed to ack delivery");
        }
    }

    async fn nack(&self, channel: &dyn BrokerChannel, tag: u64) {
        if let Err(e) = channel.nack(tag, true).await {
            error!(delivery_tag = tag, error = %e, "Failed to nack delivery");
        }
    }
}

impl std::fmt::Debug for JobConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobConsumer")
            .field("queue", &self.queue)
            .field("prefetch", &self.prefetch)
            .field("dead_letter_queue", &self.dead_letter_queue)
            .finish_non_exhaustive()
    }
}
