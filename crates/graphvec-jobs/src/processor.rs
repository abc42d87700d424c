//! Job processing: fetch, generate, write back, classify.

use crate::generation::GenerationService;
use crate::job::{Disposition, Job, ProcessingOutcome};
use crate::metrics::JobMetrics;
use crate::store::EntityStore;
use graphvec_config::WorkerSettings;
use graphvec_core::{Classify, GraphvecError, GraphvecResult};
use graphvec_resilience::{with_timeout, CircuitBreaker, RetryPolicy};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Turns a [`Job`] into a [`ProcessingOutcome`].
///
/// Every failure is caught here and classified; nothing a single job does
/// can propagate past [`JobProcessor::process`].
pub struct JobProcessor {
    store: Arc<dyn EntityStore>,
    generator: Arc<dyn GenerationService>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    job_timeout: Duration,
}

impl JobProcessor {
    /// Creates a processor using the worker's retry and timeout settings.
    pub fn new(
        store: Arc<dyn EntityStore>,
        generator: Arc<dyn GenerationService>,
        breaker: Arc<CircuitBreaker>,
        settings: &WorkerSettings,
    ) -> Self {
        let policy = RetryPolicy {
            max_attempts: settings.max_retries,
            initial_delay: settings.retry_delay(),
            max_delay: settings.max_retry_delay(),
            multiplier: settings.retry_multiplier,
            jitter: settings.retry_jitter,
        };

        Self {
            store,
            generator,
            breaker,
            policy,
            job_timeout: settings.job_timeout(),
        }
    }

    /// Returns the job retry policy.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the circuit breaker guarding the generation service.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Processes a job and decides what happens to its delivery.
    pub async fn process(&self, job: &Job) -> ProcessingOutcome {
        let entity_type = job.entity_kind.as_str();
        let started = Instant::now();

        info!(
            entity_type,
            entity_id = %job.entity_id,
            attempt = job.attempt,
            "Processing job"
        );

        let result = with_timeout(self.job_timeout, || self.run(job)).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                info!(
                    entity_type,
                    entity_id = %job.entity_id,
                    duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    "Job completed"
                );
                JobMetrics::job_succeeded(entity_type, elapsed);
                ProcessingOutcome::Acked(Disposition::Succeeded)
            }
            Err(e) => self.classify(job, &e, elapsed),
        }
    }

    fn classify(&self, job: &Job, err: &GraphvecError, elapsed: Duration) -> ProcessingOutcome {
        let entity_type = job.entity_kind.as_str();
        let kind = err.kind();

        if self.policy.should_retry(err, job.attempt) {
            let next_attempt = job.attempt.saturating_add(1);
            warn!(
                entity_type,
                entity_id = %job.entity_id,
                attempt = job.attempt,
                next_attempt,
                kind = %kind,
                error = %err,
                "Job failed, requeueing"
            );
            JobMetrics::job_requeued(entity_type, kind, elapsed);
            ProcessingOutcome::Requeued(next_attempt)
        } else if err.is_retryable() {
            error!(
                entity_type,
                entity_id = %job.entity_id,
                attempt = job.attempt,
                max_retries = self.policy.max_attempts,
                kind = %kind,
                error = %err,
                "Job exhausted its retries"
            );
            JobMetrics::job_exhausted(entity_type, kind, elapsed);
            ProcessingOutcome::Acked(Disposition::Exhausted)
        } else {
            error!(
                entity_type,
                entity_id = %job.entity_id,
                attempt = job.attempt,
                kind = %kind,
                error = %err,
                "Job failed permanently"
            );
            JobMetrics::job_discarded(entity_type, kind, elapsed);
            ProcessingOutcome::Acked(Disposition::Discarded)
        }
    }

    async fn run(&self, job: &Job) -> GraphvecResult<()> {
        let record = self.store.fetch(job.entity_kind, &job.entity_id).await?;

        let text = record.embedding_text().ok_or_else(|| {
            GraphvecError::invalid_input(format!(
                "{} {} has no name or description to embed",
                job.entity_kind, job.entity_id
            ))
        })?;

        // Only retryable errors count as breaker failures.
        let generation = self
            .breaker
            .execute(|| async {
                match self.generator.generate(&text).await {
                    Err(e) if !e.is_retryable() => Ok(Err(e)),
                    other => other.map(Ok),
                }
            })
            .await??;

        debug!(
            entity_id = %job.entity_id,
            dimension = generation.vector.len(),
            total_tokens = generation.usage.total_tokens,
            "Embedding generated"
        );

        self.store
            .write_embedding(job.entity_kind, &job.entity_id, &generation.vector, self.generator.model())
            .await
    }
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor")
            .field("breaker", &self.breaker.name())
            .field("policy", &self.policy)
            .field("job_timeout", &self.job_timeout)
            .finish_non_exhaustive()
    }
}
