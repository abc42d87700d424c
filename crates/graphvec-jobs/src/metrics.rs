//! Metrics for worker monitoring.
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the embedding process.

use graphvec_core::ErrorKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the worker.
pub mod names {
    /// Total deliveries received.
    pub const JOBS_RECEIVED_TOTAL: &str = "graphvec_jobs_received_total";
    /// Total jobs whose embedding was stored.
    pub const JOBS_SUCCEEDED_TOTAL: &str = "graphvec_jobs_succeeded_total";
    /// Total jobs republished for another attempt.
    pub const JOBS_REQUEUED_TOTAL: &str = "graphvec_jobs_requeued_total";
    /// Total jobs dropped after a terminal error.
    pub const JOBS_DISCARDED_TOTAL: &str = "graphvec_jobs_discarded_total";
    /// Total jobs that ran out of attempts.
    pub const JOBS_EXHAUSTED_TOTAL: &str = "graphvec_jobs_exhausted_total";
    /// Total exhausted jobs published to the dead letter queue.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "graphvec_jobs_dead_lettered_total";
    /// Total deliveries whose payload could not be decoded.
    pub const JOBS_MALFORMED_TOTAL: &str = "graphvec_jobs_malformed_total";
    /// Total broker reconnect attempts.
    pub const BROKER_RECONNECTS_TOTAL: &str = "graphvec_broker_reconnects_total";

    /// Jobs currently being processed.
    pub const JOBS_IN_FLIGHT: &str = "graphvec_jobs_in_flight";

    /// Job processing duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "graphvec_job_duration_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_RECEIVED_TOTAL, "Total number of deliveries received");
    describe_counter!(names::JOBS_SUCCEEDED_TOTAL, "Total number of embeddings stored");
    describe_counter!(names::JOBS_REQUEUED_TOTAL, "Total number of jobs republished for retry");
    describe_counter!(names::JOBS_DISCARDED_TOTAL, "Total number of jobs dropped after a terminal error");
    describe_counter!(names::JOBS_EXHAUSTED_TOTAL, "Total number of jobs that exhausted their retries");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs sent to the dead letter queue"
    );
    describe_counter!(names::JOBS_MALFORMED_TOTAL, "Total number of undecodable deliveries");
    describe_counter!(names::BROKER_RECONNECTS_TOTAL, "Total number of broker reconnect attempts");

    describe_gauge!(names::JOBS_IN_FLIGHT, "Current number of jobs being processed");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job processing duration in seconds");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a delivery received.
    pub fn job_received(queue: &str) {
        counter!(names::JOBS_RECEIVED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a job completed.
    pub fn job_succeeded(entity_type: &str, duration: Duration) {
        counter!(names::JOBS_SUCCEEDED_TOTAL, "entity_type" => entity_type.to_string()).increment(1);
        Self::duration(entity_type, "succeeded", duration);
    }

    /// Record a job requeued.
    pub fn job_requeued(entity_type: &str, kind: ErrorKind, duration: Duration) {
        counter!(
            names::JOBS_REQUEUED_TOTAL,
            "entity_type" => entity_type.to_string(),
            "error_kind" => kind.as_str()
        )
        .increment(1);
        Self::duration(entity_type, "requeued", duration);
    }

    /// Record a job dropped after a terminal error.
    pub fn job_discarded(entity_type: &str, kind: ErrorKind, duration: Duration) {
        counter!(
            names::JOBS_DISCARDED_TOTAL,
            "entity_type" => entity_type.to_string(),
            "error_kind" => kind.as_str()
        )
        .increment(1);
        Self::duration(entity_type, "discarded", duration);
    }

    /// Record a job that ran out of attempts.
    pub fn job_exhausted(entity_type: &str, kind: ErrorKind, duration: Duration) {
        counter!(
            names::JOBS_EXHAUSTED_TOTAL,
            "entity_type" => entity_type.to_string(),
            "error_kind" => kind.as_str()
        )
        .increment(1);
        Self::duration(entity_type, "exhausted", duration);
    }

    /// Record a job sent to the DLQ.
    pub fn job_dead_lettered(queue: &str) {
        counter!(names::JOBS_DEAD_LETTERED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record an undecodable delivery.
    pub fn job_malformed(queue: &str) {
        counter!(names::JOBS_MALFORMED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a reconnect attempt.
    pub fn broker_reconnect() {
        counter!(names::BROKER_RECONNECTS_TOTAL).increment(1);
    }

    /// Update the in-flight gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn in_flight(count: usize) {
        gauge!(names::JOBS_IN_FLIGHT).set(count as f64);
    }

    fn duration(entity_type: &str, outcome: &'static str, duration: Duration) {
        histogram!(
            names::JOB_DURATION_SECONDS,
            "entity_type" => entity_type.to_string(),
            "outcome" => outcome
        )
        .record(duration.as_secs_f64());
    }
}
