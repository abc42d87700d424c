//! Worker statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of worker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Deliveries received.
    pub received: u64,
    /// Jobs whose embedding was stored.
    pub succeeded: u64,
    /// Jobs republished for another attempt.
    pub requeued: u64,
    /// Jobs dropped after a terminal error.
    pub discarded: u64,
    /// Jobs that ran out of attempts.
    pub exhausted: u64,
    /// Exhausted jobs published to the dead letter queue.
    pub dead_lettered: u64,
    /// Deliveries whose payload could not be decoded.
    pub malformed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub received: AtomicU64,
    pub succeeded: AtomicU64,
    pub requeued: AtomicU64,
    pub discarded: AtomicU64,
    pub exhausted: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub malformed: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}
