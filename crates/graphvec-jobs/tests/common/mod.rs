//! Common test infrastructure for worker integration tests.
//!
//! Provides a fake entity store and generation service, a sleeper that
//! records delays without waiting, and helpers to run a [`Worker`] against
//! the in-memory broker.

#![allow(dead_code)]

use async_trait::async_trait;
use graphvec_config::{AppConfig, WorkerSettings};
use graphvec_core::{GraphvecError, GraphvecResult};
use graphvec_jobs::{
    EntityKind, EntityRecord, EntityStore, Generation, GenerationService, JobResult, MemoryBroker, Usage, Worker,
};
use graphvec_resilience::Sleep;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const QUEUE: &str = "embedding-jobs";

/// Worker configuration with deterministic backoff.
pub fn test_config() -> AppConfig {
    AppConfig {
        worker: WorkerSettings {
            retry_jitter: false,
            initial_connect_attempts: 3,
            shutdown_timeout_secs: 5,
            drain_poll_interval_ms: 10,
            ..WorkerSettings::default()
        },
        ..AppConfig::default()
    }
}

/// Entity store backed by a map.
#[derive(Default)]
pub struct FakeStore {
    records: Mutex<HashMap<String, EntityRecord>>,
    pub writes: Mutex<Vec<(EntityKind, String, Vec<f32>)>>,
    pub closed: AtomicBool,
}

impl FakeStore {
    pub fn with_entities<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        let store = Self::default();
        for id in ids {
            store.insert(id, Some(&format!("Entity {id}")), Some("Seeded for tests"));
        }
        store
    }

    pub fn insert(&self, id: &str, name: Option<&str>, description: Option<&str>) {
        self.records.lock().insert(
            id.to_string(),
            EntityRecord {
                id: id.to_string(),
                name: name.map(str::to_string),
                description: description.map(str::to_string),
            },
        );
    }

    pub fn written_ids(&self) -> Vec<String> {
        self.writes.lock().iter().map(|(_, id, _)| id.clone()).collect()
    }
}

#[async_trait]
impl EntityStore for FakeStore {
    async fn fetch(&self, kind: EntityKind, id: &str) -> GraphvecResult<EntityRecord> {
        self.records
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| GraphvecError::not_found(kind.as_str(), id))
    }

    async fn write_embedding(&self, kind: EntityKind, id: &str, embedding: &[f32], _model: &str) -> GraphvecResult<()> {
        self.writes.lock().push((kind, id.to_string(), embedding.to_vec()));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

type FailureScript = Box<dyn Fn(&str, u32) -> Option<GraphvecError> + Send + Sync>;

/// Generation service whose failures are decided by a script over
/// `(text, call number)`.
pub struct FakeGenerator {
    script: FailureScript,
    delay: Duration,
    pub calls: AtomicU32,
    active: AtomicU32,
    pub max_concurrent: AtomicU32,
}

impl FakeGenerator {
    pub fn new(script: impl Fn(&str, u32) -> Option<GraphvecError> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            active: AtomicU32::new(0),
            max_concurrent: AtomicU32::new(0),
        }
    }

    pub fn healthy() -> Self {
        Self::new(|_, _| None)
    }

    /// Takes `delay` of real time per call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationService for FakeGenerator {
    async fn generate(&self, text: &str) -> GraphvecResult<Generation> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match (self.script)(text, call) {
            Some(err) => Err(err),
            None => Ok(Generation {
                vector: vec![0.25, 0.5, 0.75],
                usage: Usage {
                    prompt_tokens: 4,
                    total_tokens: 4,
                },
            }),
        }
    }

    fn model(&self) -> &str {
        "fake-embedding"
    }
}

pub fn rate_limited() -> GraphvecError {
    GraphvecError::RateLimited {
        service: "generation".to_string(),
        message: "Rate limit reached for requests".to_string(),
    }
}

/// Records requested delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleep {
    delays: Mutex<Vec<Duration>>,
    hold_next: AtomicBool,
}

impl RecordingSleep {
    /// Makes the next sleep never finish on its own.
    pub fn hold_next(&self) {
        self.hold_next.store(true, Ordering::SeqCst);
    }

    pub fn delays_ms(&self) -> Vec<u64> {
        self.delays
            .lock()
            .iter()
            .map(|d| u64::try_from(d.as_millis()).unwrap())
            .collect()
    }
}

#[async_trait]
impl Sleep for RecordingSleep {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().push(duration);
        if self.hold_next.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;
    }
}

/// A worker running on a background task.
pub struct Harness {
    pub broker: MemoryBroker,
    pub store: Arc<FakeStore>,
    pub generator: Arc<FakeGenerator>,
    pub sleeper: Arc<RecordingSleep>,
    pub worker: Arc<Worker>,
    pub token: CancellationToken,
    handle: Option<JoinHandle<JobResult<()>>>,
}

impl Harness {
    pub fn new(config: &AppConfig, broker: MemoryBroker, store: FakeStore, generator: FakeGenerator) -> Self {
        let store = Arc::new(store);
        let generator = Arc::new(generator);
        let sleeper = Arc::new(RecordingSleep::default());
        let worker = Worker::new(config, Arc::new(broker.clone()), store.clone(), generator.clone())
            .with_sleep(sleeper.clone());

        Self {
            broker,
            store,
            generator,
            sleeper,
            worker: Arc::new(worker),
            token: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn start(&mut self) {
        let worker = self.worker.clone();
        let token = self.token.clone();
        self.handle = Some(tokio::spawn(async move { worker.run(token).await }));
    }

    /// Cancels the worker and waits for `run` to return.
    pub async fn stop(&mut self) -> JobResult<()> {
        self.token.cancel();
        let handle = self.handle.take().expect("worker not started");
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker did not stop")
            .expect("worker task panicked")
    }

    /// Waits for `run` to return without cancelling.
    pub async fn join(&mut self) -> JobResult<()> {
        let handle = self.handle.take().expect("worker not started");
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker did not finish")
            .expect("worker task panicked")
    }
}

/// Polls `condition` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}
