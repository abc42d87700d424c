//! End-to-end worker behaviour against the in-memory broker.
//!
//! Each test wires a real [`Worker`] (connection manager, consumer and
//! processor) to a `MemoryBroker`, a fake store and a scripted generation
//! service, then inspects what was acked, nacked and published.

mod common;

use common::{rate_limited, test_config, wait_until, FakeGenerator, FakeStore, Harness, QUEUE};
use graphvec_config::{AppConfig, WorkerSettings};
use graphvec_jobs::{ConnectionState, EntityKind, Job, MemoryBroker};
use std::time::Duration;

fn published_attempts(broker: &MemoryBroker, queue: &str) -> Vec<u32> {
    broker
        .published(queue)
        .iter()
        .map(|payload| Job::decode(payload).expect("published payload is a job").attempt)
        .collect()
}

#[tokio::test]
async fn test_rate_limited_job_is_republished_with_next_attempt() {
    let broker = MemoryBroker::new();
    broker.enqueue(
        QUEUE,
        r#"{"entityType":"node","entityId":"n1","timestamp":"2024-05-01T12:00:00Z","retryCount":0}"#,
    );

    let generator = FakeGenerator::new(|_, call| (call == 1).then(rate_limited));
    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::with_entities(["n1"]), generator);
    harness.start();

    wait_until("original and retry acked", || broker.acked().len() == 2).await;
    harness.stop().await.unwrap();

    let published = broker.published(QUEUE);
    assert_eq!(published.len(), 1);
    let retry = Job::decode(&published[0]).unwrap();
    assert_eq!(retry.attempt, 1);
    assert_eq!(retry.entity_kind, EntityKind::Node);
    assert_eq!(retry.entity_id, "n1");

    assert_eq!(harness.sleeper.delays_ms(), vec![3000]);
    assert_eq!(harness.store.written_ids(), vec!["n1"]);

    let stats = harness.worker.stats();
    assert_eq!(stats.received, 2);
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.succeeded, 1);
}

#[tokio::test]
async fn test_job_at_max_retries_is_acked_without_republish() {
    let broker = MemoryBroker::new();
    broker.enqueue(QUEUE, r#"{"entityType":"node","entityId":"n1","retryCount":10}"#);

    let generator = FakeGenerator::new(|_, _| Some(rate_limited()));
    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::with_entities(["n1"]), generator);
    harness.start();

    wait_until("delivery acked", || broker.acked().len() == 1).await;
    harness.stop().await.unwrap();

    assert!(broker.published(QUEUE).is_empty());
    assert!(broker.nacked().is_empty());
    assert_eq!(harness.worker.stats().exhausted, 1);
    assert!(harness.store.written_ids().is_empty());
}

#[tokio::test]
async fn test_missing_entity_is_acked_immediately() {
    let broker = MemoryBroker::new();
    broker.enqueue(QUEUE, r#"{"entityType":"node","entityId":"missing","retryCount":3}"#);

    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::default(), FakeGenerator::healthy());
    harness.start();

    wait_until("delivery acked", || broker.acked().len() == 1).await;
    harness.stop().await.unwrap();

    assert!(broker.published(QUEUE).is_empty());
    assert_eq!(harness.generator.calls(), 0);
    assert_eq!(harness.worker.stats().discarded, 1);
    assert!(harness.sleeper.delays_ms().is_empty());
}

#[tokio::test]
async fn test_entity_without_text_is_discarded() {
    let broker = MemoryBroker::new();
    let store = FakeStore::default();
    store.insert("t1", None, Some("   "));
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::NodeType, "t1")).unwrap();

    let mut harness = Harness::new(&test_config(), broker.clone(), store, FakeGenerator::healthy());
    harness.start();

    wait_until("delivery acked", || broker.acked().len() == 1).await;
    harness.stop().await.unwrap();

    assert_eq!(harness.generator.calls(), 0);
    assert_eq!(harness.worker.stats().discarded, 1);
}

#[tokio::test]
async fn test_reconnects_with_backoff_and_resumes_consuming() {
    let broker = MemoryBroker::new();
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, "n1")).unwrap();

    let mut harness = Harness::new(
        &test_config(),
        broker.clone(),
        FakeStore::with_entities(["n1", "n2"]),
        FakeGenerator::healthy(),
    );
    harness.start();

    wait_until("first job acked", || broker.acked().len() == 1).await;
    assert_eq!(harness.worker.connection_state(), ConnectionState::Connected);

    broker.refuse_connects(3);
    broker.sever();
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, "n2")).unwrap();

    wait_until("second job acked", || broker.acked().len() == 2).await;
    assert_eq!(harness.worker.connection_state(), ConnectionState::Connected);
    harness.stop().await.unwrap();

    assert_eq!(harness.sleeper.delays_ms(), vec![3000, 6000, 12_000, 24_000]);
    assert_eq!(broker.connect_attempts(), 5);
    assert_eq!(broker.declared().len(), 2);
    assert_eq!(broker.prefetch(), Some(1));
    assert_eq!(harness.store.written_ids(), vec!["n1", "n2"]);
}

#[tokio::test]
async fn test_ended_subscription_closes_session_before_reconnecting() {
    let broker = MemoryBroker::new();
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, "n1")).unwrap();

    let mut harness = Harness::new(
        &test_config(),
        broker.clone(),
        FakeStore::with_entities(["n1", "n2"]),
        FakeGenerator::healthy(),
    );
    harness.start();

    wait_until("first job acked", || broker.acked().len() == 1).await;
    broker.cancel_consumers();

    wait_until("resubscribed", || broker.connect_attempts() == 2 && broker.consumer_count() == 1).await;
    assert_eq!(broker.open_sessions(), 1);

    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, "n2")).unwrap();
    wait_until("second job acked", || broker.acked().len() == 2).await;
    harness.stop().await.unwrap();

    assert_eq!(broker.open_sessions(), 0);
    assert_eq!(harness.sleeper.delays_ms(), vec![3000]);
    assert_eq!(harness.store.written_ids(), vec!["n1", "n2"]);
}

#[tokio::test]
async fn test_disconnect_noticed_while_backoff_holds_every_slot() {
    let broker = MemoryBroker::new();
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, "n1")).unwrap();

    let generator = FakeGenerator::new(|_, call| (call == 1).then(rate_limited));
    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::with_entities(["n1"]), generator);
    harness.sleeper.hold_next();
    harness.start();

    wait_until("requeue backoff started", || harness.sleeper.delays_ms() == vec![3000]).await;
    assert_eq!(harness.worker.in_flight(), 1);
    broker.sever();

    wait_until("reconnected", || broker.connect_attempts() == 2 && broker.consumer_count() == 1).await;
    wait_until("redelivery written", || harness.store.written_ids() == vec!["n1"]).await;
    wait_until("redelivery acked", || broker.acked().len() == 1).await;
    harness.stop().await.unwrap();

    assert_eq!(harness.sleeper.delays_ms(), vec![3000, 3000]);
    assert!(broker.published(QUEUE).is_empty());
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_in_flight_job_is_redelivered_after_disconnect() {
    let broker = MemoryBroker::new();
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, "n1")).unwrap();

    let generator = FakeGenerator::healthy().with_delay(Duration::from_millis(200));
    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::with_entities(["n1"]), generator);
    harness.start();

    wait_until("job in flight", || harness.worker.in_flight() == 1).await;
    broker.sever();

    wait_until("job written twice", || harness.store.written_ids().len() == 2).await;
    wait_until("redelivery acked", || broker.acked().len() == 1).await;
    harness.stop().await.unwrap();

    assert_eq!(harness.store.written_ids(), vec!["n1", "n1"]);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_every_delivery_is_acked_exactly_once() {
    let broker = MemoryBroker::new();
    broker.enqueue(QUEUE, r#"{"entityType":"node","entityId":"ok"}"#);
    broker.enqueue(QUEUE, r#"{"entityType":"edge","entityId":"missing"}"#);
    broker.enqueue(QUEUE, "{not json");
    broker.enqueue(QUEUE, r#"{"entityType":"node","entityId":"hot","retryCount":10}"#);
    broker.enqueue(QUEUE, r#"{"entityType":"node","entityId":"hot","retryCount":9}"#);

    let config = AppConfig {
        worker: WorkerSettings {
            prefetch: 4,
            ..test_config().worker
        },
        ..test_config()
    };
    let generator = FakeGenerator::new(|text, _| text.contains("hot").then(rate_limited));
    let mut harness = Harness::new(&config, broker.clone(), FakeStore::with_entities(["ok", "hot"]), generator);
    harness.start();

    // five originals plus the one retry republished from attempt 9
    wait_until("all deliveries settled", || {
        broker.acked().len() == 6 && harness.worker.in_flight() == 0
    })
    .await;
    harness.stop().await.unwrap();

    assert!(broker.nacked().is_empty());
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_len(QUEUE), 0);
    assert_eq!(published_attempts(&broker, QUEUE), vec![10]);

    let stats = harness.worker.stats();
    assert_eq!(stats.received, 6);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.exhausted, 2);
}

#[tokio::test]
async fn test_attempt_increments_by_one_until_exhausted() {
    let broker = MemoryBroker::new();
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Edge, "hot")).unwrap();

    let config = AppConfig {
        worker: WorkerSettings {
            max_retries: 3,
            ..test_config().worker
        },
        ..test_config()
    };
    let generator = FakeGenerator::new(|_, _| Some(rate_limited()));
    let mut harness = Harness::new(&config, broker.clone(), FakeStore::with_entities(["hot"]), generator);
    harness.start();

    wait_until("retries exhausted", || harness.worker.stats().exhausted == 1).await;
    wait_until("all deliveries acked", || broker.acked().len() == 4).await;
    harness.stop().await.unwrap();

    assert_eq!(published_attempts(&broker, QUEUE), vec![1, 2, 3]);
    assert_eq!(harness.sleeper.delays_ms(), vec![3000, 6000, 12_000]);
    assert_eq!(harness.generator.calls(), 4);
}

#[tokio::test]
async fn test_malformed_payloads_are_acked_and_dropped() {
    let broker = MemoryBroker::new();
    broker.enqueue(QUEUE, "{not json");
    broker.enqueue(QUEUE, r#"{"entityType":"planet","entityId":"x"}"#);
    broker.enqueue(QUEUE, r#"{"entityId":"no-kind"}"#);

    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::default(), FakeGenerator::healthy());
    harness.start();

    wait_until("deliveries acked", || broker.acked().len() == 3).await;
    harness.stop().await.unwrap();

    assert_eq!(harness.worker.stats().malformed, 3);
    assert_eq!(harness.generator.calls(), 0);
    assert!(broker.published(QUEUE).is_empty());
}

#[tokio::test]
async fn test_exhausted_job_routed_to_dead_letter_queue() {
    const DEAD: &str = "embedding-jobs.dead";

    let broker = MemoryBroker::new();
    broker.enqueue(QUEUE, r#"{"entityType":"node","entityId":"n1","retryCount":10}"#);

    let config = AppConfig {
        worker: WorkerSettings {
            dead_letter_queue: Some(DEAD.to_string()),
            ..test_config().worker
        },
        ..test_config()
    };
    let generator = FakeGenerator::new(|_, _| Some(rate_limited()));
    let mut harness = Harness::new(&config, broker.clone(), FakeStore::with_entities(["n1"]), generator);
    harness.start();

    wait_until("delivery acked", || broker.acked().len() == 1).await;
    harness.stop().await.unwrap();

    assert_eq!(published_attempts(&broker, DEAD), vec![10]);
    assert!(broker.published(QUEUE).is_empty());
    assert_eq!(broker.queue_len(DEAD), 1);

    let stats = harness.worker.stats();
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.dead_lettered, 1);
}

#[tokio::test]
async fn test_failed_republish_returns_delivery_to_queue() {
    let broker = MemoryBroker::new();
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, "n1")).unwrap();
    broker.fail_publishes(1);

    let generator = FakeGenerator::new(|_, call| (call == 1).then(rate_limited));
    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::with_entities(["n1"]), generator);
    harness.start();

    wait_until("redelivery acked", || broker.acked().len() == 1).await;
    harness.stop().await.unwrap();

    let nacked = broker.nacked();
    assert_eq!(nacked.len(), 1);
    assert!(nacked[0].1, "nack must requeue");
    assert!(broker.published(QUEUE).is_empty());

    let stats = harness.worker.stats();
    assert_eq!(stats.requeued, 0);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(harness.store.written_ids(), vec!["n1"]);
}

#[tokio::test]
async fn test_prefetch_one_processes_sequentially() {
    let broker = MemoryBroker::new();
    for id in ["a", "b", "c"] {
        broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, id)).unwrap();
    }

    let generator = FakeGenerator::healthy().with_delay(Duration::from_millis(20));
    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::with_entities(["a", "b", "c"]), generator);
    harness.start();

    wait_until("all jobs acked", || broker.acked().len() == 3).await;
    harness.stop().await.unwrap();

    assert_eq!(harness.generator.max_concurrent.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(harness.store.written_ids(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_prefetch_bounds_concurrency() {
    let ids = ["a", "b", "c", "d", "e", "f"];
    let broker = MemoryBroker::new();
    for id in ids {
        broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, id)).unwrap();
    }

    let config = AppConfig {
        worker: WorkerSettings {
            prefetch: 2,
            ..test_config().worker
        },
        ..test_config()
    };
    let generator = FakeGenerator::healthy().with_delay(Duration::from_millis(30));
    let mut harness = Harness::new(&config, broker.clone(), FakeStore::with_entities(ids), generator);
    harness.start();

    wait_until("all jobs acked", || broker.acked().len() == 6).await;
    harness.stop().await.unwrap();

    assert_eq!(broker.prefetch(), Some(2));
    assert!(harness.generator.max_concurrent.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    assert_eq!(harness.worker.stats().succeeded, 6);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_job_then_closes() {
    let broker = MemoryBroker::new();
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, "slow")).unwrap();
    broker.enqueue_job(QUEUE, &Job::new(EntityKind::Node, "queued")).unwrap();

    let generator = FakeGenerator::healthy().with_delay(Duration::from_millis(300));
    let mut harness = Harness::new(
        &test_config(),
        broker.clone(),
        FakeStore::with_entities(["slow", "queued"]),
        generator,
    );
    harness.start();

    wait_until("job in flight", || harness.worker.in_flight() == 1).await;
    harness.stop().await.unwrap();

    assert_eq!(harness.worker.in_flight(), 0);
    assert_eq!(harness.store.written_ids(), vec!["slow"]);
    assert_eq!(broker.acked().len(), 1);
    assert_eq!(broker.queue_len(QUEUE), 1, "no delivery is taken after shutdown");
    assert_eq!(broker.consumer_count(), 0);
    assert_eq!(broker.open_sessions(), 0);
    assert!(harness.store.closed.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn test_startup_fails_when_broker_unreachable() {
    let broker = MemoryBroker::new();
    broker.refuse_connects(100);

    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::default(), FakeGenerator::healthy());
    harness.start();

    assert!(harness.join().await.is_err());
    assert_eq!(broker.connect_attempts(), 3);
    assert_eq!(harness.sleeper.delays_ms(), vec![3000, 6000]);
    assert_eq!(harness.worker.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_shutdown_abandons_reconnect() {
    let broker = MemoryBroker::new();
    let mut harness = Harness::new(&test_config(), broker.clone(), FakeStore::default(), FakeGenerator::healthy());
    harness.start();

    wait_until("connected", || broker.consumer_count() == 1).await;
    broker.refuse_connects(u32::MAX);
    broker.sever();
    wait_until("reconnect attempted", || broker.connect_attempts() >= 3).await;

    harness.stop().await.unwrap();
    assert_eq!(harness.worker.connection_state(), ConnectionState::Disconnected);
    assert!(harness.store.closed.load(std::sync::atomic::Ordering::SeqCst));
}
