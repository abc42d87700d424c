//! Graphvec Jobs - embedding job worker
//!
//! Consumes embedding jobs from a durable AMQP queue and, for each one:
//! - fetches the referenced entity from the store
//! - generates an embedding through a circuit breaker
//! - writes the vector back to the entity
//! - acks the delivery, or republishes it with an incremented attempt count
//!
//! # Architecture
//!
//! ```text
//!   Broker ──► JobConsumer ──► JobProcessor ──► EntityStore (fetch)
//!     ▲             │               │
//!     │             │               ├──► CircuitBreaker ──► GenerationService
//!     │             │               │
//!     │             │               └──► EntityStore (write)
//!     │             ▼
//!     └──── ack / republish(attempt + 1)
//!
//!   Worker supervises ConnectionManager (reconnect) and ShutdownCoordinator (drain).
//! ```

pub mod broker;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod generation;
pub mod job;
pub mod metrics;
pub mod processor;
pub mod shutdown;
pub mod stats;
pub mod store;
pub mod worker;

pub use broker::{
    AmqpBroker, Broker, BrokerChannel, BrokerSession, ConnectionEvent, Delivery, DeliveryStream, MemoryBroker,
    QueueTopology,
};
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::{ConsumeExit, JobConsumer};
pub use error::{JobError, JobResult};
pub use generation::{Generation, GenerationService, OpenAiGenerator, Usage};
pub use job::{Disposition, EntityKind, Job, ProcessingOutcome};
pub use metrics::{register_metrics, JobMetrics};
pub use processor::JobProcessor;
pub use shutdown::{InFlightCounter, InFlightGuard, ShutdownCoordinator, ShutdownState};
pub use stats::WorkerStats;
pub use store::{EntityRecord, EntityStore, PgEntityStore};
pub use worker::Worker;
