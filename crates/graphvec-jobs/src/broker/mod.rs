//! Message broker abstraction.
//!
//! A [`Broker`] opens sessions; each [`BrokerSession`] owns one channel and a
//! control receiver on which connection loss arrives as a message.

mod amqp;
mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

use crate::error::JobResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A message delivered to a consumer, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped delivery tag.
    pub tag: u64,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
}

/// Stream of deliveries for one subscription. Ends when the subscription
/// is cancelled or the channel is lost.
pub type DeliveryStream = BoxStream<'static, JobResult<Delivery>>;

/// Control messages from the broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection was closed or failed.
    Disconnected { reason: String },
}

/// Declaration of the work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub name: String,
    pub durable: bool,
    /// Per-message TTL in milliseconds.
    pub message_ttl_ms: Option<u32>,
    pub max_length: Option<u32>,
}

impl QueueTopology {
    /// Durable queue with TTL and length limits.
    pub fn durable(name: impl Into<String>, message_ttl_ms: u32, max_length: u32) -> Self {
        Self {
            name: name.into(),
            durable: true,
            message_ttl_ms: Some(message_ttl_ms),
            max_length: Some(max_length),
        }
    }
}

impl From<&graphvec_config::BrokerConfig> for QueueTopology {
    fn from(config: &graphvec_config::BrokerConfig) -> Self {
        Self::durable(config.queue_name.clone(), config.message_ttl_ms, config.max_length)
    }
}

/// An open connection plus its channel.
pub struct BrokerSession {
    pub channel: Arc<dyn BrokerChannel>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession").finish_non_exhaustive()
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connects and opens a channel.
    async fn connect(&self) -> JobResult<BrokerSession>;
}

/// Operations on an open channel. Acknowledgement is always manual.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declares (or re-declares) a queue.
    async fn declare_queue(&self, topology: &QueueTopology) -> JobResult<()>;

    /// Limits unacknowledged deliveries on this channel.
    async fn set_prefetch(&self, prefetch: u16) -> JobResult<()>;

    /// Subscribes to a queue.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> JobResult<DeliveryStream>;

    /// Acknowledges a delivery.
    async fn ack(&self, tag: u64) -> JobResult<()>;

    /// Rejects a delivery, optionally returning it to the queue.
    async fn nack(&self, tag: u64, requeue: bool) -> JobResult<()>;

    /// Publishes a persistent message to a queue through the default exchange.
    async fn publish(&self, queue: &str, payload: &[u8]) -> JobResult<()>;

    /// Cancels a subscription. No further deliveries arrive for it.
    async fn cancel(&self, consumer_tag: &str) -> JobResult<()>;

    /// Closes the channel and its connection.
    async fn close(&self) -> JobResult<()>;
}
