//! AMQP 0-9-1 broker backed by lapin.

use super::{Broker, BrokerChannel, BrokerSession, ConnectionEvent, Delivery, DeliveryStream, QueueTopology};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PERSISTENT: u8 = 2;

/// Broker connecting to an AMQP server.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    /// Creates a broker for the given `amqp://` or `amqps://` URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> JobResult<BrokerSession> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| JobError::Disconnected(e.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            warn!(error = %err, "Broker connection error");
            let _ = events_tx.send(ConnectionEvent::Disconnected {
                reason: err.to_string(),
            });
        });

        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;
        info!(channel_id = channel.id(), "Connected to broker");

        Ok(BrokerSession {
            channel: Arc::new(AmqpChannel { connection, channel }),
            events: events_rx,
        })
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

/// Accepts only a positive confirm for a message that was routed to a queue.
fn check_confirmation(queue: &str, confirmation: Confirmation) -> JobResult<()> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(_)) => Err(JobError::broker(format!("Message to '{queue}' was returned unroutable"))),
        Confirmation::Nack(_) => Err(JobError::broker(format!("Broker rejected message to '{queue}'"))),
        Confirmation::NotRequested => Err(JobError::broker(format!(
            "Publish to '{queue}' was not confirmed; channel is not in confirm mode"
        ))),
    }
}

fn queue_arguments(topology: &QueueTopology) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(ttl) = topology.message_ttl_ms {
        args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
    }
    if let Some(max_length) = topology.max_length {
        args.insert("x-max-length".into(), AMQPValue::LongUInt(max_length));
    }
    args
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, topology: &QueueTopology) -> JobResult<()> {
        let queue = self
            .channel
            .queue_declare(
                &topology.name,
                QueueDeclareOptions {
                    durable: topology.durable,
                    ..QueueDeclareOptions::default()
                },
                queue_arguments(topology),
            )
            .await?;

        debug!(
            queue = %topology.name,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue declared"
        );
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> JobResult<()> {
        self.channel.basic_qos(prefetch, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> JobResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|d| Delivery {
                        tag: d.delivery_tag,
                        payload: d.data,
                        redelivered: d.redelivered,
                    })
                    .map_err(|e| JobError::Disconnected(e.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, tag: u64) -> JobResult<()> {
        self.channel.basic_ack(tag, BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, tag: u64, requeue: bool) -> JobResult<()> {
        self.channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> JobResult<()> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;
        check_confirmation(queue, confirmation)
    }

    async fn cancel(&self, consumer_tag: &str) -> JobResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> JobResult<()> {
        self.channel.close(200, "Worker shutting down").await?;
        self.connection.close(200, "Worker shutting down").await?;
        info!("Broker connection closed");
        Ok(())
    }
}
