//! Broker Client: typed, durable, at-least-once publish/subscribe.
//!
//! Queues are durable, non-exclusive, non-auto-delete. Consumers get
//! prefetch=1 and manual ack by default; handlers decide Ack, NackRequeue,
//! or NackDrop per message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tracing::{error, warn};

/// Delay between reconnect attempts when the broker connection is lost.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// A single broker message, handed to the consumer with its acker attached.
/// Dropping a `Delivery` without acking/nacking leaves the message
/// unacknowledged — callers must always call one of the two.
pub struct Delivery {
    pub payload: Vec<u8>,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

#[async_trait]
trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

#[async_trait]
pub trait Consumer: Send {
    async fn recv(&mut self) -> Option<Delivery>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()>;
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Consumer>>;
}

// --- lapin (RabbitMQ) implementation -------------------------------------

pub struct LapinBroker {
    url: String,
    channel: Channel,
}

impl LapinBroker {
    pub async fn connect(amqp_url: &str) -> Result<Self> {
        let channel = open_channel(amqp_url).await?;
        Ok(Self {
            url: amqp_url.to_string(),
            channel,
        })
    }

    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        declare_queue(&self.channel, queue).await
    }
}

async fn open_channel(amqp_url: &str) -> Result<Channel> {
    let conn = Connection::connect(amqp_url, ConnectionProperties::default())
        .await
        .with_context(|| format!("failed to connect to broker at {amqp_url}"))?;
    conn.create_channel().await.context("failed to open channel")
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("failed to declare queue {queue}"))?;
    Ok(())
}

#[async_trait]
impl Broker for LapinBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_queue(queue).await?;
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await
            .with_context(|| format!("failed to publish to {queue}"))?
            .await
            .context("broker did not confirm publish")?;
        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Consumer>> {
        self.ensure_queue(queue).await?;
        self.channel
            .basic_qos(prefetch, Default::default())
            .await
            .context("failed to set prefetch")?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "query-harness",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to consume from {queue}"))?;
        Ok(Box::new(LapinConsumer {
            url: self.url.clone(),
            queue: queue.to_string(),
            prefetch,
            channel: self.channel.clone(),
            consumer,
        }))
    }
}

struct LapinConsumer {
    url: String,
    queue: String,
    prefetch: u16,
    channel: Channel,
    consumer: lapin::Consumer,
}

impl LapinConsumer {
    /// Tear down and re-establish channel and consumer after a connection
    /// loss, per the broker client's failure contract: no message is
    /// considered delivered until ack, so it is always safe to reconnect
    /// and keep consuming rather than give up on the queue.
    async fn reconnect(&mut self) -> Result<()> {
        let channel = open_channel(&self.url).await?;
        declare_queue(&channel, &self.queue).await?;
        channel
            .basic_qos(self.prefetch, Default::default())
            .await
            .context("failed to reset prefetch after reconnect")?;
        let consumer = channel
            .basic_consume(
                &self.queue,
                "query-harness",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("failed to re-consume from {}", self.queue))?;
        self.channel = channel;
        self.consumer = consumer;
        Ok(())
    }
}

#[async_trait]
impl Consumer for LapinConsumer {
    async fn recv(&mut self) -> Option<Delivery> {
        use futures_lite::StreamExt;
        loop {
            match self.consumer.next().await {
                Some(Ok(delivery)) => {
                    let acker = Arc::new(LapinAcker {
                        channel: self.channel.clone(),
                        delivery_tag: delivery.delivery_tag,
                    });
                    return Some(Delivery {
                        payload: delivery.data,
                        acker,
                    });
                }
                Some(Err(e)) => {
                    error!(queue = %self.queue, error = %e, "consumer stream error, tearing down and reconnecting");
                }
                None => {
                    warn!(queue = %self.queue, "consumer stream closed unexpectedly, reconnecting");
                }
            }

            if let Err(e) = self.reconnect().await {
                error!(queue = %self.queue, error = %e, "reconnect attempt failed, retrying after backoff");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

struct LapinAcker {
    channel: Channel,
    delivery_tag: u64,
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<()> {
        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await
            .context("failed to ack message")
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .context("failed to nack message")
    }
}

// --- in-memory fake, for tests -------------------------------------------

struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

/// An in-process broker fake backed by one unbounded channel per queue.
/// Supports a single consumer per queue, which is all the orchestration
/// pipeline ever needs.
#[derive(Default)]
pub struct MemoryBroker {
    senders: Mutex<HashMap<String, tokio::sync::mpsc::UnboundedSender<Vec<u8>>>>,
    receivers: Mutex<HashMap<String, tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn sender_for(&self, queue: &str) -> tokio::sync::mpsc::UnboundedSender<Vec<u8>> {
        let mut senders = self.senders.lock().await;
        if let Some(tx) = senders.get(queue) {
            return tx.clone();
        }
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        senders.insert(queue.to_string(), tx.clone());
        self.receivers.lock().await.insert(queue.to_string(), rx);
        tx
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        let tx = self.sender_for(queue).await;
        tx.send(payload)
            .map_err(|_| anyhow::anyhow!("memory broker queue {queue} has no receiver"))
    }

    async fn consume(&self, queue: &str, _prefetch: u16) -> Result<Box<dyn Consumer>> {
        self.sender_for(queue).await;
        let rx = self
            .receivers
            .lock()
            .await
            .remove(queue)
            .context("queue already has a consumer")?;
        Ok(Box::new(MemoryConsumer { rx }))
    }
}

struct MemoryConsumer {
    rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn recv(&mut self) -> Option<Delivery> {
        let payload = self.rx.recv().await?;
        Some(Delivery {
            payload,
            acker: Arc::new(NoopAcker),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_consume_round_trips() {
        let broker = MemoryBroker::new();
        broker.publish("q", b"hello".to_vec()).await.unwrap();

        let mut consumer = broker.consume("q", 1).await.unwrap();
        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery.payload, b"hello");
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn consume_twice_on_same_queue_errors() {
        let broker = MemoryBroker::new();
        let _first = broker.consume("q", 1).await.unwrap();
        assert!(broker.consume("q", 1).await.is_err());
    }
}
