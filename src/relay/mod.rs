//! Fanout relay: one exchange per topic, one exclusive queue per live
//! connection.
//!
//! Publishing is fire-and-forget. A delivery reaches the queues bound to the
//! topic at publish time and nothing else; there is no backlog replay, so a
//! subscriber must bind before the messages it needs are published. Within a
//! single publisher, every queue sees deliveries in publish order.

mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{RelayError, RelayResult};

pub use memory::MemoryBroker;

pub const CHAT_EXCHANGE: &str = "chat_exchange";
pub const SESSION_EXCHANGE: &str = "session";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Chat fanout for one room.
    pub fn chat(room: &str) -> Self {
        Self(format!("{CHAT_EXCHANGE}.{room}"))
    }

    /// Signaling fanout for one session.
    pub fn session(session_id: &str) -> Self {
        Self(format!("{SESSION_EXCHANGE}.{session_id}"))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Broker-assigned name of an exclusive, auto-deleting queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName(pub String);

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Text,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub content_type: ContentType,
    pub body: String,
}

impl Delivery {
    pub fn json<T: Serialize>(payload: &T) -> RelayResult<Self> {
        Ok(Self {
            content_type: ContentType::Json,
            body: serde_json::to_string(payload)?,
        })
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            body: body.into(),
        }
    }
}

/// The fanout transport.
///
/// `delete_queue` and `close` are synchronous so a queue can be released
/// from `Drop`.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a durable fanout exchange. Idempotent.
    async fn declare_exchange(&self, topic: &Topic) -> RelayResult<()>;

    /// Declare an exclusive, auto-deleting queue and bind it to `topic`,
    /// declaring the exchange when needed.
    async fn bind_queue(
        &self,
        topic: &Topic,
        capacity: usize,
    ) -> RelayResult<(QueueName, mpsc::Receiver<Delivery>)>;

    async fn publish(&self, topic: &Topic, delivery: Delivery) -> RelayResult<()>;

    fn delete_queue(&self, queue: &QueueName);

    /// Stop accepting work. Open queues end.
    fn close(&self);
}

/// Adapter the rest of the service talks to.
#[derive(Clone)]
pub struct Relay {
    broker: Arc<dyn Broker>,
    queue_capacity: usize,
}

impl Relay {
    pub fn new(broker: Arc<dyn Broker>, queue_capacity: usize) -> Self {
        Self {
            broker,
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub async fn declare(&self, topic: &Topic) -> RelayResult<()> {
        self.broker.declare_exchange(topic).await
    }

    /// Fanout publish. Failures are returned, never retried.
    pub async fn publish(&self, topic: &Topic, delivery: Delivery) -> RelayResult<()> {
        debug!(%topic, content_type = delivery.content_type.as_str(), "publish");
        self.broker.publish(topic, delivery).await.inspect_err(|err| {
            warn!(%topic, %err, "publish failed");
        })
    }

    pub async fn publish_json<T: Serialize>(&self, topic: &Topic, payload: &T) -> RelayResult<()> {
        self.publish(topic, Delivery::json(payload)?).await
    }

    /// Bind a fresh queue to `topic`. The queue is released when the returned
    /// subscription is dropped.
    pub async fn subscribe(&self, topic: &Topic) -> RelayResult<Subscription> {
        let (queue, deliveries) = self.broker.bind_queue(topic, self.queue_capacity).await?;
        debug!(%topic, %queue, "subscribed");
        Ok(Subscription {
            queue,
            topic: topic.clone(),
            deliveries,
            broker: self.broker.clone(),
        })
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn close(&self) {
        self.broker.close();
    }
}

/// One connection's binding to a topic. Not restartable: once the stream
/// ends a new subscription (and queue) is needed.
pub struct Subscription {
    queue: QueueName,
    topic: Topic,
    deliveries: mpsc::Receiver<Delivery>,
    broker: Arc<dyn Broker>,
}

impl Subscription {
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next delivery, or `None` once the queue is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.deliveries.close();
        self.broker.delete_queue(&self.queue);
        debug!(topic = %self.topic, queue = %self.queue, "queue released");
    }
}
