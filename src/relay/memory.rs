use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Broker, Delivery, QueueName, Topic};
use crate::error::{RelayError, RelayResult};

struct Binding {
    queue: QueueName,
    tx: mpsc::Sender<Delivery>,
}

/// In-process fanout broker.
///
/// Each queue is a bounded channel. A subscriber whose queue is full misses
/// that delivery; the publisher is never blocked by a slow consumer.
/// Exchanges created implicitly by a binding go away with their last queue;
/// declared ones stay.
#[derive(Default)]
pub struct MemoryBroker {
    exchanges: DashMap<Topic, Vec<Binding>>,
    declared: DashSet<Topic>,
    queues: DashMap<QueueName, Topic>,
    closed: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> RelayResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RelayError::BrokerUnavailable("broker closed".into()));
        }
        Ok(())
    }

    /// Queues currently bound to `topic`.
    pub fn queue_count(&self, topic: &Topic) -> usize {
        self.exchanges.get(topic).map_or(0, |bindings| bindings.len())
    }

    pub fn has_queue(&self, queue: &QueueName) -> bool {
        self.queues.contains_key(queue)
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    /// Drop `topic` once nothing is bound to it, unless it was declared.
    /// Must not be called while holding a guard into `exchanges`.
    fn prune(&self, topic: &Topic) {
        self.exchanges.remove_if(topic, |topic, bindings| {
            bindings.is_empty() && !self.declared.contains(topic)
        });
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, topic: &Topic) -> RelayResult<()> {
        self.ensure_open()?;
        self.declared.insert(topic.clone());
        self.exchanges.entry(topic.clone()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &self,
        topic: &Topic,
        capacity: usize,
    ) -> RelayResult<(QueueName, mpsc::Receiver<Delivery>)> {
        self.ensure_open()?;
        let queue = QueueName(format!("amq.gen-{}", Uuid::now_v7().simple()));
        let (tx, rx) = mpsc::channel(capacity.max(1));

        self.queues.insert(queue.clone(), topic.clone());
        self.exchanges
            .entry(topic.clone())
            .or_default()
            .push(Binding {
                queue: queue.clone(),
                tx,
            });
        Ok((queue, rx))
    }

    async fn publish(&self, topic: &Topic, delivery: Delivery) -> RelayResult<()> {
        self.ensure_open()?;
        let Some(mut bindings) = self.exchanges.get_mut(topic) else {
            debug!(%topic, "no exchange bound, delivery dropped");
            return Ok(());
        };
        let mut gone = Vec::new();
        bindings.retain(|binding| match binding.tx.try_send(delivery.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%topic, queue = %binding.queue, "queue full, delivery dropped");
                true
            }
            Err(TrySendError::Closed(_)) => {
                gone.push(binding.queue.clone());
                false
            }
        });
        drop(bindings);

        if !gone.is_empty() {
            for queue in &gone {
                self.queues.remove(queue);
            }
            self.prune(topic);
        }
        Ok(())
    }

    fn delete_queue(&self, queue: &QueueName) {
        let Some((_, topic)) = self.queues.remove(queue) else {
            return;
        };
        if let Some(mut bindings) = self.exchanges.get_mut(&topic) {
            bindings.retain(|binding| &binding.queue != queue);
        }
        self.prune(&topic);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.exchanges.clear();
        self.declared.clear();
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn released_queues_take_their_exchange_along() {
        let broker = MemoryBroker::new();
        let root = Topic::new("chat_exchange");
        broker.declare_exchange(&root).await.unwrap();

        for i in 0..10 {
            let topic = Topic::session(&format!("session_{i}"));
            let (queue, _rx) = broker.bind_queue(&topic, 4).await.unwrap();
            broker.delete_queue(&queue);
        }
        assert_eq!(broker.exchange_count(), 1);

        let (queue, _rx) = broker.bind_queue(&root, 4).await.unwrap();
        broker.delete_queue(&queue);
        assert_eq!(broker.exchange_count(), 1);
    }

    #[tokio::test]
    async fn publish_drops_queues_whose_consumer_is_gone() {
        let broker = MemoryBroker::new();
        let topic = Topic::chat("room1");
        let (queue, rx) = broker.bind_queue(&topic, 4).await.unwrap();
        drop(rx);

        broker.publish(&topic, Delivery::text("x")).await.unwrap();
        assert!(!broker.has_queue(&queue));
        assert_eq!(broker.exchange_count(), 0);
    }
}
