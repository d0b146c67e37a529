use super::{Delivery, Disposition, QueueError, Settle, Subscription, TaskMessage, TaskQueue};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::{Arc, Mutex};
use tracing::debug;

struct Envelope {
    body: Vec<u8>,
    redelivered: bool,
}

/// In-process task queue for single-node runs and tests.
///
/// Mirrors the broker's settlement semantics: requeued messages come back flagged
/// as redelivered, rejected ones are parked in a dead-letter list.
#[derive(Clone)]
pub struct MemoryQueue {
    tx: async_channel::Sender<Envelope>,
    rx: async_channel::Receiver<Envelope>,
    dead_letters: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self {
            tx,
            rx,
            dead_letters: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Messages waiting for a consumer.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.dead_letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }

    /// Ends every subscription once the remaining messages are drained.
    pub fn close(&self) {
        self.tx.close();
    }
}

struct MemorySettler {
    body: Vec<u8>,
    tx: async_channel::Sender<Envelope>,
    dead_letters: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl Settle for MemorySettler {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), QueueError> {
        let MemorySettler {
            body,
            tx,
            dead_letters,
        } = *self;

        match disposition {
            Disposition::Ack => Ok(()),
            Disposition::Requeue => tx
                .send(Envelope {
                    body,
                    redelivered: true,
                })
                .await
                .map_err(|_| QueueError::Closed),
            Disposition::Reject => {
                dead_letters
                    .lock()
                    .map_err(|_| QueueError::Broker("dead-letter list poisoned".to_string()))?
                    .push(body);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn publish(&self, message: &TaskMessage) -> Result<(), QueueError> {
        let body = message.to_bytes()?;
        self.tx
            .send(Envelope {
                body,
                redelivered: false,
            })
            .await
            .map_err(|_| QueueError::Closed)?;
        debug!("Queued task {} ({})", message.task_id, message.task_type);
        Ok(())
    }

    async fn subscribe(&self, consumer_tag: &str) -> Result<Subscription, QueueError> {
        if self.rx.is_closed() && self.rx.is_empty() {
            return Err(QueueError::Closed);
        }
        debug!("Consumer '{}' attached to in-process queue", consumer_tag);

        let tx = self.tx.clone();
        let dead_letters = self.dead_letters.clone();
        let stream = self.rx.clone().map(move |envelope| {
            let settler = MemorySettler {
                body: envelope.body.clone(),
                tx: tx.clone(),
                dead_letters: dead_letters.clone(),
            };
            Ok(Delivery::new(envelope.body, envelope.redelivered, Box::new(settler)))
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn next(sub: &mut Subscription) -> Delivery {
        sub.next().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn requeue_redelivers_with_flag() {
        let queue = MemoryQueue::new();
        let message = TaskMessage::new("transcode", &json!({"n": 1})).unwrap();
        queue.publish(&message).await.unwrap();

        let mut sub = queue.subscribe("t").await.unwrap();
        let first = next(&mut sub).await;
        assert!(!first.redelivered);
        let body = first.body.clone();
        first.settle(Disposition::Requeue).await.unwrap();

        let second = next(&mut sub).await;
        assert!(second.redelivered);
        assert_eq!(second.body, body);
        second.settle(Disposition::Ack).await.unwrap();
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn reject_goes_to_dead_letters() {
        let queue = MemoryQueue::new();
        let message = TaskMessage::new("transcode", &json!({})).unwrap();
        queue.publish(&message).await.unwrap();

        let mut sub = queue.subscribe("t").await.unwrap();
        next(&mut sub).await.settle(Disposition::Reject).await.unwrap();

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        let parked: TaskMessage = serde_json::from_slice(&dead[0]).unwrap();
        assert_eq!(parked, message);
    }

    #[tokio::test]
    async fn closed_queue_refuses_publish_and_subscribe() {
        let queue = MemoryQueue::new();
        queue.close();

        let message = TaskMessage::new("transcode", &json!({})).unwrap();
        assert!(matches!(queue.publish(&message).await, Err(QueueError::Closed)));
        assert!(matches!(queue.subscribe("t").await, Err(QueueError::Closed)));
    }
}
