use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod rabbitmq;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(String),
    #[error("failed to encode task message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("queue is closed")]
    Closed,
}

/// Wire envelope. `task_type` selects the worker in the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub task_id: Uuid,
    pub task_type: String,
    pub payload: serde_json::Value,
}

impl TaskMessage {
    pub fn new<T: Serialize>(task_type: &str, payload: &T) -> Result<Self, QueueError> {
        Ok(Self {
            task_id: Uuid::new_v4(),
            task_type: task_type.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// How a consumer settles a delivery with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Work finished, or there was nothing to do.
    Ack,
    /// Transient failure; hand the message back for redelivery.
    Requeue,
    /// Fatal for this message; dead-letter it.
    Reject,
}

#[async_trait]
pub trait Settle: Send {
    async fn settle(self: Box<Self>, disposition: Disposition) -> Result<(), QueueError>;
}

pub struct Delivery {
    pub body: Vec<u8>,
    pub redelivered: bool,
    settler: Box<dyn Settle>,
}

impl Delivery {
    pub fn new(body: Vec<u8>, redelivered: bool, settler: Box<dyn Settle>) -> Self {
        Self {
            body,
            redelivered,
            settler,
        }
    }

    pub async fn settle(self, disposition: Disposition) -> Result<(), QueueError> {
        self.settler.settle(disposition).await
    }
}

pub type Subscription = BoxStream<'static, Result<Delivery, QueueError>>;

/// At-least-once task channel between submission and the worker pool.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn publish(&self, message: &TaskMessage) -> Result<(), QueueError>;

    /// Each subscription receives at most one unsettled delivery at a time.
    async fn subscribe(&self, consumer_tag: &str) -> Result<Subscription, QueueError>;
}
