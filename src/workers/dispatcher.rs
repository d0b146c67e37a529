use crate::infrastructure::queue::{Disposition, TaskMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("malformed task payload: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Retrying cannot help; the message is dead-lettered.
    #[error("{0}")]
    Fatal(String),
    /// Infrastructure trouble; the broker should redeliver.
    #[error("{0}")]
    Retryable(String),
}

impl TaskError {
    pub fn disposition(&self) -> Disposition {
        match self {
            TaskError::Malformed(_) | TaskError::Fatal(_) => Disposition::Reject,
            TaskError::Retryable(_) => Disposition::Requeue,
        }
    }
}

/// A handler for one task type.
#[async_trait]
pub trait Worker: Send + Sync {
    fn task_type(&self) -> &'static str;

    async fn execute(&self, payload: serde_json::Value) -> Result<(), TaskError>;
}

/// The one place task types are mapped to workers. Built once at startup.
#[derive(Default)]
pub struct Dispatcher {
    workers: HashMap<&'static str, Arc<dyn Worker>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, worker: Arc<dyn Worker>) -> Self {
        let task_type = worker.task_type();
        if self.workers.insert(task_type, worker).is_some() {
            warn!("Worker for '{}' registered twice; keeping the last one", task_type);
        }
        self
    }

    pub fn handles(&self, task_type: &str) -> bool {
        self.workers.contains_key(task_type)
    }

    pub async fn dispatch(&self, body: &[u8]) -> Disposition {
        let message: TaskMessage = match serde_json::from_slice(body) {
            Ok(message) => message,
            Err(e) => {
                error!("❌ Failed to parse task envelope: {}", e);
                return Disposition::Reject;
            }
        };

        let Some(worker) = self.workers.get(message.task_type.as_str()) else {
            error!(
                "❌ No worker registered for task type '{}' (task {})",
                message.task_type, message.task_id
            );
            return Disposition::Reject;
        };

        match worker.execute(message.payload).await {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                let disposition = e.disposition();
                error!(
                    "❌ Task {} ({}) failed: {} -> {:?}",
                    message.task_id, message.task_type, e, disposition
                );
                disposition
            }
        }
    }
}
