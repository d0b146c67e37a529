use crate::infrastructure::queue::{QueueError, TaskMessage, TaskQueue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TRANSCODE_TASK: &str = "transcode";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscodeTask {
    pub job_id: Uuid,
    pub source_path: String,
    pub output_root: String,
}

impl TranscodeTask {
    pub fn new(job_id: Uuid, source_path: impl Into<String>, output_root: impl Into<String>) -> Self {
        Self {
            job_id,
            source_path: source_path.into(),
            output_root: output_root.into(),
        }
    }

    /// Publishes the task and returns its handle (the envelope's task id).
    pub async fn enqueue(&self, queue: &dyn TaskQueue) -> Result<Uuid, QueueError> {
        let message = TaskMessage::new(TRANSCODE_TASK, self)?;
        queue.publish(&message).await?;
        Ok(message.task_id)
    }
}
