use super::model::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

/// Text fields of the multipart submission form.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SubmitJobForm {
    #[validate(length(min = 1, max = 120, message = "Title is required (max 120 characters)"))]
    pub title: String,
    #[validate(length(max = 2000, message = "Description must be at most 2000 characters"))]
    pub description: Option<String>,
}

impl SubmitJobForm {
    pub fn normalize(mut self) -> Self {
        self.title = self.title.trim().to_string();
        self.description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self
    }
}

/// OpenAPI shape of the multipart body.
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct SubmitJobRequest {
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
    /// Queue handle; absent when enqueueing failed.
    pub task_id: Option<Uuid>,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: JobStatus,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
    #[serde(with = "time::serde::iso8601")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            title: job.title,
            description: job.description,
            status: job.status,
            output_url: job.output_url,
            error_message: job.error_message,
            duration_seconds: job.duration_seconds,
            created_at: job.created_at,
        }
    }
}
