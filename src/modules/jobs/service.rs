use super::dto::{JobStatusResponse, SubmitJobForm, SubmitJobResponse};
use super::events::TranscodeTask;
use super::model::{JobStatus, NewJob};
use super::repository::StoreError;
use crate::infrastructure::queue::QueueError;
use crate::state::AppState;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const LIST_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("failed to record job: {0}")]
    Store(#[from] StoreError),
    /// The job row exists (pending) but no task reached the queue.
    #[error("job {job_id} recorded but not queued: {source}")]
    Enqueue {
        job_id: Uuid,
        #[source]
        source: QueueError,
    },
}

pub struct JobService;

impl JobService {
    /// Records a pending job for an already stored upload and queues its transcode.
    pub async fn submit(
        state: &AppState,
        job_id: Uuid,
        form: SubmitJobForm,
        source_path: &Path,
    ) -> Result<SubmitJobResponse, SubmitError> {
        let output_root = state.files.streams_dir().to_string();
        let source_path = source_path.to_string_lossy().into_owned();

        let job = state
            .store
            .insert(NewJob {
                id: job_id,
                title: form.title,
                description: form.description,
                source_path: source_path.clone(),
                output_root: output_root.clone(),
            })
            .await?;
        info!("📝 Job {} recorded as pending", job.id);

        let task = TranscodeTask::new(job.id, source_path, output_root);
        let task_id = task
            .enqueue(state.queue.as_ref())
            .await
            .map_err(|source| SubmitError::Enqueue { job_id: job.id, source })?;
        info!("📨 Queued transcode task {} for job {}", task_id, job.id);

        // Unmarked jobs get republished by the reconciler, which is safe but wasteful.
        if let Err(e) = state.store.mark_enqueued(job.id).await {
            warn!("Could not mark job {} as enqueued: {}", job.id, e);
        }

        Ok(SubmitJobResponse {
            job_id: job.id,
            task_id: Some(task_id),
            status: JobStatus::Pending,
        })
    }

    /// `Ok(None)` is the normal not-found answer.
    pub async fn get(state: &AppState, id: Uuid) -> Result<Option<JobStatusResponse>, StoreError> {
        let job = state.store.find_by_id(id).await.inspect_err(|e| {
            error!("❌ Status lookup for job {} failed: {}", id, e);
        })?;
        Ok(job.map(JobStatusResponse::from))
    }

    pub async fn list(state: &AppState) -> Result<Vec<JobStatusResponse>, StoreError> {
        let jobs = state.store.list(LIST_LIMIT).await.inspect_err(|e| {
            error!("❌ Job listing failed: {}", e);
        })?;
        Ok(jobs.into_iter().map(JobStatusResponse::from).collect())
    }
}
