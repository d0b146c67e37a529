use crate::infrastructure::storage::local::{FileLayout, OutputLocation};
use crate::modules::jobs::events::{TranscodeTask, TRANSCODE_TASK};
use crate::modules::jobs::model::{JobStatus, Transition};
use crate::modules::jobs::repository::{JobStore, StoreError};
use crate::workers::dispatcher::{TaskError, Worker};
use crate::workers::encoder::{EncodeError, Encoder, FailureKind};
use crate::workers::playlist::Playlist;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How one delivery ended, when it did not end in an error.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscodeOutcome {
    Completed { output_url: String },
    Failed { kind: FailureKind, message: String },
    /// Another delivery already owns the job; nothing was done.
    ClaimConflict { observed: JobStatus },
    /// The job left in_progress while encoding (e.g. failed by the reconciler).
    Superseded,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("invalid task for job {job_id}: {reason}")]
    InvalidTask { job_id: Uuid, reason: String },
    #[error("job store failure: {0}")]
    Store(#[from] StoreError),
    #[error("output directory error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TranscodeWorker {
    store: Arc<dyn JobStore>,
    files: FileLayout,
    encoder: Arc<dyn Encoder>,
    clear_stale_output: bool,
}

impl TranscodeWorker {
    pub fn new(store: Arc<dyn JobStore>, files: FileLayout, encoder: Arc<dyn Encoder>) -> Self {
        Self {
            store,
            files,
            encoder,
            clear_stale_output: true,
        }
    }

    pub fn clear_stale_output(mut self, enabled: bool) -> Self {
        self.clear_stale_output = enabled;
        self
    }

    /// Dequeued -> Validating -> Encoding -> Finalizing -> {Done | Failed}.
    pub async fn process(&self, task: &TranscodeTask) -> Result<TranscodeOutcome, WorkerError> {
        info!("📦 Processing job {}", task.job_id);

        // Validating
        let job = self
            .store
            .find_by_id(task.job_id)
            .await?
            .ok_or(WorkerError::NotFound(task.job_id))?;

        let location = self
            .files
            .locate(&task.output_root, job.id)
            .map_err(|e| WorkerError::InvalidTask {
                job_id: job.id,
                reason: e.to_string(),
            })?;

        // Claim
        if self.store.compare_and_set(job.id, &Transition::Claim).await?.is_none() {
            let observed = match self.store.find_by_id(job.id).await? {
                Some(current) => current.status,
                None => job.status,
            };
            info!(
                "Job {} already claimed (status {}), abandoning delivery",
                job.id, observed
            );
            return Ok(TranscodeOutcome::ClaimConflict { observed });
        }
        info!("Job {} status updated to in_progress", job.id);

        // Encoding
        self.files
            .prepare_output_dir(&location.dir, self.clear_stale_output)
            .await?;
        info!("Output directory ready at {}", location.dir.display());

        let source = Path::new(&task.source_path);
        let encoded = match self.encoder.encode(source, &location.playlist).await {
            Ok(()) => self.verify_output(&location).await,
            Err(e) => Err(e),
        };

        // Finalizing
        match encoded {
            Ok(playlist) => self.finish_success(job.id, source, &location, &playlist).await,
            Err(e) => self.finish_failure(job.id, &e).await,
        }
    }

    async fn verify_output(&self, location: &OutputLocation) -> Result<Playlist, EncodeError> {
        if !tokio::fs::try_exists(&location.playlist).await? {
            return Err(EncodeError::MissingOutput(location.playlist.clone()));
        }

        let text = tokio::fs::read_to_string(&location.playlist).await?;
        Playlist::parse(&text).map_err(|e| EncodeError::InvalidPlaylist {
            path: location.playlist.clone(),
            reason: e.to_string(),
        })
    }

    async fn finish_success(
        &self,
        job_id: Uuid,
        source: &Path,
        location: &OutputLocation,
        playlist: &Playlist,
    ) -> Result<TranscodeOutcome, WorkerError> {
        let transition = Transition::Complete {
            output_url: location.url.clone(),
            duration_seconds: Some(playlist.total_duration()),
        };

        if self.store.compare_and_set(job_id, &transition).await?.is_none() {
            warn!("Job {} left in_progress during encoding; result discarded", job_id);
            return Ok(TranscodeOutcome::Superseded);
        }

        // Only after the completed row is committed
        if let Err(e) = self.files.remove_source(source).await {
            error!("Failed to delete source {} for job {}: {}", source.display(), job_id, e);
        }

        info!(
            "✅ Job {} completed: {} segments, {:.1}s at {}",
            job_id,
            playlist.segments.len(),
            playlist.total_duration(),
            location.url
        );
        Ok(TranscodeOutcome::Completed {
            output_url: location.url.clone(),
        })
    }

    async fn finish_failure(&self, job_id: Uuid, err: &EncodeError) -> Result<TranscodeOutcome, WorkerError> {
        let message = err.diagnostic();
        error!("❌ Job {} failed: {}", job_id, message);

        let transition = Transition::Fail {
            error_message: message.clone(),
        };
        if self.store.compare_and_set(job_id, &transition).await?.is_none() {
            warn!("Job {} left in_progress during encoding; failure not recorded", job_id);
            return Ok(TranscodeOutcome::Superseded);
        }

        Ok(TranscodeOutcome::Failed {
            kind: err.kind(),
            message,
        })
    }
}

#[async_trait]
impl Worker for TranscodeWorker {
    fn task_type(&self) -> &'static str {
        TRANSCODE_TASK
    }

    async fn execute(&self, payload: serde_json::Value) -> Result<(), TaskError> {
        let task: TranscodeTask = serde_json::from_value(payload)?;

        match self.process(&task).await {
            Ok(_) => Ok(()),
            Err(e @ (WorkerError::NotFound(_) | WorkerError::InvalidTask { .. })) => {
                Err(TaskError::Fatal(e.to_string()))
            }
            Err(e) => Err(TaskError::Retryable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::jobs::memory::InMemoryJobStore;
    use crate::modules::jobs::model::NewJob;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PLAYLIST: &str = "#EXTM3U\n#EXTINF:10.0,\noutput0.ts\n#EXTINF:2.5,\noutput1.ts\n#EXT-X-ENDLIST\n";

    enum Behaviour {
        WritePlaylist,
        ExitZeroWithoutOutput,
        Fail,
        Timeout,
    }

    struct ScriptedEncoder {
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Encoder for ScriptedEncoder {
        async fn encode(&self, _input: &Path, playlist: &Path) -> Result<(), EncodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::WritePlaylist => {
                    tokio::fs::write(playlist, PLAYLIST).await?;
                    Ok(())
                }
                Behaviour::ExitZeroWithoutOutput => Ok(()),
                Behaviour::Fail => Err(EncodeError::Failed {
                    exit_code: Some(1),
                    stderr: "Invalid data found when processing input".into(),
                }),
                Behaviour::Timeout => Err(EncodeError::Timeout(std::time::Duration::from_secs(5))),
            }
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Arc<InMemoryJobStore>,
        files: FileLayout,
        encoder: Arc<ScriptedEncoder>,
        worker: TranscodeWorker,
    }

    fn fixture(behaviour: Behaviour) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let files = FileLayout::new(tmp.path(), "uploads", "streams");
        std::fs::create_dir_all(files.uploads_path()).unwrap();
        let store = Arc::new(InMemoryJobStore::new());
        let encoder = Arc::new(ScriptedEncoder {
            behaviour,
            calls: AtomicUsize::new(0),
        });
        let worker = TranscodeWorker::new(store.clone(), files.clone(), encoder.clone());
        Fixture {
            _tmp: tmp,
            store,
            files,
            encoder,
            worker,
        }
    }

    async fn submit(fx: &Fixture) -> TranscodeTask {
        let id = Uuid::new_v4();
        let source = fx.files.upload_path(id, "clip.mp4");
        std::fs::write(&source, b"not really a video").unwrap();
        fx.store
            .insert(NewJob {
                id,
                title: "Test".into(),
                description: None,
                source_path: source.to_string_lossy().into_owned(),
                output_root: "streams".into(),
            })
            .await
            .unwrap();
        TranscodeTask::new(id, source.to_string_lossy(), "streams")
    }

    #[tokio::test]
    async fn success_publishes_url_and_duration_and_removes_source() {
        let fx = fixture(Behaviour::WritePlaylist);
        let task = submit(&fx).await;

        let outcome = fx.worker.process(&task).await.unwrap();

        let url = format!("/streams/{}/output.m3u8", task.job_id);
        assert_eq!(outcome, TranscodeOutcome::Completed { output_url: url.clone() });
        let job = fx.store.find_by_id(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output_url, Some(url));
        assert_eq!(job.error_message, None);
        assert_eq!(job.duration_seconds, Some(12.5));
        assert!(!Path::new(&task.source_path).exists());
    }

    #[tokio::test]
    async fn exit_zero_without_playlist_is_an_encoder_failure() {
        let fx = fixture(Behaviour::ExitZeroWithoutOutput);
        let task = submit(&fx).await;

        let outcome = fx.worker.process(&task).await.unwrap();

        assert!(matches!(
            outcome,
            TranscodeOutcome::Failed { kind: FailureKind::EncoderFailure, .. }
        ));
        let job = fx.store.find_by_id(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("was not produced"));
        assert!(job.output_url.is_none());
        assert!(Path::new(&task.source_path).exists());
    }

    #[tokio::test]
    async fn timeout_is_recorded_as_failed() {
        let fx = fixture(Behaviour::Timeout);
        let task = submit(&fx).await;

        let outcome = fx.worker.process(&task).await.unwrap();

        assert!(matches!(outcome, TranscodeOutcome::Failed { kind: FailureKind::Timeout, .. }));
        let job = fx.store.find_by_id(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().starts_with("timeout:"));
        assert!(Path::new(&task.source_path).exists());
    }

    #[tokio::test]
    async fn missing_job_is_not_found_and_writes_nothing() {
        let fx = fixture(Behaviour::WritePlaylist);
        let task = TranscodeTask::new(Uuid::new_v4(), "static/uploads/ghost.mp4", "streams");

        let err = fx.worker.process(&task).await.unwrap_err();

        assert!(matches!(err, WorkerError::NotFound(id) if id == task.job_id));
        assert!(fx.store.list(10).await.unwrap().is_empty());
        assert_eq!(fx.encoder.calls.load(Ordering::SeqCst), 0);

        let payload = serde_json::to_value(&task).unwrap();
        assert!(matches!(fx.worker.execute(payload).await, Err(TaskError::Fatal(_))));
    }

    #[tokio::test]
    async fn unsafe_output_root_is_rejected_before_claim() {
        let fx = fixture(Behaviour::WritePlaylist);
        let mut task = submit(&fx).await;
        task.output_root = "../outside".into();

        let err = fx.worker.process(&task).await.unwrap_err();

        assert!(matches!(err, WorkerError::InvalidTask { .. }));
        let job = fx.store.find_by_id(task.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn second_delivery_observes_claim_conflict() {
        let fx = fixture(Behaviour::Fail);
        let task = submit(&fx).await;

        fx.worker.process(&task).await.unwrap();
        let before = fx.store.find_by_id(task.job_id).await.unwrap().unwrap();
        let outcome = fx.worker.process(&task).await.unwrap();
        let after = fx.store.find_by_id(task.job_id).await.unwrap().unwrap();

        assert_eq!(outcome, TranscodeOutcome::ClaimConflict { observed: JobStatus::Failed });
        assert_eq!(before, after);
        assert_eq!(fx.encoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_segments_are_cleared_before_encoding() {
        let fx = fixture(Behaviour::WritePlaylist);
        let task = submit(&fx).await;
        let location = fx.files.locate("streams", task.job_id).unwrap();
        std::fs::create_dir_all(&location.dir).unwrap();
        std::fs::write(location.dir.join("output9.ts"), b"stale").unwrap();

        fx.worker.process(&task).await.unwrap();

        assert!(!location.dir.join("output9.ts").exists());
        assert!(location.playlist.exists());
    }

    #[tokio::test]
    async fn stale_segments_survive_when_clearing_is_off() {
        let mut fx = fixture(Behaviour::WritePlaylist);
        fx.worker = TranscodeWorker::new(fx.store.clone(), fx.files.clone(), fx.encoder.clone())
            .clear_stale_output(false);
        let task = submit(&fx).await;
        let location = fx.files.locate("streams", task.job_id).unwrap();
        std::fs::create_dir_all(&location.dir).unwrap();
        std::fs::write(location.dir.join("output9.ts"), b"stale").unwrap();

        fx.worker.process(&task).await.unwrap();

        assert!(location.dir.join("output9.ts").exists());
    }
}
