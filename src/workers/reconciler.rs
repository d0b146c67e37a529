//! Periodic repair of jobs whose queue message or worker went missing.
//!
//! - `in_progress` jobs untouched for longer than the encode timeout plus a grace
//!   period belonged to a worker that died mid-encode; they are failed.
//! - `pending` jobs whose task was never confirmed by the queue (the broker was
//!   down at submission) get a fresh task once they are old enough. Jobs with a
//!   confirmed task are left to the broker, even when a backlog keeps them waiting.

use crate::infrastructure::queue::TaskQueue;
use crate::modules::jobs::events::TranscodeTask;
use crate::modules::jobs::model::{JobStatus, Transition};
use crate::modules::jobs::repository::JobStore;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub failed: u32,
    pub requeued: u32,
}

pub struct Reconciler {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    stale_after: Duration,
    requeue_after: Duration,
}

impl Reconciler {
    /// `stale_after` should exceed the encode timeout, since a healthy encode
    /// does not touch its row until it finishes.
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        stale_after: Duration,
        requeue_after: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            stale_after,
            requeue_after,
        }
    }

    pub async fn run(self, every: Duration, shutdown: CancellationToken) {
        info!(
            "🧹 Reconciler running every {:?} (stale after {:?}, requeue after {:?})",
            every, self.stale_after, self.requeue_after
        );

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(report) if report != ReconcileReport::default() => {
                    info!(
                        "🧹 Reconcile pass: {} failed, {} requeued",
                        report.failed, report.requeued
                    );
                }
                Ok(_) => {}
                Err(e) => error!("❌ Reconcile pass failed: {}", e),
            }
        }

        info!("Reconciler stopped");
    }

    pub async fn sweep(&self) -> anyhow::Result<ReconcileReport> {
        let now = OffsetDateTime::now_utc();
        let mut report = ReconcileReport::default();

        let stale_cutoff = now - self.stale_after;
        for job in self.store.find_stale(JobStatus::InProgress, stale_cutoff).await? {
            let transition = Transition::Fail {
                error_message: format!(
                    "worker stopped before finishing: no progress for over {}s",
                    self.stale_after.as_secs()
                ),
            };
            // A worker finishing right now wins; its write changed the status.
            if self.store.compare_and_set(job.id, &transition).await?.is_some() {
                warn!("Job {} abandoned in progress, marked failed", job.id);
                report.failed += 1;
            }
        }

        let requeue_cutoff = now - self.requeue_after;
        for job in self.store.find_unqueued(requeue_cutoff).await? {
            let task = TranscodeTask::new(job.id, job.source_path.clone(), job.output_root.clone());
            match task.enqueue(self.queue.as_ref()).await {
                Ok(task_id) => {
                    self.store.mark_enqueued(job.id).await?;
                    info!("📨 Re-enqueued pending job {} as task {}", job.id, task_id);
                    report.requeued += 1;
                }
                Err(e) => {
                    warn!("Could not re-enqueue job {}: {}", job.id, e);
                    break;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::queue::memory::MemoryQueue;
    use crate::infrastructure::queue::TaskMessage;
    use crate::modules::jobs::memory::InMemoryJobStore;
    use crate::modules::jobs::model::NewJob;
    use futures_util::StreamExt;
    use uuid::Uuid;

    async fn insert(store: &InMemoryJobStore) -> Uuid {
        let id = Uuid::new_v4();
        store
            .insert(NewJob {
                id,
                title: "Clip".into(),
                description: None,
                source_path: format!("static/uploads/{}.mp4", id),
                output_root: "streams".into(),
            })
            .await
            .unwrap();
        id
    }

    fn age(store: &InMemoryJobStore, id: Uuid, minutes: i64) {
        assert!(store.set_updated_at(id, OffsetDateTime::now_utc() - time::Duration::minutes(minutes)));
    }

    fn reconciler(store: Arc<InMemoryJobStore>, queue: MemoryQueue) -> Reconciler {
        Reconciler::new(
            store,
            Arc::new(queue),
            Duration::from_secs(30 * 60),
            Duration::from_secs(10 * 60),
        )
    }

    #[tokio::test]
    async fn abandoned_in_progress_jobs_are_failed() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = MemoryQueue::new();
        let abandoned = insert(&store).await;
        let busy = insert(&store).await;
        for id in [abandoned, busy] {
            store.compare_and_set(id, &Transition::Claim).await.unwrap().unwrap();
        }
        age(&store, abandoned, 45);
        age(&store, busy, 5);

        let report = reconciler(store.clone(), queue).sweep().await.unwrap();

        assert_eq!(report, ReconcileReport { failed: 1, requeued: 0 });
        let failed = store.find_by_id(abandoned).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error_message.unwrap().contains("worker stopped"));
        assert_eq!(
            store.find_by_id(busy).await.unwrap().unwrap().status,
            JobStatus::InProgress
        );
    }

    #[tokio::test]
    async fn forgotten_pending_jobs_are_requeued_once() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = MemoryQueue::new();
        let forgotten = insert(&store).await;
        let fresh = insert(&store).await;
        age(&store, forgotten, 15);

        let reconciler = reconciler(store.clone(), queue.clone());
        let first = reconciler.sweep().await.unwrap();
        age(&store, forgotten, 15);
        let second = reconciler.sweep().await.unwrap();

        assert_eq!(first.requeued, 1);
        assert_eq!(second.requeued, 0);
        assert_eq!(queue.len(), 1);

        let mut sub = queue.subscribe("t").await.unwrap();
        let delivery = sub.next().await.unwrap().unwrap();
        let message: TaskMessage = serde_json::from_slice(&delivery.body).unwrap();
        let task: TranscodeTask = serde_json::from_value(message.payload).unwrap();
        assert_eq!(task.job_id, forgotten);
        assert_ne!(task.job_id, fresh);
    }

    #[tokio::test]
    async fn queued_pending_jobs_are_not_duplicated() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = MemoryQueue::new();
        let id = insert(&store).await;
        let job = store.find_by_id(id).await.unwrap().unwrap();
        TranscodeTask::new(id, job.source_path, job.output_root)
            .enqueue(&queue)
            .await
            .unwrap();
        assert!(store.mark_enqueued(id).await.unwrap());

        // A long backlog: nobody consumes while several sweep windows pass.
        let reconciler = reconciler(store.clone(), queue.clone());
        for _ in 0..5 {
            age(&store, id, 11);
            let report = reconciler.sweep().await.unwrap();
            assert_eq!(report.requeued, 0);
        }

        assert_eq!(queue.len(), 1);
        assert_eq!(store.find_by_id(id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn failed_requeue_leaves_job_unmarked() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = MemoryQueue::new();
        let id = insert(&store).await;
        age(&store, id, 15);
        queue.close();

        let reconciler = reconciler(store.clone(), queue.clone());
        assert_eq!(reconciler.sweep().await.unwrap().requeued, 0);
        assert!(store.find_by_id(id).await.unwrap().unwrap().enqueued_at.is_none());
    }

    #[tokio::test]
    async fn terminal_jobs_are_left_alone() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = insert(&store).await;
        store.compare_and_set(id, &Transition::Claim).await.unwrap();
        store
            .compare_and_set(
                id,
                &Transition::Complete {
                    output_url: format!("/streams/{}/output.m3u8", id),
                    duration_seconds: Some(1.0),
                },
            )
            .await
            .unwrap()
            .unwrap();
        age(&store, id, 600);
        let before = store.find_by_id(id).await.unwrap();

        let report = reconciler(store.clone(), MemoryQueue::new()).sweep().await.unwrap();

        assert_eq!(report, ReconcileReport::default());
        assert_eq!(store.find_by_id(id).await.unwrap(), before);
    }
}
