use super::model::{Job, JobStatus, NewJob, Transition};
use super::repository::{JobStore, StoreError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use time::OffsetDateTime;
use uuid::Uuid;

/// Process-local job store used when no database is configured.
///
/// The compare-and-set check and the write happen under one lock, so it gives the
/// same fencing guarantee as the conditional UPDATE in [`super::repository::PgJobStore`].
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, Job>>, StoreError> {
        self.jobs
            .lock()
            .map_err(|_| StoreError::Unavailable("job map lock poisoned".to_string()))
    }

    /// Test hook for ageing a record.
    pub fn set_updated_at(&self, id: Uuid, updated_at: OffsetDateTime) -> bool {
        match self.lock() {
            Ok(mut jobs) => match jobs.get_mut(&id) {
                Some(job) => {
                    job.updated_at = updated_at;
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.lock()?;
        if jobs.contains_key(&new.id) {
            return Err(StoreError::Unavailable(format!("duplicate job id {}", new.id)));
        }
        let job = Job::new(new, OffsetDateTime::now_utc());
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn list(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.lock()?.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(jobs)
    }

    async fn compare_and_set(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.lock()?;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        if transition.apply(job, OffsetDateTime::now_utc()) {
            Ok(Some(job.clone()))
        } else {
            Ok(None)
        }
    }

    async fn find_stale(
        &self,
        status: JobStatus,
        updated_before: OffsetDateTime,
    ) -> Result<Vec<Job>, StoreError> {
        let mut stale: Vec<Job> = self
            .lock()?
            .values()
            .filter(|job| job.status == status && job.updated_at < updated_before)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(stale)
    }

    async fn find_unqueued(&self, updated_before: OffsetDateTime) -> Result<Vec<Job>, StoreError> {
        let mut unqueued: Vec<Job> = self
            .lock()?
            .values()
            .filter(|job| {
                job.status == JobStatus::Pending
                    && job.enqueued_at.is_none()
                    && job.updated_at < updated_before
            })
            .cloned()
            .collect();
        unqueued.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(unqueued)
    }

    async fn mark_enqueued(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut jobs = self.lock()?;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.enqueued_at = Some(OffsetDateTime::now_utc());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
