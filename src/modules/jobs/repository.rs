use super::model::{Job, JobRow, JobStatus, NewJob, Transition, UnknownStatus};
use crate::infrastructure::db::pool::DbPool;
use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt job row: {0}")]
    Corrupt(#[from] UnknownStatus),
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// Durable job records keyed by id.
///
/// Every status change goes through [`JobStore::compare_and_set`], which is the
/// single fencing point that keeps two deliveries of one job from both encoding.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Newest first.
    async fn list(&self, limit: i64) -> Result<Vec<Job>, StoreError>;

    /// Applies `transition` only if the stored status equals `transition.expected()`.
    /// Returns `None` (and writes nothing) when the precondition does not hold or the
    /// job does not exist.
    async fn compare_and_set(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> Result<Option<Job>, StoreError>;

    /// Jobs in `status` whose last transition happened before `updated_before`.
    async fn find_stale(
        &self,
        status: JobStatus,
        updated_before: OffsetDateTime,
    ) -> Result<Vec<Job>, StoreError>;

    /// Pending jobs last changed before `updated_before` whose task was never
    /// confirmed by the queue.
    async fn find_unqueued(&self, updated_before: OffsetDateTime) -> Result<Vec<Job>, StoreError>;

    /// Records that a task for the job reached the queue. Only pending jobs are
    /// marked; returns whether the row changed.
    async fn mark_enqueued(&self, id: Uuid) -> Result<bool, StoreError>;
}

pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter()
        .map(|row| Job::try_from(row).map_err(StoreError::from))
        .collect()
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (id, title, description, source_path, output_root, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING id, title, description, source_path, output_root, status,
                      output_url, error_message, duration_seconds, enqueued_at, created_at, updated_at
            "#,
        )
        .bind(job.id)
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.source_path)
        .bind(&job.output_root)
        .fetch_one(&self.pool)
        .await?;

        Ok(Job::try_from(row)?)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, title, description, source_path, output_root, status,
                   output_url, error_message, duration_seconds, enqueued_at, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose().map_err(StoreError::from)
    }

    async fn list(&self, limit: i64) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, title, description, source_path, output_root, status,
                   output_url, error_message, duration_seconds, enqueued_at, created_at, updated_at
            FROM jobs
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        into_jobs(rows)
    }

    async fn compare_and_set(
        &self,
        id: Uuid,
        transition: &Transition,
    ) -> Result<Option<Job>, StoreError> {
        // output_url / error_message are rewritten on every transition so the
        // iff-invariants hold row-wide; duration only ever gets filled in.
        let (output_url, error_message, duration_seconds) = match transition {
            Transition::Claim => (None, None, None),
            Transition::Complete {
                output_url,
                duration_seconds,
            } => (Some(output_url.as_str()), None, *duration_seconds),
            Transition::Fail { error_message } => (None, Some(error_message.as_str()), None),
        };

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET
                status = $2,
                output_url = $3,
                error_message = $4,
                duration_seconds = COALESCE($5, duration_seconds),
                updated_at = NOW()
            WHERE id = $1 AND status = $6
            RETURNING id, title, description, source_path, output_root, status,
                      output_url, error_message, duration_seconds, enqueued_at, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(transition.target().as_str())
        .bind(output_url)
        .bind(error_message)
        .bind(duration_seconds)
        .bind(transition.expected().as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose().map_err(StoreError::from)
    }

    async fn find_stale(
        &self,
        status: JobStatus,
        updated_before: OffsetDateTime,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, title, description, source_path, output_root, status,
                   output_url, error_message, duration_seconds, enqueued_at, created_at, updated_at
            FROM jobs
            WHERE status = $1 AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT 500
            "#,
        )
        .bind(status.as_str())
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;

        into_jobs(rows)
    }

    async fn find_unqueued(&self, updated_before: OffsetDateTime) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, title, description, source_path, output_root, status,
                   output_url, error_message, duration_seconds, enqueued_at, created_at, updated_at
            FROM jobs
            WHERE status = 'pending' AND enqueued_at IS NULL AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT 500
            "#,
        )
        .bind(updated_before)
        .fetch_all(&self.pool)
        .await?;

        into_jobs(rows)
    }

    async fn mark_enqueued(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET enqueued_at = NOW() WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
