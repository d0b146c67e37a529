use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// The only legal edges: pending -> in_progress -> {completed | failed}.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::InProgress)
                | (JobStatus::InProgress, JobStatus::Completed)
                | (JobStatus::InProgress, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, ToSchema)]
pub struct Job {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub source_path: String,
    pub output_root: String,
    pub status: JobStatus,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
    /// Set once a task message for the job was confirmed by the queue.
    #[serde(default, with = "time::serde::iso8601::option")]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub enqueued_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::iso8601")]
    #[schema(value_type = String, format = DateTime)]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::iso8601")]
    #[schema(value_type = String, format = DateTime)]
    pub updated_at: OffsetDateTime,
}

impl Job {
    pub fn new(new: NewJob, now: OffsetDateTime) -> Self {
        Self {
            id: new.id,
            title: new.title,
            description: new.description,
            source_path: new.source_path,
            output_root: new.output_root,
            status: JobStatus::Pending,
            output_url: None,
            error_message: None,
            duration_seconds: None,
            enqueued_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// Status is stored as text in the jobs table
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub source_path: String,
    pub output_root: String,
    pub status: String,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
    pub enqueued_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TryFrom<JobRow> for Job {
    type Error = UnknownStatus;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            title: row.title,
            description: row.description,
            source_path: row.source_path,
            output_root: row.output_root,
            status: row.status.parse()?,
            output_url: row.output_url,
            error_message: row.error_message,
            duration_seconds: row.duration_seconds,
            enqueued_at: row.enqueued_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub source_path: String,
    pub output_root: String,
}

/// A conditional status change. It only applies while the stored status still
/// equals [`Transition::expected`].
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Claim,
    Complete {
        output_url: String,
        duration_seconds: Option<f64>,
    },
    Fail {
        error_message: String,
    },
}

impl Transition {
    pub fn expected(&self) -> JobStatus {
        match self {
            Transition::Claim => JobStatus::Pending,
            Transition::Complete { .. } | Transition::Fail { .. } => JobStatus::InProgress,
        }
    }

    pub fn target(&self) -> JobStatus {
        match self {
            Transition::Claim => JobStatus::InProgress,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Fail { .. } => JobStatus::Failed,
        }
    }

    /// Returns false and leaves `job` untouched when the precondition does not hold.
    pub fn apply(&self, job: &mut Job, now: OffsetDateTime) -> bool {
        if job.status != self.expected() {
            return false;
        }
        debug_assert!(job.status.can_transition_to(self.target()));

        match self {
            Transition::Claim => {}
            Transition::Complete {
                output_url,
                duration_seconds,
            } => {
                job.output_url = Some(output_url.clone());
                job.error_message = None;
                if duration_seconds.is_some() {
                    job.duration_seconds = *duration_seconds;
                }
            }
            Transition::Fail { error_message } => {
                job.error_message = Some(error_message.clone());
                job.output_url = None;
            }
        }

        job.status = self.target();
        job.updated_at = now;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_job() -> Job {
        Job::new(
            NewJob {
                id: Uuid::new_v4(),
                title: "Test".into(),
                description: None,
                source_path: "static/uploads/a.mp4".into(),
                output_root: "streams".into(),
            },
            OffsetDateTime::now_utc(),
        )
    }

    #[test]
    fn status_round_trips_through_its_text_form() {
        for status in [
            JobStatus::Pending,
            JobStatus::InProgress,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_forward_edges_are_legal() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(InProgress));
        assert!(!InProgress.can_transition_to(Pending));
    }

    #[test]
    fn complete_sets_url_and_keeps_error_empty() {
        let mut job = pending_job();
        assert!(Transition::Claim.apply(&mut job, OffsetDateTime::now_utc()));

        let done = Transition::Complete {
            output_url: format!("/streams/{}/output.m3u8", job.id),
            duration_seconds: Some(24.5),
        };
        assert!(done.apply(&mut job, OffsetDateTime::now_utc()));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.output_url.is_some());
        assert!(job.error_message.is_none());
        assert_eq!(job.duration_seconds, Some(24.5));
    }

    #[test]
    fn transitions_out_of_terminal_states_are_refused() {
        let mut job = pending_job();
        Transition::Claim.apply(&mut job, OffsetDateTime::now_utc());
        Transition::Fail {
            error_message: "boom".into(),
        }
        .apply(&mut job, OffsetDateTime::now_utc());
        let snapshot = job.clone();

        let retry = Transition::Complete {
            output_url: "/streams/x/output.m3u8".into(),
            duration_seconds: None,
        };
        assert!(!retry.apply(&mut job, OffsetDateTime::now_utc()));
        assert!(!Transition::Claim.apply(&mut job, OffsetDateTime::now_utc()));
        assert_eq!(job, snapshot);
        assert!(job.output_url.is_none());
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn claim_requires_pending() {
        let mut job = pending_job();
        assert!(Transition::Claim.apply(&mut job, OffsetDateTime::now_utc()));
        assert!(!Transition::Claim.apply(&mut job, OffsetDateTime::now_utc()));
        assert_eq!(job.status, JobStatus::InProgress);
    }
}
