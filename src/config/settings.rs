use crate::config::env::{self, EnvKey};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0}")]
    Invalid(String),
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_port: u16,
    /// `None` runs with the in-process job store.
    pub database_url: Option<String>,
    /// `None` runs with the in-process task queue.
    pub rabbitmq_url: Option<String>,
    pub transcode_queue: String,
    pub static_root: PathBuf,
    pub uploads_dir: String,
    pub streams_dir: String,
    pub ffmpeg_bin: String,
    pub worker_concurrency: usize,
    pub encode_timeout: Duration,
    pub clear_stale_output: bool,
    pub max_upload_bytes: usize,
    /// Zero disables the reconciler.
    pub reconcile_interval: Duration,
    pub pending_requeue_after: Duration,
    pub stale_grace: Duration,
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() / 2)
        .unwrap_or(1)
        .max(1)
}

fn single_segment(key: &str, value: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') || trimmed == "." || trimmed == ".." {
        return Err(ConfigError::Invalid(format!(
            "{} must be a single directory name, got '{}'",
            key, value
        )));
    }
    Ok(trimmed.to_string())
}

impl AppConfig {
    pub fn new() -> Result<Self, ConfigError> {
        let invalid = ConfigError::Invalid;

        let uploads_dir = single_segment(
            EnvKey::UploadsDir.as_str(),
            &env::get_or(EnvKey::UploadsDir, "uploads"),
        )?;
        let streams_dir = single_segment(
            EnvKey::StreamsDir.as_str(),
            &env::get_or(EnvKey::StreamsDir, "streams"),
        )?;
        if uploads_dir == streams_dir {
            return Err(invalid("UPLOADS_DIR and STREAMS_DIR must differ".to_string()));
        }

        let worker_concurrency =
            env::get_parsed(EnvKey::WorkerConcurrency, default_concurrency()).map_err(invalid)?;
        if worker_concurrency == 0 {
            return Err(invalid("WORKER_CONCURRENCY must be at least 1".to_string()));
        }

        let encode_timeout_secs: u64 = env::get_parsed(EnvKey::EncodeTimeoutSecs, 3600).map_err(invalid)?;
        if encode_timeout_secs == 0 {
            return Err(invalid("ENCODE_TIMEOUT_SECS must be positive".to_string()));
        }

        Ok(Self {
            server_port: env::get_parsed(EnvKey::ServerPort, 3000).map_err(invalid)?,
            database_url: env::get_optional(EnvKey::DatabaseUrl),
            rabbitmq_url: env::get_optional(EnvKey::RabbitMqUrl),
            transcode_queue: env::get_or(EnvKey::TranscodeQueue, "transcoding_tasks"),
            static_root: PathBuf::from(env::get_or(EnvKey::StaticRoot, "static")),
            uploads_dir,
            streams_dir,
            ffmpeg_bin: env::get_or(EnvKey::FfmpegBin, "ffmpeg"),
            worker_concurrency,
            encode_timeout: Duration::from_secs(encode_timeout_secs),
            clear_stale_output: env::get_parsed(EnvKey::ClearStaleOutput, true).map_err(invalid)?,
            max_upload_bytes: env::get_parsed(EnvKey::MaxUploadBytes, 2 * 1024 * 1024 * 1024)
                .map_err(invalid)?,
            reconcile_interval: Duration::from_secs(
                env::get_parsed(EnvKey::ReconcileIntervalSecs, 60).map_err(invalid)?,
            ),
            pending_requeue_after: Duration::from_secs(
                env::get_parsed(EnvKey::PendingRequeueSecs, 600).map_err(invalid)?,
            ),
            stale_grace: Duration::from_secs(env::get_parsed(EnvKey::StaleGraceSecs, 300).map_err(invalid)?),
        })
    }

    /// How long an in_progress job may go untouched before it is presumed abandoned.
    pub fn stale_after(&self) -> Duration {
        self.encode_timeout + self.stale_grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_names_must_be_single_segments() {
        assert_eq!(single_segment("STREAMS_DIR", "/streams/").unwrap(), "streams");
        for bad in ["", "/", "a/b", "..", "."] {
            assert!(single_segment("STREAMS_DIR", bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn stale_after_adds_grace_to_timeout() {
        let config = AppConfig {
            server_port: 3000,
            database_url: None,
            rabbitmq_url: None,
            transcode_queue: "transcoding_tasks".into(),
            static_root: PathBuf::from("static"),
            uploads_dir: "uploads".into(),
            streams_dir: "streams".into(),
            ffmpeg_bin: "ffmpeg".into(),
            worker_concurrency: 1,
            encode_timeout: Duration::from_secs(3600),
            clear_stale_output: true,
            max_upload_bytes: 1024,
            reconcile_interval: Duration::from_secs(60),
            pending_requeue_after: Duration::from_secs(600),
            stale_grace: Duration::from_secs(300),
        };
        assert_eq!(config.stale_after(), Duration::from_secs(3900));
    }

    #[test]
    fn default_concurrency_is_at_least_one() {
        assert!(default_concurrency() >= 1);
    }
}
