use std::env;
use std::str::FromStr;

pub enum EnvKey {
    ServerPort,
    DatabaseUrl,
    RabbitMqUrl,
    TranscodeQueue,
    StaticRoot,
    UploadsDir,
    StreamsDir,
    FfmpegBin,
    WorkerConcurrency,
    EncodeTimeoutSecs,
    ClearStaleOutput,
    MaxUploadBytes,
    ReconcileIntervalSecs,
    PendingRequeueSecs,
    StaleGraceSecs,
}

impl EnvKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvKey::ServerPort => "APP_PORT",
            EnvKey::DatabaseUrl => "DATABASE_URL",
            EnvKey::RabbitMqUrl => "RABBITMQ_URL",
            EnvKey::TranscodeQueue => "TRANSCODE_QUEUE",
            EnvKey::StaticRoot => "STATIC_ROOT",
            EnvKey::UploadsDir => "UPLOADS_DIR",
            EnvKey::StreamsDir => "STREAMS_DIR",
            EnvKey::FfmpegBin => "FFMPEG_BIN",
            EnvKey::WorkerConcurrency => "WORKER_CONCURRENCY",
            EnvKey::EncodeTimeoutSecs => "ENCODE_TIMEOUT_SECS",
            EnvKey::ClearStaleOutput => "CLEAR_STALE_OUTPUT",
            EnvKey::MaxUploadBytes => "MAX_UPLOAD_BYTES",
            EnvKey::ReconcileIntervalSecs => "RECONCILE_INTERVAL_SECS",
            EnvKey::PendingRequeueSecs => "PENDING_REQUEUE_SECS",
            EnvKey::StaleGraceSecs => "STALE_GRACE_SECS",
        }
    }
}

pub fn get(key: EnvKey) -> Result<String, env::VarError> {
    env::var(key.as_str())
}

/// Unset and blank values both count as absent.
pub fn get_optional(key: EnvKey) -> Option<String> {
    get(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn get_or(key: EnvKey, default: &str) -> String {
    env::var(key.as_str()).unwrap_or_else(|_| default.to_string())
}

/// Unset falls back to `default`; a value that does not parse is an error naming the key.
pub fn get_parsed<T: FromStr>(key: EnvKey, default: T) -> Result<T, String> {
    let name = key.as_str();
    match get(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} has invalid value '{}'", name, val)),
        Err(_) => Ok(default),
    }
}
