use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

// Lines of encoder stderr kept for the job's error message
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("encoder could not be started: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("encoder exited with {}: {stderr}", exit_label(.exit_code))]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },
    #[error("encoder finished but {} was not produced", .0.display())]
    MissingOutput(PathBuf),
    #[error("playlist {} is not usable: {reason}", .path.display())]
    InvalidPlaylist { path: PathBuf, reason: String },
    #[error("encode exceeded {}s and the encoder was terminated", .0.as_secs())]
    Timeout(Duration),
    #[error("encoder i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "no exit code (killed by signal)".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    EncoderFailure,
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::EncoderFailure => "encoder failure",
            FailureKind::Timeout => "timeout",
        }
    }
}

impl EncodeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EncodeError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::EncoderFailure,
        }
    }

    /// Text stored on the failed job.
    pub fn diagnostic(&self) -> String {
        format!("{}: {}", self.kind().as_str(), self)
    }
}

/// Fixed HLS transcode profile.
#[derive(Debug, Clone, PartialEq)]
pub struct HlsProfile {
    pub video_profile: &'static str,
    pub level: &'static str,
    pub start_number: u32,
    pub segment_seconds: u32,
    /// 0 keeps every segment in the playlist.
    pub list_size: u32,
}

impl Default for HlsProfile {
    fn default() -> Self {
        Self {
            video_profile: "baseline",
            level: "3.0",
            start_number: 0,
            segment_seconds: 10,
            list_size: 0,
        }
    }
}

impl HlsProfile {
    pub fn args(&self, input: &Path, playlist: &Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-profile:v".to_string(),
            self.video_profile.to_string(),
            "-level".to_string(),
            self.level.to_string(),
            "-start_number".to_string(),
            self.start_number.to_string(),
            "-hls_time".to_string(),
            self.segment_seconds.to_string(),
            "-hls_list_size".to_string(),
            self.list_size.to_string(),
            "-f".to_string(),
            "hls".to_string(),
            playlist.to_string_lossy().into_owned(),
        ]
    }
}

#[async_trait]
pub trait Encoder: Send + Sync {
    /// Runs one transcode to completion. Must not return before the process is gone.
    async fn encode(&self, input: &Path, playlist: &Path) -> Result<(), EncodeError>;
}

pub struct FfmpegEncoder {
    program: PathBuf,
    profile: HlsProfile,
    timeout: Duration,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            profile: HlsProfile::default(),
            timeout,
        }
    }
}

/// Keeps the last non-blank stderr lines. Bytes that are not UTF-8 (container
/// metadata echoed by ffmpeg) are replaced, never allowed to end the capture.
async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut reader = BufReader::new(reader);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Encoder stderr read failed: {}", e);
                // The child must never block on a full pipe.
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    Vec::from(tail).join("\n")
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(&self, input: &Path, playlist: &Path) -> Result<(), EncodeError> {
        let args = self.profile.args(input, playlist);
        info!("🎬 Running: {} {}", self.program.display(), args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EncodeError::Spawn)?;

        let stderr = child.stderr.take();
        let tail = tokio::spawn(async move {
            match stderr {
                Some(stderr) => collect_tail(stderr).await,
                None => String::new(),
            }
        });

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(
                    "⏱️ Encoder exceeded {:?}, killing pid {:?}",
                    self.timeout,
                    child.id()
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill encoder: {}", e);
                }
                tail.abort();
                return Err(EncodeError::Timeout(self.timeout));
            }
        };

        let stderr = tail.await.unwrap_or_default();
        debug!("Encoder exited with {}", status);

        if !status.success() {
            return Err(EncodeError::Failed {
                exit_code: status.code(),
                stderr,
            });
        }

        Ok(())
    }
}
