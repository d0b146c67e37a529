use anyhow::{anyhow, Result};
use axum::{body::Bytes, extract::multipart::Field};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

/// Streams one upload to a local file without buffering it in memory.
pub struct DiskUploader {
    path: PathBuf,
    file: File,
    written: u64,
}

impl DiskUploader {
    pub async fn new(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .await
            .map_err(|e| anyhow!("Failed to create {}: {}", path.display(), e))?;

        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.file.write_all(&chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.written)
    }

    pub async fn abort(self) {
        drop(self.file);
        discard(&self.path).await;
    }
}

/// Removes a partially or fully written upload that will not be processed.
pub async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("🗑️ Discarded upload {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to discard upload {}: {}", path.display(), e),
    }
}

/// Accepts `video/*` parts, or untyped parts whose file name looks like a video.
pub fn is_video(content_type: Option<&str>, file_name: &str) -> bool {
    match content_type.and_then(|ct| ct.parse::<mime::Mime>().ok()) {
        Some(m) if m.type_() == mime::VIDEO => true,
        Some(m) if m.essence_str() != mime::APPLICATION_OCTET_STREAM.essence_str() => false,
        _ => {
            let ext = Path::new(file_name)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            matches!(
                ext.as_deref(),
                Some("mp4" | "mov" | "mkv" | "webm" | "avi" | "m4v" | "mpg" | "mpeg" | "ts")
            )
        }
    }
}

pub async fn stream_to_disk(mut field: Field<'_>, path: PathBuf) -> Result<u64> {
    let content_type = field.content_type().map(str::to_string);
    let file_name = field.file_name().unwrap_or("").to_string();

    if !is_video(content_type.as_deref(), &file_name) {
        return Err(anyhow!("Invalid content type: only video/* allowed"));
    }

    let mut uploader = DiskUploader::new(path).await?;

    loop {
        let chunk = match field.chunk().await {
            Ok(Some(c)) => c,
            Ok(None) => break,
            Err(e) => {
                error!("Stream error: {}", e);
                uploader.abort().await;
                return Err(anyhow!("Stream interrupted"));
            }
        };

        if let Err(e) = uploader.write_chunk(chunk).await {
            error!("Upload error: {}", e);
            uploader.abort().await;
            return Err(e);
        }
    }

    if uploader.written == 0 {
        uploader.abort().await;
        return Err(anyhow!("Uploaded file is empty"));
    }

    uploader.finish().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_detection() {
        assert!(is_video(Some("video/mp4"), "clip.bin"));
        assert!(is_video(Some("video/quicktime"), ""));
        assert!(!is_video(Some("image/png"), "clip.mp4"));
        assert!(is_video(Some("application/octet-stream"), "clip.MKV"));
        assert!(is_video(None, "clip.webm"));
        assert!(!is_video(None, "notes.txt"));
    }

    #[tokio::test]
    async fn abort_removes_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("partial.mp4");
        let mut uploader = DiskUploader::new(path.clone()).await.unwrap();
        uploader.write_chunk(Bytes::from_static(b"abc")).await.unwrap();

        uploader.abort().await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn finish_reports_bytes_written() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("whole.mp4");
        let mut uploader = DiskUploader::new(path.clone()).await.unwrap();
        uploader.write_chunk(Bytes::from_static(b"abc")).await.unwrap();
        uploader.write_chunk(Bytes::from_static(b"defg")).await.unwrap();

        assert_eq!(uploader.finish().await.unwrap(), 7);
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefg");
    }
}
