use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const PLAYLIST_NAME: &str = "output.m3u8";

#[derive(Debug, Error, PartialEq)]
pub enum LayoutError {
    #[error("output root '{0}' must be a non-empty relative path without '..'")]
    InvalidOutputRoot(String),
}

/// Where one job's artifacts live on disk and how clients address them.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLocation {
    pub dir: PathBuf,
    pub playlist: PathBuf,
    pub url: String,
}

/// Builds `{static_root}/{output_root}/{job_id}/output.m3u8` and the public URL
/// `/{output_root}/{job_id}/output.m3u8`. Pure; touches no filesystem.
pub fn locate(static_root: &Path, output_root: &str, job_id: Uuid) -> Result<OutputLocation, LayoutError> {
    let root = output_root.trim_matches('/');
    let safe = !root.is_empty()
        && Path::new(root)
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !safe {
        return Err(LayoutError::InvalidOutputRoot(output_root.to_string()));
    }

    let dir = static_root.join(root).join(job_id.to_string());
    let playlist = dir.join(PLAYLIST_NAME);
    let url = format!("/{}/{}/{}", root, job_id, PLAYLIST_NAME);

    Ok(OutputLocation { dir, playlist, url })
}

/// Keeps the extension of a client-supplied file name, lowercased and limited to
/// ASCII alphanumerics. Anything else falls back to `.bin`.
fn sanitized_extension(file_name: &str) -> String {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    if !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        ext.to_ascii_lowercase()
    } else {
        "bin".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceCleanup {
    Removed,
    AlreadyAbsent,
}

/// Upload and output directory conventions under one static root.
#[derive(Debug, Clone)]
pub struct FileLayout {
    static_root: PathBuf,
    uploads_dir: String,
    streams_dir: String,
}

impl FileLayout {
    pub fn new(static_root: impl Into<PathBuf>, uploads_dir: &str, streams_dir: &str) -> Self {
        Self {
            static_root: static_root.into(),
            uploads_dir: uploads_dir.trim_matches('/').to_string(),
            streams_dir: streams_dir.trim_matches('/').to_string(),
        }
    }

    /// The default output root for new jobs; also the public URL prefix.
    pub fn streams_dir(&self) -> &str {
        &self.streams_dir
    }

    pub fn streams_path(&self) -> PathBuf {
        self.static_root.join(&self.streams_dir)
    }

    pub fn uploads_path(&self) -> PathBuf {
        self.static_root.join(&self.uploads_dir)
    }

    pub async fn ensure_roots(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(self.uploads_path()).await?;
        tokio::fs::create_dir_all(self.streams_path()).await?;
        info!("✅ Static folders ready under {}", self.static_root.display());
        Ok(())
    }

    pub fn upload_path(&self, job_id: Uuid, file_name: &str) -> PathBuf {
        self.uploads_path()
            .join(format!("{}.{}", job_id, sanitized_extension(file_name)))
    }

    pub fn locate(&self, output_root: &str, job_id: Uuid) -> Result<OutputLocation, LayoutError> {
        locate(&self.static_root, output_root, job_id)
    }

    /// Idempotent. With `clear_stale` the directory is emptied first; this is only
    /// safe once the caller holds the job's claim.
    pub async fn prepare_output_dir(&self, dir: &Path, clear_stale: bool) -> io::Result<()> {
        if clear_stale && tokio::fs::try_exists(dir).await? {
            let mut entries = tokio::fs::read_dir(dir).await?;
            let mut cleared = 0usize;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    tokio::fs::remove_dir_all(&path).await?;
                } else {
                    tokio::fs::remove_file(&path).await?;
                }
                cleared += 1;
            }
            if cleared > 0 {
                warn!("Cleared {} stale entries from {}", cleared, dir.display());
            }
        }

        tokio::fs::create_dir_all(dir).await
    }

    /// Deletes a source upload. A missing file is not an error.
    pub async fn remove_source(&self, path: &Path) -> io::Result<SourceCleanup> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!("🗑️ Deleted source file {}", path.display());
                Ok(SourceCleanup::Removed)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Source file already gone: {}", path.display());
                Ok(SourceCleanup::AlreadyAbsent)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_builds_dir_playlist_and_url() {
        let id = Uuid::new_v4();
        let loc = locate(Path::new("static"), "streams", id).unwrap();

        assert_eq!(loc.dir, PathBuf::from(format!("static/streams/{}", id)));
        assert_eq!(loc.playlist, PathBuf::from(format!("static/streams/{}/output.m3u8", id)));
        assert_eq!(loc.url, format!("/streams/{}/output.m3u8", id));
    }

    #[test]
    fn locate_normalizes_surrounding_slashes() {
        let id = Uuid::new_v4();
        let loc = locate(Path::new("/srv/static"), "/streams/", id).unwrap();
        assert_eq!(loc.url, format!("/streams/{}/output.m3u8", id));
        assert_eq!(loc.dir, PathBuf::from(format!("/srv/static/streams/{}", id)));
    }

    #[test]
    fn locate_rejects_escaping_roots() {
        let id = Uuid::new_v4();
        for bad in ["", "/", "../etc", "streams/../../x", "./streams"] {
            assert!(locate(Path::new("static"), bad, id).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn upload_names_keep_only_safe_extensions() {
        let layout = FileLayout::new("static", "uploads", "streams");
        let id = Uuid::new_v4();

        assert_eq!(
            layout.upload_path(id, "My Movie.MP4"),
            PathBuf::from(format!("static/uploads/{}.mp4", id))
        );
        assert_eq!(
            layout.upload_path(id, "../../evil.sh;rm"),
            PathBuf::from(format!("static/uploads/{}.bin", id))
        );
        assert_eq!(
            layout.upload_path(id, "noext"),
            PathBuf::from(format!("static/uploads/{}.bin", id))
        );
    }

    #[tokio::test]
    async fn prepare_output_dir_is_idempotent_and_keeps_files_by_default() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(tmp.path(), "uploads", "streams");
        let loc = layout.locate("streams", Uuid::new_v4()).unwrap();

        layout.prepare_output_dir(&loc.dir, false).await.unwrap();
        std::fs::write(loc.dir.join("output0.ts"), b"old").unwrap();
        layout.prepare_output_dir(&loc.dir, false).await.unwrap();

        assert!(loc.dir.join("output0.ts").exists());
    }

    #[tokio::test]
    async fn prepare_output_dir_clears_stale_segments_when_asked() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(tmp.path(), "uploads", "streams");
        let loc = layout.locate("streams", Uuid::new_v4()).unwrap();

        std::fs::create_dir_all(loc.dir.join("nested")).unwrap();
        std::fs::write(loc.dir.join("output7.ts"), b"stale").unwrap();
        std::fs::write(&loc.playlist, b"#EXTM3U\n").unwrap();

        layout.prepare_output_dir(&loc.dir, true).await.unwrap();

        assert!(loc.dir.is_dir());
        assert_eq!(std::fs::read_dir(&loc.dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn remove_source_tolerates_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(tmp.path(), "uploads", "streams");
        let source = tmp.path().join("clip.mp4");
        std::fs::write(&source, b"data").unwrap();

        assert_eq!(layout.remove_source(&source).await.unwrap(), SourceCleanup::Removed);
        assert!(!source.exists());
        assert_eq!(layout.remove_source(&source).await.unwrap(), SourceCleanup::AlreadyAbsent);
    }
}
