//! Minimal reader for the media playlists the encoder writes.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PlaylistError {
    #[error("missing #EXTM3U header")]
    MissingHeader,
    #[error("bad #EXTINF duration on line {0}")]
    BadDuration(usize),
    #[error("playlist lists no segments")]
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub uri: String,
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Playlist {
    pub segments: Vec<Segment>,
    /// `#EXT-X-ENDLIST` seen, i.e. the playlist is complete.
    pub ended: bool,
}

impl Playlist {
    pub fn parse(text: &str) -> Result<Self, PlaylistError> {
        let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l.trim()));

        match lines.by_ref().find(|(_, l)| !l.is_empty()) {
            Some((_, "#EXTM3U")) => {}
            _ => return Err(PlaylistError::MissingHeader),
        }

        let mut segments = Vec::new();
        let mut ended = false;
        let mut pending_duration: Option<f64> = None;

        for (number, line) in lines {
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("#EXTINF:") {
                let value = rest.split(',').next().unwrap_or("").trim();
                let duration = value
                    .parse::<f64>()
                    .map_err(|_| PlaylistError::BadDuration(number))?;
                pending_duration = Some(duration);
            } else if line == "#EXT-X-ENDLIST" {
                ended = true;
            } else if line.starts_with('#') {
                continue;
            } else if let Some(duration) = pending_duration.take() {
                segments.push(Segment {
                    uri: line.to_string(),
                    duration,
                });
            }
        }

        if segments.is_empty() {
            return Err(PlaylistError::Empty);
        }

        Ok(Self { segments, ended })
    }

    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }
}
