use serde::{Deserialize, Serialize};

use super::QueueError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SongStatus {
    Queued,
    Downloading,
    /// Downloaded and next in line
    Buffering,
    Downloaded,
    Playing,
    Error,
}

impl SongStatus {
    pub fn can_become(self, next: SongStatus) -> bool {
        use SongStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (_, Error) => true,
            (Queued, Downloading | Buffering | Downloaded) => true,
            (Downloading, Queued | Buffering | Downloaded) => true,
            (Buffering, Downloaded | Playing) => true,
            (Downloaded, Buffering | Playing) => true,
            (Error, Queued | Downloading) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SongEntry {
    pub id: String,
    pub url: String,
    pub title: String,
    /// Seconds; 0 when unknown until the file is decoded
    #[serde(default)]
    pub duration: f64,
    pub status: SongStatus,
    /// 0-100
    #[serde(default)]
    pub progress: u8,
}

impl SongEntry {
    pub fn new(url: &str, title: Option<String>, duration: Option<f64>) -> Self {
        let title = title.unwrap_or_else(|| title_from_url(url));
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_string(),
            title,
            duration: duration.unwrap_or(0.0),
            status: SongStatus::Queued,
            progress: 0,
        }
    }

    /// Key the download cache uses.
    pub fn source_key(&self) -> &str {
        &self.url
    }

    pub fn set_status(&mut self, next: SongStatus, progress: u8) -> Result<(), QueueError> {
        if !self.status.can_become(next) {
            return Err(QueueError::IllegalTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.progress = progress.min(100);
        Ok(())
    }
}

fn title_from_url(url: &str) -> String {
    let last = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
    let stem = last.rsplit_once('.').map_or(last, |(stem, _)| stem);
    if stem.is_empty() {
        "Unknown".to_string()
    } else {
        stem.to_string()
    }
}
