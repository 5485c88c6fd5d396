use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::download::{extension_for, Fetcher};
use super::entry::{SongEntry, SongStatus};
use super::QueueError;
use crate::events::{QueueView, Stage};

const QUEUE_STATE_FILE: &str = "queue_state.json";
const CACHE_INDEX_FILE: &str = "cache_index.json";
const MAX_ATTEMPTS: u32 = 5;

#[derive(Default)]
struct QueueInner {
    queue: Vec<SongEntry>,
    current: Option<SongEntry>,
    is_playing: bool,
}

#[derive(Serialize, Deserialize)]
struct SavedQueue {
    queue: Vec<SongEntry>,
    #[serde(default)]
    current_song: Option<SongEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CacheEntry {
    path: PathBuf,
    #[serde(default)]
    title: Option<String>,
}

/// The song queue plus the download cache behind it.
///
/// Each structure has its own lock, held only for the access itself; file and
/// network I/O happen outside them.
pub struct QueueCoordinator {
    inner: Mutex<QueueInner>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// One lock per source being fetched, so concurrent callers share a download
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    download_dir: PathBuf,
    fetcher: Box<dyn Fetcher>,
    retry_backoff: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl QueueCoordinator {
    /// Open the coordinator over `download_dir`, restoring any saved queue.
    pub fn open(download_dir: &Path, fetcher: Box<dyn Fetcher>) -> Result<Self, QueueError> {
        std::fs::create_dir_all(download_dir)?;
        let coordinator = Self {
            inner: Mutex::new(QueueInner::default()),
            cache: Mutex::new(load_json(&download_dir.join(CACHE_INDEX_FILE)).unwrap_or_default()),
            in_flight: Mutex::new(HashMap::new()),
            download_dir: download_dir.to_path_buf(),
            fetcher,
            retry_backoff: Duration::from_millis(800),
        };
        if let Some(saved) = load_json::<SavedQueue>(&download_dir.join(QUEUE_STATE_FILE)) {
            let mut inner = lock(&coordinator.inner);
            inner.queue = saved.queue;
            inner.current = saved.current_song;
            // always restored as not playing
            inner.is_playing = false;
            log::info!("Queue state loaded: {} songs", inner.queue.len());
            if let Some(current) = &inner.current {
                log::info!("  Current: {}", current.title);
            }
        }
        Ok(coordinator)
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn enqueue(&self, url: &str, title: Option<String>, duration: Option<f64>) -> SongEntry {
        let song = SongEntry::new(url, title, duration);
        log::info!("Queued {} ({})", song.title, song.id);
        lock(&self.inner).queue.push(song.clone());
        self.save_state();
        song
    }

    /// Next song without removing it.
    pub fn peek_next(&self) -> Option<SongEntry> {
        lock(&self.inner).queue.first().cloned()
    }

    /// Remove the next song and make it current.
    pub fn pop_next(&self) -> Option<SongEntry> {
        let popped = {
            let mut inner = lock(&self.inner);
            if inner.queue.is_empty() {
                return None;
            }
            let song = inner.queue.remove(0);
            inner.current = Some(song.clone());
            inner.is_playing = true;
            song
        };
        self.save_state();
        Some(popped)
    }

    pub fn has_next(&self) -> bool {
        !lock(&self.inner).queue.is_empty()
    }

    pub fn is_playing(&self) -> bool {
        lock(&self.inner).is_playing
    }

    /// True while the song is waiting in the queue or is the current one.
    pub fn is_active(&self, id: &str) -> bool {
        let inner = lock(&self.inner);
        inner.queue.iter().any(|s| s.id == id)
            || inner.current.as_ref().map_or(false, |s| s.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        lock(&self.inner).queue.iter().position(|s| s.id == id)
    }

    pub fn remove(&self, id: &str) -> Result<SongEntry, QueueError> {
        let removed = {
            let mut inner = lock(&self.inner);
            let idx = inner
                .queue
                .iter()
                .position(|s| s.id == id)
                .ok_or_else(|| QueueError::UnknownSong(id.to_string()))?;
            inner.queue.remove(idx)
        };
        log::info!("Removed {} from the queue", removed.title);
        self.save_state();
        Ok(removed)
    }

    pub fn skip_current(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.current = None;
            inner.is_playing = false;
        }
        self.save_state();
    }

    pub fn clear_current(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.current = None;
            inner.is_playing = false;
        }
        self.save_state();
    }

    /// Move a queued or current song to `status`.
    pub fn set_status(&self, id: &str, status: SongStatus, progress: u8) -> Result<SongEntry, QueueError> {
        let mut inner = lock(&self.inner);
        let inner = &mut *inner;
        let song = inner
            .queue
            .iter_mut()
            .chain(inner.current.iter_mut())
            .find(|s| s.id == id)
            .ok_or_else(|| QueueError::UnknownSong(id.to_string()))?;
        song.set_status(status, progress)?;
        Ok(song.clone())
    }

    pub fn snapshot(&self) -> QueueView {
        let inner = lock(&self.inner);
        QueueView {
            queue: inner.queue.clone(),
            current: inner.current.clone(),
            is_playing: inner.is_playing,
        }
    }

    fn save_state(&self) {
        let saved = {
            let inner = lock(&self.inner);
            SavedQueue {
                queue: inner.queue.clone(),
                current_song: inner.current.clone(),
            }
        };
        if let Err(e) = save_json(&self.download_dir.join(QUEUE_STATE_FILE), &saved) {
            log::warn!("Error saving queue state: {}", e);
        }
    }

    fn cached_path(&self, key: &str) -> Option<PathBuf> {
        lock(&self.cache)
            .get(key)
            .map(|e| e.path.clone())
            .filter(|p| p.exists())
    }

    fn register_cache(&self, song: &SongEntry, path: &Path) {
        let snapshot = {
            let mut cache = lock(&self.cache);
            cache.insert(
                song.source_key().to_string(),
                CacheEntry {
                    path: path.to_path_buf(),
                    title: Some(song.title.clone()),
                },
            );
            cache.clone()
        };
        if let Err(e) = save_json(&self.download_dir.join(CACHE_INDEX_FILE), &snapshot) {
            log::warn!("Error saving cache index: {}", e);
        }
    }

    /// Local file for `song`, downloading it if no cached copy exists.
    ///
    /// Safe to call from several threads for the same song; only one fetch runs.
    pub fn ensure_downloaded(
        &self,
        song: &SongEntry,
        progress: &dyn Fn(Stage, u8),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<PathBuf, QueueError> {
        let key = song.source_key().to_string();
        let gate = lock(&self.in_flight)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock(&gate);
            self.fetch_or_reuse(song, &key, progress, cancelled)
        };

        let mut in_flight = lock(&self.in_flight);
        // gates are only cloned under this lock: two owners means the map and us
        if Arc::strong_count(&gate) == 2 {
            in_flight.remove(&key);
        }
        result
    }

    fn fetch_or_reuse(
        &self,
        song: &SongEntry,
        key: &str,
        progress: &dyn Fn(Stage, u8),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<PathBuf, QueueError> {
        if let Some(path) = self.cached_path(key) {
            log::debug!("Cache hit for {}: {}", song.title, path.display());
            progress(Stage::Buffering, 100);
            return Ok(path);
        }

        let target = self
            .download_dir
            .join(format!("{}.{}", song.id, extension_for(&song.url)));
        if target.exists() {
            self.register_cache(song, &target);
            progress(Stage::Buffering, 100);
            return Ok(target);
        }

        let part = target.with_extension("part");
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            if cancelled() {
                return Err(QueueError::Cancelled);
            }
            progress(Stage::Downloading, 0);
            match self
                .fetcher
                .fetch(&song.url, &part, &|pct| progress(Stage::Downloading, pct), cancelled)
            {
                Ok(()) => {
                    std::fs::rename(&part, &target)?;
                    self.register_cache(song, &target);
                    log::info!("Downloaded {} to {}", song.title, target.display());
                    progress(Stage::Buffering, 100);
                    return Ok(target);
                }
                Err(QueueError::Cancelled) => {
                    let _ = std::fs::remove_file(&part);
                    return Err(QueueError::Cancelled);
                }
                Err(e) => {
                    log::warn!(
                        "Download attempt {}/{} for {} failed: {}",
                        attempt,
                        MAX_ATTEMPTS,
                        song.title,
                        e
                    );
                    let _ = std::fs::remove_file(&part);
                    last_err = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        std::thread::sleep(self.retry_backoff * attempt);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| QueueError::Download {
            url: song.url.clone(),
            reason: "no attempts made".into(),
        }))
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            log::warn!("Ignoring unreadable {}: {}", path.display(), e);
            None
        }
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)
}
