use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;

use super::clock::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    Idle,
    Playing,
    Paused,
    Stopped,
}

/// The one shared playback record.
#[derive(Clone, Debug, Serialize)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current_song_id: Option<String>,
    /// Seconds into the current song
    pub current_time: f64,
    /// Clock reading when the current pause began
    pub pause_timestamp: Option<f64>,
    pub just_unpaused: bool,
    pub stop_requested: bool,
    /// Finished pauses the sync loop has not yet folded into its offset
    #[serde(skip)]
    pub unaccounted_pause: f64,
    pub volume: f32,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            is_playing: false,
            current_song_id: None,
            current_time: 0.0,
            pause_timestamp: None,
            just_unpaused: false,
            stop_requested: false,
            unaccounted_pause: 0.0,
            volume: 1.0,
        }
    }
}

impl PlaybackState {
    pub fn mode(&self) -> PlaybackMode {
        if self.current_song_id.is_none() {
            PlaybackMode::Idle
        } else if self.stop_requested {
            PlaybackMode::Stopped
        } else if self.is_playing {
            PlaybackMode::Playing
        } else {
            PlaybackMode::Paused
        }
    }
}

/// Cloneable handle injected into the sync loop and the command handlers.
#[derive(Clone)]
pub struct PlaybackHandle {
    state: Arc<Mutex<PlaybackState>>,
    clock: Arc<dyn Clock>,
}

impl PlaybackHandle {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PlaybackState::default())),
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Lock for the duration of one access. A poisoned lock is recovered,
    /// the record stays usable.
    pub fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> PlaybackState {
        self.lock().clone()
    }

    pub fn mode(&self) -> PlaybackMode {
        self.lock().mode()
    }

    /// Returns false when nothing was playing.
    pub fn pause(&self) -> bool {
        let now = self.clock.now();
        let mut s = self.lock();
        if !s.is_playing || s.current_song_id.is_none() {
            return false;
        }
        s.is_playing = false;
        s.pause_timestamp.get_or_insert(now);
        true
    }

    /// Returns false when nothing was paused.
    pub fn resume(&self) -> bool {
        let now = self.clock.now();
        let mut s = self.lock();
        if s.is_playing || s.current_song_id.is_none() {
            return false;
        }
        if let Some(started) = s.pause_timestamp.take() {
            s.unaccounted_pause += (now - started).max(0.0);
        }
        s.is_playing = true;
        s.just_unpaused = true;
        true
    }

    pub fn request_stop(&self) {
        self.lock().stop_requested = true;
    }

    pub fn set_volume(&self, volume: f32) {
        self.lock().volume = volume.clamp(0.0, 1.0);
    }

    /// Reset for a new song.
    pub fn begin(&self, song_id: &str) {
        let mut s = self.lock();
        s.current_song_id = Some(song_id.to_string());
        s.is_playing = true;
        s.current_time = 0.0;
        s.pause_timestamp = None;
        s.just_unpaused = false;
        s.stop_requested = false;
        s.unaccounted_pause = 0.0;
    }

    pub fn finish(&self) {
        let mut s = self.lock();
        s.current_song_id = None;
        s.is_playing = false;
        s.pause_timestamp = None;
        s.just_unpaused = false;
        s.unaccounted_pause = 0.0;
    }
}
