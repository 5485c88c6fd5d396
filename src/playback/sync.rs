use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use super::output::AudioOutput;
use super::state::PlaybackHandle;
use crate::events::{EventBus, ShowEvent};
use crate::show::model::Frame;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Audio went idle on its own
    Finished,
    /// Stop or skip was requested
    Stopped,
}

#[derive(Clone, Copy, Debug)]
pub struct SyncReport {
    pub outcome: TickOutcome,
    pub frames_sent: usize,
}

/// Emits light frames against a playing audio track.
///
/// Every tick maps the clock to a song position (minus time spent paused) and
/// emits each frame whose timestamp has come due, oldest first, exactly once.
pub struct Synchronizer {
    song_id: String,
    duration: f64,
    frames: Vec<Frame>,
    next_frame: usize,
    frames_sent: usize,
    playback: PlaybackHandle,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    output: Box<dyn AudioOutput>,
    tick: Duration,
    t0: f64,
    pause_offset: f64,
    current_time: f64,
    was_busy: bool,
    output_paused: bool,
    applied_volume: Option<f32>,
}

impl Synchronizer {
    /// Resets the shared playback record for `song_id` and starts the clock.
    pub fn start(
        song_id: &str,
        duration: f64,
        frames: Option<Vec<Frame>>,
        playback: PlaybackHandle,
        bus: Arc<EventBus>,
        output: Box<dyn AudioOutput>,
        tick: Duration,
    ) -> Self {
        let mut frames = frames.unwrap_or_default();
        frames.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        if !frames.is_empty() {
            let last = frames[frames.len() - 1].timestamp;
            log::info!("Light show has {} frames, last at {:.1}s", frames.len(), last);
            match bus.bridge_count() {
                0 => log::warn!("No bridge connected; lights won't show"),
                n => log::info!("{} bridge(s) connected", n),
            }
        }

        playback.begin(song_id);
        let clock = playback.clock().clone();
        let t0 = clock.now();
        Self {
            song_id: song_id.to_string(),
            duration,
            frames,
            next_frame: 0,
            frames_sent: 0,
            playback,
            clock,
            bus,
            output,
            tick,
            t0,
            pause_offset: 0.0,
            current_time: 0.0,
            was_busy: false,
            output_paused: false,
            applied_volume: None,
        }
    }

    pub fn current_time(&self) -> f64 {
        self.current_time
    }

    pub fn frames_sent(&self) -> usize {
        self.frames_sent
    }

    pub fn tick(&mut self) -> TickOutcome {
        let now = self.clock.now();
        let (stop, is_playing, pause_started, just_unpaused, volume) = {
            let mut s = self.playback.lock();
            self.pause_offset += std::mem::take(&mut s.unaccounted_pause);
            if !s.is_playing && s.pause_timestamp.is_none() {
                s.pause_timestamp = Some(now);
            }
            let just_unpaused = std::mem::take(&mut s.just_unpaused);
            (s.stop_requested, s.is_playing, s.pause_timestamp, just_unpaused, s.volume)
        };

        if stop {
            log::info!("Song {} was stopped", self.song_id);
            return TickOutcome::Stopped;
        }

        self.apply_output_state(is_playing, volume);

        let busy = self.output.is_busy();
        if just_unpaused {
            self.was_busy = false;
        } else if is_playing && self.was_busy && !busy {
            log::info!("Music ended naturally");
            return TickOutcome::Finished;
        } else if is_playing && busy {
            self.was_busy = true;
        }

        let position = if is_playing {
            now - self.t0 - self.pause_offset
        } else {
            pause_started.unwrap_or(now) - self.t0 - self.pause_offset
        };
        self.current_time = position.max(self.current_time).max(0.0);
        self.playback.lock().current_time = self.current_time;

        self.bus.emit(ShowEvent::PlaybackTimeUpdate {
            song_id: self.song_id.clone(),
            current_time: self.current_time,
            duration: self.duration,
        });
        self.emit_due_frames();
        TickOutcome::Continue
    }

    fn apply_output_state(&mut self, is_playing: bool, volume: f32) {
        if !is_playing && !self.output_paused {
            self.output.pause();
            self.output_paused = true;
        } else if is_playing && self.output_paused {
            self.output.resume();
            self.output_paused = false;
        }
        if self.applied_volume != Some(volume) {
            self.output.set_volume(volume);
            self.applied_volume = Some(volume);
        }
    }

    fn emit_due_frames(&mut self) {
        while let Some(frame) = self.frames.get(self.next_frame) {
            if frame.timestamp > self.current_time {
                break;
            }
            self.bus.emit(ShowEvent::LightFrame {
                song_id: self.song_id.clone(),
                timestamp: frame.timestamp,
                strips: frame.strips.clone(),
            });
            self.next_frame += 1;
            self.frames_sent += 1;
            if self.frames_sent == 1 {
                log::info!("First frame sent at {:.2}s", frame.timestamp);
            } else {
                log::trace!("Sent frame {} ({:.2}s)", self.frames_sent, frame.timestamp);
            }
        }
    }

    /// Tick until the audio ends or a stop is requested.
    pub fn run(mut self) -> SyncReport {
        let outcome = loop {
            match self.tick() {
                TickOutcome::Continue => self.clock.sleep(self.tick),
                done => break done,
            }
        };
        self.output.stop();
        self.playback.finish();
        log::info!(
            "Playback of {} finished ({:?}, sent {} frames)",
            self.song_id,
            outcome,
            self.frames_sent
        );
        SyncReport {
            outcome,
            frames_sent: self.frames_sent,
        }
    }
}
