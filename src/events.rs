//! Signals between the show pipeline and its subscribers.
//!
//! `ShowEvent`s flow out of the server; `ControlCommand`s flow in. Both are
//! serialized as one JSON object per line, tagged by `event` / `command`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::queue::entry::SongEntry;
use crate::show::model::StripFrame;
use crate::transport::monitor::DeviceInfo;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Downloading,
    Buffering,
    Downloaded,
    Analyzing,
    Generating,
    Playing,
    Error,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipDirection {
    #[default]
    Next,
    Previous,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueView {
    pub queue: Vec<SongEntry>,
    pub current: Option<SongEntry>,
    pub is_playing: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShowEvent {
    SongProgress {
        song_id: String,
        stage: Stage,
        progress: u8,
    },
    SongStarted {
        song: SongEntry,
    },
    SongFinished {
        song: SongEntry,
    },
    SongError {
        song: SongEntry,
        error: String,
    },
    PlaybackTimeUpdate {
        song_id: String,
        current_time: f64,
        duration: f64,
    },
    LightFrame {
        song_id: String,
        timestamp: f64,
        strips: Vec<StripFrame>,
    },
    PlaybackStateChanged {
        is_playing: bool,
    },
    SongSkipped {
        direction: SkipDirection,
    },
    QueueUpdated(QueueView),
    DeviceInfo(DeviceInfo),
    LedLevels {
        levels: Vec<f32>,
        ts: f64,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BridgeAnnouncement {
    pub total_leds: usize,
    pub segments: Vec<usize>,
    #[serde(default)]
    pub port: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// `playing` absent flips the current state
    TogglePlayback {
        #[serde(default)]
        playing: Option<bool>,
    },
    SkipSong {
        #[serde(default)]
        direction: SkipDirection,
    },
    SeekSong {
        time: f64,
    },
    SetVolume {
        volume: f32,
    },
    Enqueue {
        url: String,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        duration: Option<f64>,
    },
    Remove {
        id: String,
    },
    AnnounceBridge(BridgeAnnouncement),
    DeviceInfo(DeviceInfo),
    LedLevels {
        levels: Vec<f32>,
        ts: f64,
    },
}

const SUBSCRIBER_CAPACITY: usize = 1024;

impl ShowEvent {
    /// Continuous updates a lagging subscriber can miss; the next one supersedes it.
    fn is_stream(&self) -> bool {
        matches!(
            self,
            ShowEvent::LightFrame { .. } | ShowEvent::PlaybackTimeUpdate { .. } | ShowEvent::LedLevels { .. }
        )
    }
}

/// Fan-out of `ShowEvent`s to every subscriber.
///
/// Each subscriber has a bounded queue. Stream events are dropped once it is
/// half full so a slow client never holds up the sync loop or piles up frames;
/// the other half is kept for lifecycle events.
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ShowEvent>>>,
    capacity: usize,
    bridges: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(2),
            bridges: AtomicUsize::new(0),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Sender<ShowEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Receiver for all future events.
    pub fn subscribe(&self) -> Receiver<ShowEvent> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers().push(tx);
        rx
    }

    /// Emit to all subscribers, dropping any that have gone away.
    pub fn emit(&self, event: ShowEvent) {
        let stream = event.is_stream();
        let half = self.capacity / 2;
        self.subscribers().retain(|tx| {
            if stream && tx.len() >= half {
                log::trace!("Subscriber lagging; dropped a stream event");
                return true;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Subscriber queue full; dropped an event");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    pub fn bridge_connected(&self) {
        self.bridges.fetch_add(1, Ordering::SeqCst);
    }

    pub fn bridge_disconnected(&self) {
        let _ = self
            .bridges
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape() {
        let json = serde_json::to_value(ShowEvent::LightFrame {
            song_id: "s1".into(),
            timestamp: 0.5,
            strips: vec![StripFrame {
                strip_id: 0,
                leds: vec![[1, 2, 3]],
            }],
        })
        .unwrap();
        assert_eq!(json["event"], "light_frame");
        assert_eq!(json["timestamp"], 0.5);
        assert_eq!(json["strips"][0]["leds"][0][2], 3);

        let json = serde_json::to_value(ShowEvent::SongSkipped {
            direction: SkipDirection::Next,
        })
        .unwrap();
        assert_eq!(json["direction"], "next");
    }

    #[test]
    fn commands_parse() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"command":"toggle_playback","playing":false}"#).unwrap();
        assert_eq!(cmd, ControlCommand::TogglePlayback { playing: Some(false) });
        let cmd: ControlCommand = serde_json::from_str(r#"{"command":"skip_song"}"#).unwrap();
        assert_eq!(cmd, ControlCommand::SkipSong { direction: SkipDirection::Next });
        let cmd: ControlCommand = serde_json::from_str(
            r#"{"command":"announce_bridge","total_leds":1050,"segments":[150,300,300,300]}"#,
        )
        .unwrap();
        assert!(matches!(cmd, ControlCommand::AnnounceBridge(ref a) if a.total_leds == 1050));
    }

    #[test]
    fn bus_fans_out_and_prunes() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.emit(ShowEvent::PlaybackStateChanged { is_playing: true });
        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
        drop(b);
        bus.emit(ShowEvent::PlaybackStateChanged { is_playing: false });
        assert_eq!(bus.subscriber_count(), 1);
    }

    fn frame(timestamp: f64) -> ShowEvent {
        ShowEvent::LightFrame {
            song_id: "s".into(),
            timestamp,
            strips: Vec::new(),
        }
    }

    #[test]
    fn lagging_subscriber_sheds_frames_but_keeps_lifecycle_events() {
        let bus = EventBus::with_capacity(8);
        let slow = bus.subscribe();
        for i in 0..100 {
            bus.emit(frame(i as f64));
        }
        assert_eq!(slow.len(), 4);
        bus.emit(ShowEvent::PlaybackStateChanged { is_playing: false });
        assert_eq!(slow.len(), 5);

        // a reader that keeps up sees everything
        let fast = bus.subscribe();
        for i in 0..20 {
            bus.emit(frame(i as f64));
            assert!(matches!(fast.try_recv(), Ok(ShowEvent::LightFrame { timestamp, .. }) if timestamp == i as f64));
        }
        assert_eq!(slow.len(), 5);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn bridge_count_never_underflows() {
        let bus = EventBus::new();
        bus.bridge_disconnected();
        assert_eq!(bus.bridge_count(), 0);
        bus.bridge_connected();
        assert_eq!(bus.bridge_count(), 1);
    }
}
