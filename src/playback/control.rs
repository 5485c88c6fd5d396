use std::sync::Arc;

use super::state::PlaybackHandle;
use crate::events::{ControlCommand, EventBus, QueueView, ShowEvent, SkipDirection};
use crate::queue::coordinator::QueueCoordinator;
use crate::queue::QueueError;

/// Applies control commands to the shared playback record and the queue.
pub struct Controller {
    playback: PlaybackHandle,
    queue: Option<Arc<QueueCoordinator>>,
    bus: Arc<EventBus>,
}

impl Controller {
    pub fn new(playback: PlaybackHandle, queue: Option<Arc<QueueCoordinator>>, bus: Arc<EventBus>) -> Self {
        Self { playback, queue, bus }
    }

    pub fn handle(&self, cmd: ControlCommand) -> Result<(), QueueError> {
        match cmd {
            ControlCommand::TogglePlayback { playing } => {
                let want = playing.unwrap_or(!self.playback.snapshot().is_playing);
                let changed = if want {
                    self.playback.resume()
                } else {
                    self.playback.pause()
                };
                let is_playing = self.playback.snapshot().is_playing;
                if changed {
                    log::info!("Playback {}", if is_playing { "resumed" } else { "paused" });
                }
                self.bus.emit(ShowEvent::PlaybackStateChanged { is_playing });
            }
            ControlCommand::SkipSong { direction } => match direction {
                SkipDirection::Next => {
                    log::info!("Skipping current song");
                    self.playback.request_stop();
                    if let Some(queue) = &self.queue {
                        queue.skip_current();
                    }
                    self.bus.emit(ShowEvent::SongSkipped { direction });
                }
                SkipDirection::Previous => log::info!("Skipping back is not supported"),
            },
            ControlCommand::SeekSong { time } => {
                log::info!("Seek to {:.1}s requested; seeking is not supported", time);
            }
            ControlCommand::SetVolume { volume } => {
                self.playback.set_volume(volume);
                log::debug!("Volume set to {:.2}", self.playback.snapshot().volume);
            }
            ControlCommand::Enqueue { url, title, duration } => {
                let queue = self.queue()?;
                queue.enqueue(&url, title, duration);
                self.bus.emit(ShowEvent::QueueUpdated(queue.snapshot()));
            }
            ControlCommand::Remove { id } => {
                let queue = self.queue()?;
                queue.remove(&id)?;
                self.bus.emit(ShowEvent::QueueUpdated(queue.snapshot()));
            }
            ControlCommand::AnnounceBridge(announcement) => {
                self.bus.bridge_connected();
                log::info!(
                    "Bridge connected: {} LEDs in {:?} ({})",
                    announcement.total_leds,
                    announcement.segments,
                    announcement.port.as_deref().unwrap_or("no port")
                );
            }
            ControlCommand::DeviceInfo(info) => self.bus.emit(ShowEvent::DeviceInfo(info)),
            ControlCommand::LedLevels { levels, ts } => self.bus.emit(ShowEvent::LedLevels { levels, ts }),
        }
        Ok(())
    }

    /// Current queue, for clients that just connected.
    pub fn queue_view(&self) -> Option<QueueView> {
        self.queue.as_ref().map(|q| q.snapshot())
    }

    fn queue(&self) -> Result<&Arc<QueueCoordinator>, QueueError> {
        self.queue.as_ref().ok_or(QueueError::NoQueue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BridgeAnnouncement;
    use crate::playback::clock::ManualClock;
    use crate::queue::coordinator::tests::{temp_dir, FakeFetcher};

    fn controller(queue: Option<Arc<QueueCoordinator>>) -> (Controller, PlaybackHandle, Arc<EventBus>) {
        let playback = PlaybackHandle::new(Arc::new(ManualClock::new(0.0)));
        let bus = Arc::new(EventBus::new());
        (Controller::new(playback.clone(), queue, bus.clone()), playback, bus)
    }

    #[test]
    fn toggle_pauses_and_resumes() {
        let (ctl, playback, bus) = controller(None);
        let rx = bus.subscribe();
        playback.begin("song");

        ctl.handle(ControlCommand::TogglePlayback { playing: None }).unwrap();
        assert!(!playback.snapshot().is_playing);
        ctl.handle(ControlCommand::TogglePlayback { playing: Some(false) }).unwrap();
        assert!(!playback.snapshot().is_playing);
        ctl.handle(ControlCommand::TogglePlayback { playing: Some(true) }).unwrap();
        assert!(playback.snapshot().is_playing);

        let states: Vec<bool> = rx
            .try_iter()
            .filter_map(|e| match e {
                ShowEvent::PlaybackStateChanged { is_playing } => Some(is_playing),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![false, false, true]);
    }

    #[test]
    fn skip_next_stops_the_song() {
        let (ctl, playback, bus) = controller(None);
        let rx = bus.subscribe();
        playback.begin("song");
        ctl.handle(ControlCommand::SkipSong { direction: SkipDirection::Next }).unwrap();
        assert!(playback.snapshot().stop_requested);
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, ShowEvent::SongSkipped { direction: SkipDirection::Next })));

        let (ctl, playback, _) = controller(None);
        playback.begin("song");
        ctl.handle(ControlCommand::SkipSong { direction: SkipDirection::Previous }).unwrap();
        assert!(!playback.snapshot().stop_requested);
    }

    #[test]
    fn queue_commands_broadcast_the_queue() {
        let dir = temp_dir("control");
        let queue = Arc::new(QueueCoordinator::open(&dir, Box::new(FakeFetcher::new(0))).unwrap());
        let (ctl, _, bus) = controller(Some(queue.clone()));
        let rx = bus.subscribe();

        ctl.handle(ControlCommand::Enqueue {
            url: "https://x.org/a.mp3".into(),
            title: Some("A".into()),
            duration: Some(180.0),
        })
        .unwrap();
        let id = queue.peek_next().unwrap().id;
        assert!(matches!(rx.try_recv(), Ok(ShowEvent::QueueUpdated(v)) if v.queue.len() == 1));

        assert!(ctl.handle(ControlCommand::Remove { id: "missing".into() }).is_err());
        ctl.handle(ControlCommand::Remove { id }).unwrap();
        assert!(matches!(rx.try_recv(), Ok(ShowEvent::QueueUpdated(v)) if v.queue.is_empty()));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn volume_bridge_and_telemetry() {
        let (ctl, playback, bus) = controller(None);
        let rx = bus.subscribe();
        ctl.handle(ControlCommand::SetVolume { volume: 0.4 }).unwrap();
        assert!((playback.snapshot().volume - 0.4).abs() < 1e-6);

        ctl.handle(ControlCommand::AnnounceBridge(BridgeAnnouncement {
            total_leds: 10,
            segments: vec![10],
            port: None,
        }))
        .unwrap();
        assert_eq!(bus.bridge_count(), 1);

        ctl.handle(ControlCommand::LedLevels { levels: vec![0.5], ts: 1.0 }).unwrap();
        assert!(matches!(rx.try_recv(), Ok(ShowEvent::LedLevels { ts, .. }) if ts == 1.0));

        assert!(ctl.handle(ControlCommand::Enqueue { url: "x".into(), title: None, duration: None }).is_err());
    }
}
