use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::coordinator::QueueCoordinator;
use super::entry::{SongEntry, SongStatus};
use super::QueueError;
use crate::events::{EventBus, ShowEvent, Stage};

/// Downloads queued songs ahead of playback, once per song id.
///
/// A download is abandoned as soon as its song leaves the queue or the worker
/// is shut down.
pub struct Prefetcher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn spawn(
        queue: Arc<QueueCoordinator>,
        bus: Arc<EventBus>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::Builder::new()
            .name("prefetch".into())
            .spawn(move || {
                let mut seen = HashSet::new();
                while !flag.load(Ordering::SeqCst) {
                    prefetch_pass(&queue, &bus, &mut seen, &flag);
                    thread::sleep(interval);
                }
            })?;
        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Record a status change and tell subscribers. Out-of-order updates are
/// dropped with a debug log.
pub(crate) fn report(queue: &QueueCoordinator, bus: &EventBus, id: &str, status: SongStatus, stage: Stage, progress: u8) {
    if let Err(e) = queue.set_status(id, status, progress) {
        log::debug!("Status update skipped: {}", e);
    }
    bus.emit(ShowEvent::SongProgress {
        song_id: id.to_string(),
        stage,
        progress,
    });
}

/// Download every queued song not handled yet.
pub(crate) fn prefetch_pass(
    queue: &QueueCoordinator,
    bus: &EventBus,
    seen: &mut HashSet<String>,
    shutdown: &AtomicBool,
) {
    let pending: Vec<SongEntry> = queue.snapshot().queue;
    seen.retain(|id| pending.iter().any(|s| &s.id == id));

    for song in pending {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        if !seen.insert(song.id.clone()) {
            continue;
        }
        if !queue.is_active(&song.id) {
            continue;
        }

        if matches!(song.status, SongStatus::Queued | SongStatus::Error) {
            report(queue, bus, &song.id, SongStatus::Downloading, Stage::Downloading, 0);
            bus.emit(ShowEvent::QueueUpdated(queue.snapshot()));
        }

        let id = song.id.clone();
        let progress = |stage: Stage, pct: u8| {
            if stage == Stage::Downloading {
                let _ = queue.set_status(&id, SongStatus::Downloading, pct);
            }
            bus.emit(ShowEvent::SongProgress {
                song_id: id.clone(),
                stage,
                progress: pct,
            });
        };
        let cancelled = || shutdown.load(Ordering::SeqCst) || !queue.is_active(&id);

        match queue.ensure_downloaded(&song, &progress, &cancelled) {
            Ok(_) => {
                let (status, stage) = if queue.position(&song.id) == Some(0) {
                    (SongStatus::Buffering, Stage::Buffering)
                } else {
                    (SongStatus::Downloaded, Stage::Downloaded)
                };
                report(queue, bus, &song.id, status, stage, 100);
                bus.emit(ShowEvent::QueueUpdated(queue.snapshot()));
                log::info!("Ready: {}", song.title);
            }
            Err(QueueError::Cancelled) => {
                log::info!("Prefetch of {} cancelled", song.title);
            }
            Err(e) => {
                log::warn!("Prefetch error for {}: {}", song.title, e);
                report(queue, bus, &song.id, SongStatus::Error, Stage::Error, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::coordinator::tests::{temp_dir, FakeFetcher};

    fn stages_for(rx: &crossbeam_channel::Receiver<ShowEvent>, id: &str) -> Vec<(Stage, u8)> {
        rx.try_iter()
            .filter_map(|e| match e {
                ShowEvent::SongProgress { song_id, stage, progress } if song_id == id => Some((stage, progress)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn pass_downloads_each_song_once() {
        let dir = temp_dir("prefetch");
        let fetcher = FakeFetcher::new(0);
        let calls = fetcher.calls.clone();
        let queue = QueueCoordinator::open(&dir, Box::new(fetcher)).unwrap();
        let bus = EventBus::new();
        let rx = bus.subscribe();
        let a = queue.enqueue("https://x.org/a.mp3", None, None);
        queue.enqueue("https://x.org/b.mp3", None, None);

        let mut seen = HashSet::new();
        let stop = AtomicBool::new(false);
        prefetch_pass(&queue, &bus, &mut seen, &stop);
        prefetch_pass(&queue, &bus, &mut seen, &stop);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let view = queue.snapshot();
        assert_eq!(view.queue[0].status, SongStatus::Buffering);
        assert_eq!(view.queue[1].status, SongStatus::Downloaded);

        let a_stages = stages_for(&rx, &a.id);
        assert_eq!(a_stages.first(), Some(&(Stage::Downloading, 0)));
        assert_eq!(a_stages.last(), Some(&(Stage::Buffering, 100)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn failed_download_marks_error() {
        let dir = temp_dir("prefetch-err");
        let queue = QueueCoordinator::open(&dir, Box::new(FakeFetcher::new(99)))
            .unwrap()
            .with_retry_backoff(Duration::from_millis(1));
        let bus = EventBus::new();
        let song = queue.enqueue("https://x.org/broken.mp3", None, None);
        prefetch_pass(&queue, &bus, &mut HashSet::new(), &AtomicBool::new(false));
        assert_eq!(queue.snapshot().queue[0].status, SongStatus::Error);
        assert!(queue.is_active(&song.id));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn worker_thread_prefetches_and_shuts_down() {
        let dir = temp_dir("prefetch-thread");
        let queue = Arc::new(QueueCoordinator::open(&dir, Box::new(FakeFetcher::new(0))).unwrap());
        let bus = Arc::new(EventBus::new());
        queue.enqueue("https://x.org/c.mp3", None, None);
        let worker = Prefetcher::spawn(queue.clone(), bus, Duration::from_millis(10)).unwrap();
        let mut ready = false;
        for _ in 0..200 {
            if queue.snapshot().queue[0].status == SongStatus::Buffering {
                ready = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        worker.shutdown();
        assert!(ready);
        std::fs::remove_dir_all(&dir).ok();
    }
}
