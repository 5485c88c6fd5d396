use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::coordinator::QueueCoordinator;
use super::entry::{SongEntry, SongStatus};
use super::prefetch::report;
use super::QueueError;
use crate::events::{EventBus, ShowEvent, Stage};
use crate::playback::output::OutputFactory;
use crate::playback::state::PlaybackHandle;
use crate::playback::sync::{SyncReport, Synchronizer};
use crate::show::library::ShowLibrary;

/// Everything the player loop needs to take a song from the queue to the lights.
pub struct PlayerContext {
    pub queue: Arc<QueueCoordinator>,
    pub bus: Arc<EventBus>,
    pub playback: PlaybackHandle,
    pub outputs: Box<OutputFactory>,
    pub library: ShowLibrary,
    pub tick: Duration,
}

/// Plays queued songs one after another on a background thread.
pub struct PlayerWorker {
    shutdown: Arc<AtomicBool>,
    playback: PlaybackHandle,
    handle: Option<JoinHandle<()>>,
}

impl PlayerWorker {
    pub fn spawn(ctx: PlayerContext, poll: Duration) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let playback = ctx.playback.clone();
        let handle = thread::Builder::new().name("player".into()).spawn(move || {
            log::info!("Player started");
            while !flag.load(Ordering::SeqCst) {
                if play_next(&ctx, &flag).is_none() {
                    thread::sleep(poll);
                }
            }
            log::info!("Player stopped");
        })?;
        Ok(Self {
            shutdown,
            playback,
            handle: Some(handle),
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.playback.request_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlayerWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Take the next song through download, show building and playback.
///
/// Returns `None` when nothing was played: the queue was empty, a song is
/// already playing, or the download was cancelled.
pub(crate) fn play_next(ctx: &PlayerContext, shutdown: &AtomicBool) -> Option<SyncReport> {
    if !ctx.queue.has_next() || ctx.queue.is_playing() {
        return None;
    }
    let next = ctx.queue.peek_next()?;
    log::info!("Preparing next song: {}", next.title);

    let audio = match fetch(ctx, &next, shutdown) {
        Ok(path) => path,
        Err(QueueError::Cancelled) => {
            log::info!("Download of {} cancelled", next.title);
            return None;
        }
        Err(e) => {
            log::error!("Could not download {}: {}", next.title, e);
            // pull it out so it does not block the rest of the queue
            if ctx.queue.peek_next().map_or(false, |s| s.id == next.id) {
                if let Some(song) = ctx.queue.pop_next() {
                    fail_song(ctx, song, &e.to_string());
                }
            }
            return None;
        }
    };

    if ctx.queue.peek_next().map_or(true, |s| s.id != next.id) {
        log::warn!("{} left the queue before it could start", next.title);
        return None;
    }
    let mut song = ctx.queue.pop_next()?;
    match ctx.queue.set_status(&song.id, SongStatus::Playing, 100) {
        Ok(updated) => song = updated,
        Err(e) => log::debug!("Status update skipped: {}", e),
    }
    log::info!("Processing song: {}", song.title);
    ctx.bus.emit(ShowEvent::QueueUpdated(ctx.queue.snapshot()));
    ctx.bus.emit(ShowEvent::SongStarted { song: song.clone() });

    let id = song.id.clone();
    let bus = &ctx.bus;
    let show = ctx.library.load_or_build_with(&audio, &|stage, pct| {
        bus.emit(ShowEvent::SongProgress {
            song_id: id.clone(),
            stage,
            progress: pct,
        });
    });
    let show = match show {
        Ok(show) => show,
        Err(e) => {
            fail_song(ctx, song, &format!("{:#}", e));
            return None;
        }
    };

    let duration = if song.duration > 0.0 { song.duration } else { show.duration };
    let output = match (ctx.outputs)(audio.as_path(), duration) {
        Ok(output) => output,
        Err(e) => {
            fail_song(ctx, song, &format!("{:#}", e));
            return None;
        }
    };

    ctx.bus.emit(ShowEvent::SongProgress {
        song_id: song.id.clone(),
        stage: Stage::Playing,
        progress: 100,
    });
    let report = Synchronizer::start(
        &song.id,
        duration,
        Some(show.frames),
        ctx.playback.clone(),
        ctx.bus.clone(),
        output,
        ctx.tick,
    )
    .run();

    finish_song(ctx, song);
    Some(report)
}

fn fetch(ctx: &PlayerContext, song: &SongEntry, shutdown: &AtomicBool) -> Result<PathBuf, QueueError> {
    report(&ctx.queue, &ctx.bus, &song.id, SongStatus::Downloading, Stage::Downloading, 0);
    let progress = |stage: Stage, pct: u8| {
        if stage == Stage::Downloading {
            let _ = ctx.queue.set_status(&song.id, SongStatus::Downloading, pct);
        }
        ctx.bus.emit(ShowEvent::SongProgress {
            song_id: song.id.clone(),
            stage,
            progress: pct,
        });
    };
    let cancelled = || shutdown.load(Ordering::SeqCst) || !ctx.queue.is_active(&song.id);
    let path = ctx.queue.ensure_downloaded(song, &progress, &cancelled)?;
    report(&ctx.queue, &ctx.bus, &song.id, SongStatus::Buffering, Stage::Buffering, 100);
    Ok(path)
}

/// A song that cannot be played is reported, then finished like any other.
fn fail_song(ctx: &PlayerContext, mut song: SongEntry, error: &str) {
    log::error!("Error processing {}: {}", song.title, error);
    match ctx.queue.set_status(&song.id, SongStatus::Error, 0) {
        Ok(updated) => song = updated,
        Err(e) => log::debug!("Status update skipped: {}", e),
    }
    ctx.bus.emit(ShowEvent::SongError {
        song: song.clone(),
        error: error.to_string(),
    });
    ctx.bus.emit(ShowEvent::SongProgress {
        song_id: song.id.clone(),
        stage: Stage::Error,
        progress: 0,
    });
    finish_song(ctx, song);
}

fn finish_song(ctx: &PlayerContext, song: SongEntry) {
    ctx.queue.clear_current();
    ctx.bus.emit(ShowEvent::QueueUpdated(ctx.queue.snapshot()));
    log::info!("Finished {}", song.title);
    ctx.bus.emit(ShowEvent::SongFinished { song });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::analysis::AnalysisParams;
    use crate::audio::decode::tests::{sine, write_wav};
    use crate::config::default_strips;
    use crate::playback::clock::ManualClock;
    use crate::playback::output::timed_factory;
    use crate::playback::sync::TickOutcome;
    use crate::queue::coordinator::tests::{temp_dir, FakeFetcher};
    use crate::show::composer::{ComposerSettings, LightShowComposer};
    use crossbeam_channel::Receiver;

    fn context(dir: &std::path::Path, fetcher: FakeFetcher) -> PlayerContext {
        let clock = Arc::new(ManualClock::new(0.0));
        PlayerContext {
            queue: Arc::new(
                QueueCoordinator::open(&dir.join("downloads"), Box::new(fetcher))
                    .unwrap()
                    .with_retry_backoff(Duration::from_millis(1)),
            ),
            bus: Arc::new(EventBus::new()),
            playback: PlaybackHandle::new(clock.clone()),
            outputs: timed_factory(clock),
            library: ShowLibrary::new(
                AnalysisParams::default(),
                LightShowComposer::new(default_strips(), ComposerSettings::default()),
                &dir.join("lightshows"),
            ),
            tick: Duration::from_millis(10),
        }
    }

    fn names(rx: &Receiver<ShowEvent>) -> Vec<&'static str> {
        rx.try_iter()
            .filter_map(|e| match e {
                ShowEvent::SongStarted { .. } => Some("started"),
                ShowEvent::SongError { .. } => Some("error"),
                ShowEvent::SongFinished { .. } => Some("finished"),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn plays_a_queued_song_to_the_end() {
        let dir = temp_dir("worker");
        let mut fetcher = FakeFetcher::new(0);
        let wav = write_wav("worker", 22050, 1, &sine(440.0, 22050, 1.0));
        fetcher.body = std::fs::read(&wav).unwrap();
        let ctx = context(&dir, fetcher);
        let rx = ctx.bus.subscribe();
        let song = ctx.queue.enqueue("https://x.org/tune.wav", Some("Tune".into()), None);

        let report = play_next(&ctx, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.outcome, TickOutcome::Finished);
        assert!(report.frames_sent > 0);

        let events: Vec<ShowEvent> = rx.try_iter().collect();
        let frames = events
            .iter()
            .filter(|e| matches!(e, ShowEvent::LightFrame { song_id, .. } if *song_id == song.id))
            .count();
        assert_eq!(frames, report.frames_sent);
        assert!(events.iter().any(|e| matches!(
            e,
            ShowEvent::SongProgress { stage: Stage::Playing, progress: 100, .. }
        )));
        assert!(matches!(events.last(), Some(ShowEvent::SongFinished { song: s }) if s.id == song.id));

        let view = ctx.queue.snapshot();
        assert!(view.queue.is_empty());
        assert!(view.current.is_none());
        assert!(!view.is_playing);
        assert!(ctx.library.path_for(&dir.join("downloads").join(format!("{}.wav", song.id))).exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn undecodable_song_reports_an_error_and_moves_on() {
        let dir = temp_dir("worker-bad");
        let ctx = context(&dir, FakeFetcher::new(0));
        let rx = ctx.bus.subscribe();
        ctx.queue.enqueue("https://x.org/broken.mp3", None, None);

        assert!(play_next(&ctx, &AtomicBool::new(false)).is_none());
        assert_eq!(names(&rx), vec!["started", "error", "finished"]);
        assert!(!ctx.queue.has_next());
        assert!(!ctx.queue.is_playing());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn failed_download_is_dropped_from_the_queue() {
        let dir = temp_dir("worker-dl");
        let ctx = context(&dir, FakeFetcher::new(99));
        let rx = ctx.bus.subscribe();
        ctx.queue.enqueue("https://x.org/gone.mp3", None, None);
        ctx.queue.enqueue("https://x.org/next.mp3", None, None);

        assert!(play_next(&ctx, &AtomicBool::new(false)).is_none());
        assert_eq!(names(&rx), vec!["error", "finished"]);
        assert_eq!(ctx.queue.snapshot().queue.len(), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn idle_when_queue_is_empty() {
        let dir = temp_dir("worker-idle");
        let ctx = context(&dir, FakeFetcher::new(0));
        assert!(play_next(&ctx, &AtomicBool::new(false)).is_none());
        std::fs::remove_dir_all(&dir).ok();
    }
}
