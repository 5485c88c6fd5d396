use std::path::Path;
use std::sync::Arc;

use super::clock::Clock;

/// The device actually playing the song. Owned by the sync loop's thread.
pub trait AudioOutput {
    /// True while audio is still being rendered.
    fn is_busy(&self) -> bool;
    fn pause(&mut self);
    fn resume(&mut self);
    fn stop(&mut self);
    fn set_volume(&mut self, volume: f32);
}

/// Creates an output already playing `path` (`duration` seconds long).
pub type OutputFactory = dyn Fn(&Path, f64) -> anyhow::Result<Box<dyn AudioOutput>> + Send + Sync;

/// Headless output: busy until `duration` seconds of unpaused clock time pass.
pub struct TimedOutput {
    clock: Arc<dyn Clock>,
    duration: f64,
    started: f64,
    paused_at: Option<f64>,
    paused_total: f64,
    stopped: bool,
}

impl TimedOutput {
    pub fn start(clock: Arc<dyn Clock>, duration: f64) -> Self {
        let started = clock.now();
        Self {
            clock,
            duration,
            started,
            paused_at: None,
            paused_total: 0.0,
            stopped: false,
        }
    }

    fn played(&self) -> f64 {
        let end = self.paused_at.unwrap_or_else(|| self.clock.now());
        end - self.started - self.paused_total
    }
}

impl AudioOutput for TimedOutput {
    fn is_busy(&self) -> bool {
        !self.stopped && self.played() < self.duration
    }

    fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(self.clock.now());
        }
    }

    fn resume(&mut self) {
        if let Some(at) = self.paused_at.take() {
            self.paused_total += self.clock.now() - at;
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }

    fn set_volume(&mut self, _volume: f32) {}
}

pub fn timed_factory(clock: Arc<dyn Clock>) -> Box<OutputFactory> {
    Box::new(move |_path: &Path, duration: f64| {
        Ok(Box::new(TimedOutput::start(clock.clone(), duration)) as Box<dyn AudioOutput>)
    })
}

#[cfg(feature = "playback")]
mod speaker {
    use super::AudioOutput;
    use anyhow::{Context, Result};
    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
    use std::fs::File;
    use std::io::BufReader;
    use std::path::Path;

    /// Plays through the default audio device.
    pub struct RodioOutput {
        _stream: OutputStream,
        _handle: OutputStreamHandle,
        sink: Sink,
    }

    impl RodioOutput {
        pub fn start(path: &Path) -> Result<Self> {
            let (stream, handle) =
                OutputStream::try_default().context("Failed to open audio output device")?;
            let sink = Sink::try_new(&handle).context("Failed to create audio sink")?;
            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let source = Decoder::new(BufReader::new(file))
                .with_context(|| format!("Failed to decode {}", path.display()))?;
            sink.append(source);
            Ok(Self {
                _stream: stream,
                _handle: handle,
                sink,
            })
        }
    }

    impl AudioOutput for RodioOutput {
        fn is_busy(&self) -> bool {
            !self.sink.empty()
        }

        fn pause(&mut self) {
            self.sink.pause();
        }

        fn resume(&mut self) {
            self.sink.play();
        }

        fn stop(&mut self) {
            self.sink.stop();
        }

        fn set_volume(&mut self, volume: f32) {
            self.sink.set_volume(volume);
        }
    }
}

#[cfg(feature = "playback")]
pub use speaker::RodioOutput;

/// Speakers when built with the `playback` feature, the timed stand-in otherwise.
pub fn default_factory(clock: Arc<dyn Clock>) -> Box<OutputFactory> {
    #[cfg(feature = "playback")]
    {
        let _ = clock;
        Box::new(|path: &Path, _duration: f64| {
            Ok(Box::new(RodioOutput::start(path)?) as Box<dyn AudioOutput>)
        })
    }
    #[cfg(not(feature = "playback"))]
    {
        log::info!("Built without the `playback` feature; audio is timed, not heard");
        timed_factory(clock)
    }
}
