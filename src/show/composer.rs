use rayon::prelude::*;

use super::color;
use super::model::{Frame, LightShow, PatternKind, StripConfig, StripFrame};
use super::patterns::{self, PatternInput};
use crate::audio::features::AudioAnalysis;
use crate::config::{AudioConfig, ShowConfig};

#[derive(Clone, Debug)]
pub struct ComposerSettings {
    /// Keep every n-th analysis frame
    pub decimation: usize,
    /// Seconds within which a beat or onset counts for a frame
    pub event_window: f64,
    pub beat_brightness: f32,
    pub onset_hue_shift: f32,
}

impl ComposerSettings {
    pub fn new(audio: &AudioConfig, show: &ShowConfig) -> Self {
        Self {
            decimation: audio.frame_decimation.max(1),
            event_window: audio.beat_window,
            beat_brightness: show.beat_brightness,
            onset_hue_shift: show.onset_hue_shift,
        }
    }
}

impl Default for ComposerSettings {
    fn default() -> Self {
        Self::new(&AudioConfig::default(), &ShowConfig::default())
    }
}

pub struct LightShowComposer {
    strips: Vec<StripConfig>,
    settings: ComposerSettings,
}

impl LightShowComposer {
    pub fn new(strips: Vec<StripConfig>, settings: ComposerSettings) -> Self {
        Self { strips, settings }
    }

    /// Frames retained from `analysis`: one per full decimation stride.
    pub fn frame_count(&self, analysis: &AudioAnalysis) -> usize {
        analysis.frame_times.len() / self.settings.decimation
    }

    pub fn generate(&self, analysis: &AudioAnalysis, duration: f64) -> LightShow {
        self.generate_with_progress(analysis, duration, &|| {})
    }

    /// `on_frame` is called once per composed frame, from worker threads.
    pub fn generate_with_progress(
        &self,
        analysis: &AudioAnalysis,
        duration: f64,
        on_frame: &(dyn Fn() + Sync),
    ) -> LightShow {
        let features = &analysis.features;
        if features.frame_count() == 0 {
            log::warn!("Analysis has no feature frames; light show will be empty");
        } else {
            let max_energy = features.energy.iter().copied().fold(0.0f32, f32::max);
            let max_bass = features.bass.iter().copied().fold(0.0f32, f32::max);
            log::debug!("max(energy)={:.3}, max(bass)={:.3}", max_energy, max_bass);
        }
        if !features.is_consistent() {
            log::warn!("Feature arrays differ in length; missing values read as 0");
        }

        let stride = self.settings.decimation;
        let retained = self.frame_count(analysis);
        log::info!(
            "Composing {} frames (every {}th of {} analysis frames) for {} strips",
            retained,
            stride,
            analysis.frame_times.len(),
            self.strips.len()
        );

        let frames: Vec<Frame> = (0..retained)
            .into_par_iter()
            .map(|k| {
                let frame = self.compose_frame(analysis, k * stride);
                on_frame();
                frame
            })
            .collect();

        log::info!("Generated {} frames for {:.2}s song", frames.len(), duration);

        LightShow {
            duration,
            fps: if analysis.frame_duration > 0.0 {
                1.0 / analysis.frame_duration
            } else {
                0.0
            },
            strip_configs: self.strips.clone(),
            frames,
        }
    }

    fn compose_frame(&self, analysis: &AudioAnalysis, idx: usize) -> Frame {
        let timestamp = analysis.frame_times[idx];
        let window = self.settings.event_window;
        let is_beat = near_any(&analysis.beat_times, timestamp, window);
        let is_onset = near_any(&analysis.onset_times, timestamp, window);
        let features = analysis.features.frame(idx);

        let mut base = color::mix(&[
            (color::RED, features.bass),
            (color::GREEN, features.mid),
            (color::BLUE, features.treble),
        ]);

        let mut brightness = features.energy;
        if is_beat {
            brightness = (brightness * self.settings.beat_brightness).min(1.0);
        }
        if is_onset {
            base = color::shift_hue(base, self.settings.onset_hue_shift);
        }

        let input = PatternInput {
            color: color::scale(base, brightness),
            timestamp,
            features,
            is_beat,
        };

        let strips = self
            .strips
            .iter()
            .enumerate()
            .map(|(pos, strip)| {
                let kind = strip.pattern.unwrap_or_else(|| PatternKind::for_position(pos));
                StripFrame {
                    strip_id: strip.id,
                    leds: patterns::render(kind, &input, strip.led_count),
                }
            })
            .collect();

        Frame { timestamp, strips }
    }
}

/// Whether any time in ascending `times` lies strictly within `window` of `t`.
fn near_any(times: &[f64], t: f64, window: f64) -> bool {
    let idx = times.partition_point(|&x| x < t);
    let after = times.get(idx).map_or(false, |&x| (x - t).abs() < window);
    let before = idx > 0 && (t - times[idx - 1]).abs() < window;
    after || before
}
