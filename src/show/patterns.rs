use std::f64::consts::TAU;

use super::color::{self, Color};
use super::model::{PatternKind, Rgb};
use crate::audio::features::FrameFeatures;

/// Waves per second traveling along a wave strip
const WAVE_SPEED: f64 = 2.0;
/// Strip lengths per second covered by the chase head
const CHASE_SPEED: f64 = 3.0;
const CHASE_LENGTH: usize = 20;
const CHASE_FLOOR: f32 = 0.1;
const PULSE_BEAT_BOOST: f32 = 1.8;

/// Everything a pattern sees for one frame.
#[derive(Clone, Copy, Debug)]
pub struct PatternInput {
    /// Base color with brightness already applied
    pub color: Color,
    pub timestamp: f64,
    pub features: FrameFeatures,
    pub is_beat: bool,
}

pub fn render(kind: PatternKind, input: &PatternInput, led_count: usize) -> Vec<Rgb> {
    if led_count == 0 {
        return Vec::new();
    }
    match kind {
        PatternKind::Spectrum => spectrum(input, led_count),
        PatternKind::Wave => wave(input, led_count),
        PatternKind::Pulse => pulse(input, led_count),
        PatternKind::Chase => chase(input, led_count),
    }
}

/// Thirds of the strip driven by bass, mid and treble.
fn spectrum(input: &PatternInput, led_count: usize) -> Vec<Rgb> {
    let f = input.features;
    let section = led_count / 3;
    let bass = color::scale(color::RED, f.bass.max(0.0).sqrt() * f.energy);
    let mid = color::scale(color::GREEN, f.mid.max(0.0).sqrt() * f.energy);
    let treble = color::scale(color::BLUE, f.treble.max(0.0).sqrt() * f.energy);
    (0..led_count)
        .map(|i| {
            let c = if i < section {
                bass
            } else if i < section * 2 {
                mid
            } else {
                treble
            };
            color::to_pixel(c)
        })
        .collect()
}

fn wave(input: &PatternInput, led_count: usize) -> Vec<Rgb> {
    let wavelength = led_count as f64 / 4.0;
    let amplitude = input.features.energy.max(0.0).sqrt() as f64;
    (0..led_count)
        .map(|i| {
            let phase = (i as f64 / wavelength + input.timestamp * WAVE_SPEED) * TAU;
            let intensity = (phase.sin() + 1.0) / 2.0 * amplitude;
            color::to_pixel(color::scale(input.color, intensity as f32))
        })
        .collect()
}

fn pulse(input: &PatternInput, led_count: usize) -> Vec<Rgb> {
    let mut intensity = input.features.energy.max(0.0).sqrt();
    if input.is_beat {
        intensity = (intensity * PULSE_BEAT_BOOST).min(1.0);
    }
    vec![color::to_pixel(color::scale(input.color, intensity)); led_count]
}

fn chase(input: &PatternInput, led_count: usize) -> Vec<Rgb> {
    let head = ((input.timestamp * CHASE_SPEED * led_count as f64).max(0.0) as usize) % led_count;
    let energy = input.features.energy.max(0.0).sqrt();
    (0..led_count)
        .map(|i| {
            let direct = i.abs_diff(head);
            let distance = direct.min(led_count - direct);
            let intensity = if distance < CHASE_LENGTH {
                (1.0 - distance as f32 / CHASE_LENGTH as f32) * energy
            } else {
                CHASE_FLOOR * energy
            };
            color::to_pixel(color::scale(input.color, intensity))
        })
        .collect()
}
