use rayon::prelude::*;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::path::Path;
use std::sync::Arc;

use super::decode::{self, AudioData};
use super::features::{AudioAnalysis, FeatureSet};
use super::AnalysisError;
use crate::config::{AudioConfig, BandConfig};

const ROLLOFF_PERCENT: f32 = 0.85;
const FRAMES_PER_CHUNK: usize = 256;
const DEFAULT_TEMPO: f32 = 120.0;
const MIN_TEMPO: f32 = 60.0;
const MAX_TEMPO: f32 = 200.0;
const BEAT_TIGHTNESS: f32 = 100.0;

#[derive(Clone, Debug)]
pub struct AnalysisParams {
    pub sample_rate: u32,
    pub hop_length: usize,
    pub fft_size: usize,
    pub bands: BandConfig,
    pub beat_sensitivity: f32,
    pub onset_sensitivity: f32,
}

impl AnalysisParams {
    pub fn new(audio: &AudioConfig, bands: BandConfig) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            hop_length: audio.hop_length.max(1),
            fft_size: audio.fft_size.max(2),
            bands,
            beat_sensitivity: audio.beat_sensitivity,
            onset_sensitivity: audio.onset_sensitivity,
        }
    }
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self::new(&AudioConfig::default(), BandConfig::default())
    }
}

/// Un-normalized per-frame measurements.
#[derive(Clone, Copy, Debug, Default)]
struct RawFrame {
    rms: f32,
    centroid: f32,
    rolloff: f32,
    bass: f32,
    mid: f32,
    treble: f32,
    /// Positive log-spectral flux against the previous frame
    flux: f32,
}

pub fn analyze_file(path: &Path, params: &AnalysisParams) -> Result<AudioAnalysis, AnalysisError> {
    log::info!("Loading audio file: {}", path.display());
    let audio = decode::load(path, params.sample_rate)?;
    Ok(analyze(&audio, params))
}

pub fn analyze(audio: &AudioData, params: &AnalysisParams) -> AudioAnalysis {
    let samples = &audio.samples;
    let sr = audio.sample_rate;
    let hop = params.hop_length;
    let duration = audio.duration();
    let n_frames = 1 + samples.len() / hop;
    let frame_duration = hop as f64 / sr as f64;

    log::info!("Per-frame STFT ({} frames, hop={})...", n_frames, hop);
    let raw = per_frame_features(samples, sr, n_frames, params);

    let onset_env = normalize_peak(&raw.iter().map(|f| f.flux).collect::<Vec<_>>());

    let onset_frames = detect_onsets(&onset_env, frame_duration, params.onset_sensitivity);
    let tempo = estimate_tempo(&onset_env, frame_duration);
    let beat_frames = track_beats(&onset_env, frame_duration, tempo, params.beat_sensitivity);

    let to_time = |frames: &[usize]| -> Vec<f64> {
        frames.iter().map(|&i| i as f64 * frame_duration).collect()
    };
    let beat_times = to_time(&beat_frames);
    let onset_times = to_time(&onset_frames);
    let frame_times: Vec<f64> = (0..n_frames).map(|i| i as f64 * frame_duration).collect();

    let column = |f: fn(&RawFrame) -> f32| -> Vec<f32> {
        normalize(&raw.iter().map(f).collect::<Vec<_>>())
    };
    let features = FeatureSet {
        energy: column(|f| f.rms),
        spectral_centroid: column(|f| f.centroid),
        spectral_rolloff: column(|f| f.rolloff),
        bass: column(|f| f.bass),
        mid: column(|f| f.mid),
        treble: column(|f| f.treble),
    };

    log::info!(
        "Analysis: {:.1}s, tempo={:.1} BPM, beats={}, onsets={}, frames={}",
        duration,
        tempo,
        beat_times.len(),
        onset_times.len(),
        n_frames
    );

    AudioAnalysis {
        sample_rate: sr,
        duration,
        tempo,
        beat_times,
        onset_times,
        frame_duration,
        frame_times,
        features,
    }
}

/// Min-max normalize to 0.0-1.0. A constant array maps to all zeros.
pub fn normalize(values: &[f32]) -> Vec<f32> {
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = max - min;
    if !range.is_finite() || range <= 0.0 {
        return vec![0.0; values.len()];
    }
    values
        .iter()
        .map(|&v| {
            if v.is_finite() {
                ((v - min) / range).clamp(0.0, 1.0)
            } else {
                0.0
            }
        })
        .collect()
}

fn normalize_peak(values: &[f32]) -> Vec<f32> {
    let peak = values.iter().copied().fold(0.0f32, f32::max);
    if peak <= 0.0 {
        return vec![0.0; values.len()];
    }
    values.iter().map(|&v| v / peak).collect()
}

fn per_frame_features(
    samples: &[f32],
    sample_rate: u32,
    n_frames: usize,
    params: &AnalysisParams,
) -> Vec<RawFrame> {
    let fft_size = params.fft_size;
    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(fft_size);
    let hann = hann_window(fft_size);
    let freq_resolution = sample_rate as f32 / fft_size as f32;
    let n_bins = fft_size / 2 + 1;
    let freqs: Vec<f32> = (0..n_bins).map(|k| k as f32 * freq_resolution).collect();

    let indices: Vec<usize> = (0..n_frames).collect();
    let chunks: Vec<Vec<RawFrame>> = indices
        .par_chunks(FRAMES_PER_CHUNK)
        .map(|chunk| {
            // Flux needs the spectrum of the frame preceding the chunk.
            let mut prev = match chunk.first() {
                Some(&first) if first > 0 => Some(log_magnitudes(&magnitudes(
                    samples,
                    first - 1,
                    params.hop_length,
                    &fft,
                    &hann,
                ))),
                _ => None,
            };
            chunk
                .iter()
                .map(|&idx| {
                    let mags = magnitudes(samples, idx, params.hop_length, &fft, &hann);
                    let log_mags = log_magnitudes(&mags);
                    let flux = match prev {
                        Some(ref p) => log_mags
                            .iter()
                            .zip(p.iter())
                            .map(|(cur, prev)| (cur - prev).max(0.0))
                            .sum::<f32>(),
                        None => 0.0,
                    };
                    prev = Some(log_mags);

                    let frame = frame_samples(samples, idx, params.hop_length, fft_size);
                    RawFrame {
                        rms: rms(&frame),
                        centroid: spectral_centroid(&mags, &freqs),
                        rolloff: spectral_rolloff(&mags, &freqs),
                        bass: band_energy(&mags, &freqs, params.bands.bass),
                        mid: band_energy(&mags, &freqs, params.bands.mid),
                        treble: band_energy(&mags, &freqs, params.bands.treble),
                        flux,
                    }
                })
                .collect()
        })
        .collect();

    chunks.into_iter().flatten().collect()
}

/// Samples of a frame centered at `idx * hop`, zero-padded at the edges.
fn frame_samples(samples: &[f32], idx: usize, hop: usize, size: usize) -> Vec<f32> {
    let center = (idx * hop) as isize;
    let start = center - (size / 2) as isize;
    (0..size as isize)
        .map(|i| {
            let pos = start + i;
            if pos < 0 || pos as usize >= samples.len() {
                0.0
            } else {
                samples[pos as usize]
            }
        })
        .collect()
}

fn magnitudes(
    samples: &[f32],
    idx: usize,
    hop: usize,
    fft: &Arc<dyn Fft<f32>>,
    hann: &[f32],
) -> Vec<f32> {
    let size = hann.len();
    let mut buffer: Vec<Complex<f32>> = frame_samples(samples, idx, hop, size)
        .iter()
        .zip(hann.iter())
        .map(|(&s, &w)| Complex::new(s * w, 0.0))
        .collect();
    fft.process(&mut buffer);
    buffer[..size / 2 + 1].iter().map(|c| c.norm()).collect()
}

fn log_magnitudes(mags: &[f32]) -> Vec<f32> {
    mags.iter().map(|&m| (1.0 + 100.0 * m).ln()).collect()
}

fn rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    (frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32).sqrt()
}

fn spectral_centroid(mags: &[f32], freqs: &[f32]) -> f32 {
    let total: f32 = mags.iter().sum();
    if total <= 1e-10 {
        return 0.0;
    }
    mags.iter().zip(freqs).map(|(&m, &f)| m * f).sum::<f32>() / total
}

fn spectral_rolloff(mags: &[f32], freqs: &[f32]) -> f32 {
    let total: f32 = mags.iter().sum();
    if total <= 1e-10 {
        return 0.0;
    }
    let threshold = total * ROLLOFF_PERCENT;
    let mut cumulative = 0.0;
    for (&m, &f) in mags.iter().zip(freqs) {
        cumulative += m;
        if cumulative >= threshold {
            return f;
        }
    }
    freqs.last().copied().unwrap_or(0.0)
}

/// Sum of magnitude bins whose frequency lies within `[low, high]`.
fn band_energy(mags: &[f32], freqs: &[f32], (low, high): (f32, f32)) -> f32 {
    mags.iter()
        .zip(freqs)
        .filter(|&(_, &f)| f >= low && f <= high)
        .map(|(&m, _)| m)
        .sum()
}

/// Peak picking on a peak-normalized onset envelope. Returns frame indices.
fn detect_onsets(env: &[f32], frame_duration: f64, sensitivity: f32) -> Vec<usize> {
    if env.is_empty() {
        return Vec::new();
    }
    let frames = |secs: f64| ((secs / frame_duration).round() as usize).max(1);
    let pre_max = frames(0.03);
    let post_max = 1;
    let pre_avg = frames(0.1);
    let post_avg = frames(0.1) + 1;
    let wait = frames(0.03);
    let delta = (1.0 - sensitivity).clamp(0.0, 1.0) * 0.14;

    let mut onsets: Vec<usize> = Vec::new();
    for i in 0..env.len() {
        let max_lo = i.saturating_sub(pre_max);
        let max_hi = (i + post_max).min(env.len() - 1);
        let local_max = env[max_lo..=max_hi].iter().copied().fold(0.0f32, f32::max);
        if env[i] <= 0.0 || env[i] < local_max {
            continue;
        }
        let avg_lo = i.saturating_sub(pre_avg);
        let avg_hi = (i + post_avg).min(env.len() - 1);
        let window = &env[avg_lo..=avg_hi];
        let local_mean = window.iter().sum::<f32>() / window.len() as f32;
        if env[i] < local_mean + delta {
            continue;
        }
        if onsets.last().map_or(true, |&last| i > last + wait) {
            onsets.push(i);
        }
    }
    onsets
}

/// Tempo from the onset envelope autocorrelation, weighted toward 120 BPM.
fn estimate_tempo(env: &[f32], frame_duration: f64) -> f32 {
    let bpm_to_lag = |bpm: f32| (60.0 / (bpm as f64 * frame_duration)).round() as usize;
    let min_lag = bpm_to_lag(MAX_TEMPO).max(1);
    let max_lag = bpm_to_lag(MIN_TEMPO);
    if env.len() <= max_lag || env.iter().all(|&v| v <= 0.0) {
        return DEFAULT_TEMPO;
    }

    let mean = env.iter().sum::<f32>() / env.len() as f32;
    let centered: Vec<f32> = env.iter().map(|&v| v - mean).collect();

    let mut best_lag = 0;
    let mut best_score = f32::NEG_INFINITY;
    for lag in min_lag..=max_lag {
        let ac: f32 = centered[lag..]
            .iter()
            .zip(centered.iter())
            .map(|(a, b)| a * b)
            .sum::<f32>()
            / (centered.len() - lag) as f32;
        let bpm = 60.0 / (lag as f64 * frame_duration) as f32;
        let prior = (-0.5 * (bpm / DEFAULT_TEMPO).log2().powi(2)).exp();
        let score = ac * prior;
        if score > best_score {
            best_score = score;
            best_lag = lag;
        }
    }

    if best_lag == 0 || best_score <= 0.0 {
        return DEFAULT_TEMPO;
    }
    60.0 / (best_lag as f64 * frame_duration) as f32
}

/// Dynamic-programming beat tracker over the onset envelope.
/// Returns frame indices of beats in ascending order.
fn track_beats(env: &[f32], frame_duration: f64, tempo: f32, sensitivity: f32) -> Vec<usize> {
    if env.is_empty() || env.iter().all(|&v| v <= 0.0) || tempo <= 0.0 {
        return Vec::new();
    }
    let period = (60.0 / (tempo as f64 * frame_duration)) as f32;
    if period < 1.0 {
        return Vec::new();
    }

    // Smooth the envelope with a gaussian a fraction of a beat wide
    let half = (period / 2.0).ceil() as isize;
    let sigma = period / 32.0;
    let kernel: Vec<f32> = (-half..=half)
        .map(|k| (-0.5 * (k as f32 / sigma.max(0.5)).powi(2)).exp())
        .collect();
    let local: Vec<f32> = (0..env.len() as isize)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(j, &w)| {
                    let pos = i + j as isize - half;
                    if pos < 0 || pos as usize >= env.len() {
                        0.0
                    } else {
                        env[pos as usize] * w
                    }
                })
                .sum()
        })
        .collect();

    let n = local.len();
    let mut score = vec![0.0f32; n];
    let mut backlink: Vec<Option<usize>> = vec![None; n];
    let min_step = (period / 2.0).round().max(1.0) as usize;
    let max_step = (period * 2.0).round() as usize;

    for i in 0..n {
        let mut best: Option<(usize, f32)> = None;
        if i >= min_step {
            let lo = i.saturating_sub(max_step);
            for prev in lo..=i - min_step {
                let gap = (i - prev) as f32;
                let penalty = BEAT_TIGHTNESS * (gap / period).ln().powi(2);
                let candidate = score[prev] - penalty;
                if best.map_or(true, |(_, s)| candidate > s) {
                    best = Some((prev, candidate));
                }
            }
        }
        match best {
            Some((prev, s)) if s > 0.0 => {
                score[i] = local[i] + s;
                backlink[i] = Some(prev);
            }
            _ => score[i] = local[i],
        }
    }

    // Pick the last frame whose score is a local maximum above half the median of maxima
    let maxima: Vec<f32> = (1..n.saturating_sub(1))
        .filter(|&i| score[i] > score[i - 1] && score[i] >= score[i + 1])
        .map(|i| score[i])
        .collect();
    let threshold = if maxima.is_empty() {
        0.0
    } else {
        let mut sorted = maxima.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        0.5 * sorted[sorted.len() / 2]
    };
    let mut tail = (0..n)
        .rev()
        .find(|&i| {
            let is_peak = (i == 0 || score[i] > score[i - 1]) && (i + 1 == n || score[i] >= score[i + 1]);
            is_peak && score[i] >= threshold
        })
        .unwrap_or(n - 1);

    let mut beats = vec![tail];
    while let Some(prev) = backlink[tail] {
        beats.push(prev);
        tail = prev;
    }
    beats.reverse();

    trim_weak_beats(beats, &local, sensitivity)
}

/// Drop leading and trailing beats whose strength falls below
/// `sensitivity` times the RMS strength of all beats.
fn trim_weak_beats(beats: Vec<usize>, local: &[f32], sensitivity: f32) -> Vec<usize> {
    if beats.is_empty() {
        return beats;
    }
    let rms = (beats.iter().map(|&b| local[b].powi(2)).sum::<f32>() / beats.len() as f32).sqrt();
    let threshold = rms * sensitivity.clamp(0.0, 1.0);
    let start = beats.iter().position(|&b| local[b] >= threshold);
    let end = beats.iter().rposition(|&b| local[b] >= threshold);
    match (start, end) {
        (Some(s), Some(e)) if s <= e => beats[s..=e].to_vec(),
        _ => Vec::new(),
    }
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}
