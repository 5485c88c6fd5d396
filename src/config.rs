use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::show::model::{PatternKind, StripConfig};
use crate::transport::packet::ColorOrder;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub bands: BandConfig,
    #[serde(default = "default_strips")]
    pub strips: Vec<StripConfig>,
    #[serde(default)]
    pub show: ShowConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub downloads: DownloadConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_hop_length")]
    pub hop_length: usize,
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    /// Analysis frames per emitted light frame
    #[serde(default = "default_decimation")]
    pub frame_decimation: usize,
    /// Seconds either side of a frame that still count as "on" a beat/onset
    #[serde(default = "default_beat_window")]
    pub beat_window: f64,
    #[serde(default = "default_beat_sensitivity")]
    pub beat_sensitivity: f32,
    #[serde(default = "default_onset_sensitivity")]
    pub onset_sensitivity: f32,
}

/// Frequency ranges in Hz, inclusive on both ends
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BandConfig {
    #[serde(default = "default_bass")]
    pub bass: (f32, f32),
    #[serde(default = "default_mid")]
    pub mid: (f32, f32),
    #[serde(default = "default_treble")]
    pub treble: (f32, f32),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShowConfig {
    #[serde(default = "default_beat_brightness")]
    pub beat_brightness: f32,
    #[serde(default = "default_onset_hue_shift")]
    pub onset_hue_shift: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default)]
    pub color_order: ColorOrder,
    #[serde(default = "default_min_frame_interval_ms")]
    pub min_frame_interval_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_warn_interval_ms")]
    pub warn_interval_ms: u64,
    #[serde(default = "default_server_url")]
    pub server: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_lightshow_dir")]
    pub lightshow_dir: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            hop_length: default_hop_length(),
            fft_size: default_fft_size(),
            frame_decimation: default_decimation(),
            beat_window: default_beat_window(),
            beat_sensitivity: default_beat_sensitivity(),
            onset_sensitivity: default_onset_sensitivity(),
        }
    }
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            bass: default_bass(),
            mid: default_mid(),
            treble: default_treble(),
        }
    }
}

impl Default for ShowConfig {
    fn default() -> Self {
        Self {
            beat_brightness: default_beat_brightness(),
            onset_hue_shift: default_onset_hue_shift(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: default_baud(),
            color_order: ColorOrder::default(),
            min_frame_interval_ms: default_min_frame_interval_ms(),
            chunk_size: default_chunk_size(),
            chunk_delay_ms: default_chunk_delay_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            settle_ms: default_settle_ms(),
            warn_interval_ms: default_warn_interval_ms(),
            server: default_server_url(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: default_download_dir(),
            lightshow_dir: default_lightshow_dir(),
        }
    }
}

fn default_sample_rate() -> u32 { 22050 }
fn default_hop_length() -> usize { 512 }
fn default_fft_size() -> usize { 2048 }
fn default_decimation() -> usize { 4 }
fn default_beat_window() -> f64 { 0.05 }
fn default_beat_sensitivity() -> f32 { 0.3 }
fn default_onset_sensitivity() -> f32 { 0.5 }
fn default_bass() -> (f32, f32) { (20.0, 250.0) }
fn default_mid() -> (f32, f32) { (250.0, 2000.0) }
fn default_treble() -> (f32, f32) { (2000.0, 8000.0) }
fn default_beat_brightness() -> f32 { 1.5 }
fn default_onset_hue_shift() -> f32 { 30.0 }
fn default_baud() -> u32 { 115_200 }
fn default_min_frame_interval_ms() -> u64 { 50 }
fn default_chunk_size() -> usize { 512 }
fn default_chunk_delay_ms() -> u64 { 20 }
fn default_ack_timeout_ms() -> u64 { 2000 }
fn default_reconnect_backoff_ms() -> u64 { 3000 }
fn default_settle_ms() -> u64 { 2500 }
fn default_warn_interval_ms() -> u64 { 5000 }
fn default_server_url() -> String { "127.0.0.1:5000".into() }
fn default_listen() -> String { "0.0.0.0:5000".into() }
fn default_tick_ms() -> u64 { 10 }
fn default_download_dir() -> PathBuf { PathBuf::from("downloads") }
fn default_lightshow_dir() -> PathBuf { PathBuf::from("lightshows") }

pub fn default_strips() -> Vec<StripConfig> {
    [
        (150, "Main Strip", PatternKind::Spectrum),
        (300, "Left Strip", PatternKind::Wave),
        (300, "Right Strip", PatternKind::Pulse),
        (300, "Back Strip", PatternKind::Chase),
    ]
    .into_iter()
    .enumerate()
    .map(|(id, (led_count, name, pattern))| StripConfig {
        id: id as u32,
        led_count,
        name: Some(name.to_string()),
        pattern: Some(pattern),
    })
    .collect()
}

impl Config {
    /// Defaults with the stock four-strip layout.
    pub fn with_defaults() -> Self {
        Self {
            strips: default_strips(),
            ..Self::default()
        }
    }
}

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(cfg) => Some(cfg),
        Err(err) => {
            log::warn!("Invalid config {}: {}", path.display(), err);
            None
        }
    }
}

/// Explicit path first, then ./jukeled.toml, then the per-user config locations.
pub fn discover(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from("jukeled.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = dirs::home_dir() {
        let xdg = home.join(".config").join("jukeled").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        let platform = config_dir.join("jukeled").join("config.toml");
        if platform.exists() {
            return Some(platform);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.audio.sample_rate, 22050);
        assert_eq!(cfg.audio.hop_length, 512);
        assert_eq!(cfg.audio.frame_decimation, 4);
        assert_eq!(cfg.bridge.min_frame_interval_ms, 50);
        assert_eq!(cfg.bridge.color_order, ColorOrder::Grb);
        let sizes: Vec<usize> = cfg.strips.iter().map(|s| s.led_count).collect();
        assert_eq!(sizes, vec![150, 300, 300, 300]);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [bridge]
            color_order = "rgb"
            chunk_size = 64

            [[strips]]
            id = 0
            led_count = 60
            pattern = "pulse"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bridge.color_order, ColorOrder::Rgb);
        assert_eq!(cfg.bridge.chunk_size, 64);
        assert_eq!(cfg.bridge.ack_timeout_ms, 2000);
        assert_eq!(cfg.strips.len(), 1);
        assert_eq!(cfg.strips[0].pattern, Some(PatternKind::Pulse));
        assert_eq!(cfg.bands.mid, (250.0, 2000.0));
    }
}
