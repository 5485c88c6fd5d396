use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One LED color, components already clamped to 0-255.
pub type Rgb = [u8; 3];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Spectrum,
    Wave,
    Pulse,
    Chase,
}

impl PatternKind {
    /// Fallback assignment by strip position.
    pub fn for_position(idx: usize) -> Self {
        match idx {
            0 => PatternKind::Spectrum,
            1 => PatternKind::Wave,
            2 => PatternKind::Pulse,
            _ => PatternKind::Chase,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StripConfig {
    pub id: u32,
    pub led_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<PatternKind>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StripFrame {
    pub strip_id: u32,
    pub leds: Vec<Rgb>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Seconds from the start of the song
    pub timestamp: f64,
    pub strips: Vec<StripFrame>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LightShow {
    pub duration: f64,
    pub fps: f64,
    pub strip_configs: Vec<StripConfig>,
    pub frames: Vec<Frame>,
}

impl LightShow {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string(self).context("Failed to serialize light show")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write light show: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read light show: {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse light show: {}", path.display()))
    }

    pub fn total_leds(&self) -> usize {
        self.strip_configs.iter().map(|s| s.led_count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_frame_wire_shape() {
        let frame = StripFrame {
            strip_id: 2,
            leds: vec![[255, 0, 10]],
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"strip_id":2,"leds":[[255,0,10]]}"#);
    }

    #[test]
    fn save_and_load() {
        let show = LightShow {
            duration: 1.0,
            fps: 43.0,
            strip_configs: vec![StripConfig {
                id: 0,
                led_count: 2,
                name: None,
                pattern: Some(PatternKind::Wave),
            }],
            frames: vec![Frame {
                timestamp: 0.0,
                strips: vec![StripFrame {
                    strip_id: 0,
                    leds: vec![[1, 2, 3], [4, 5, 6]],
                }],
            }],
        };
        let path = std::env::temp_dir()
            .join(format!("jukeled-show-{}", std::process::id()))
            .join("show.json");
        show.save(&path).unwrap();
        let loaded = LightShow::load(&path).unwrap();
        assert_eq!(loaded.frames, show.frames);
        assert_eq!(loaded.strip_configs, show.strip_configs);
        assert_eq!(loaded.total_leds(), 2);
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
