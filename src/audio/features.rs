use serde::{Deserialize, Serialize};

/// Per-frame scalar features, each normalized to 0.0-1.0.
/// All arrays share the analysis frame count.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FeatureSet {
    /// RMS energy
    pub energy: Vec<f32>,
    pub spectral_centroid: Vec<f32>,
    /// Frequency below which 85% of the spectral energy sits
    pub spectral_rolloff: Vec<f32>,
    pub bass: Vec<f32>,
    pub mid: Vec<f32>,
    pub treble: Vec<f32>,
}

impl FeatureSet {
    pub fn frame_count(&self) -> usize {
        self.energy.len()
    }

    /// True when every per-frame array has the same length.
    pub fn is_consistent(&self) -> bool {
        let n = self.energy.len();
        [
            &self.spectral_centroid,
            &self.spectral_rolloff,
            &self.bass,
            &self.mid,
            &self.treble,
        ]
        .iter()
        .all(|a| a.len() == n)
    }

    pub fn frame(&self, idx: usize) -> FrameFeatures {
        let at = |a: &Vec<f32>| a.get(idx).copied().unwrap_or(0.0);
        FrameFeatures {
            energy: at(&self.energy),
            bass: at(&self.bass),
            mid: at(&self.mid),
            treble: at(&self.treble),
        }
    }
}

/// The slice of one frame's features the light show consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameFeatures {
    pub energy: f32,
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioAnalysis {
    pub sample_rate: u32,
    pub duration: f64,
    pub tempo: f32,
    pub beat_times: Vec<f64>,
    pub onset_times: Vec<f64>,
    /// hop / sample_rate
    pub frame_duration: f64,
    pub frame_times: Vec<f64>,
    pub features: FeatureSet,
}

impl AudioAnalysis {
    pub fn frame_count(&self) -> usize {
        self.frame_times.len()
    }
}
