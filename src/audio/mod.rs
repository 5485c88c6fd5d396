pub mod analysis;
pub mod decode;
pub mod features;

use thiserror::Error;

/// Input faults: fatal to one song's analysis, never to the process.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("failed to open audio file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported or corrupt audio: {0}")]
    Format(#[from] symphonia::core::errors::Error),

    #[error("no decodable audio track")]
    NoTrack,

    #[error("unknown sample rate")]
    UnknownSampleRate,

    #[error("audio contains no samples")]
    Empty,

    #[error("resampling failed: {0}")]
    Resample(String),
}
