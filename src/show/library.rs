use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::composer::LightShowComposer;
use super::model::LightShow;
use crate::audio::analysis::{self, AnalysisParams};
use crate::audio::features::AudioAnalysis;
use crate::events::Stage;

/// Builds light shows from audio files and keeps them as JSON next to each other.
pub struct ShowLibrary {
    params: AnalysisParams,
    composer: LightShowComposer,
    dir: PathBuf,
}

impl ShowLibrary {
    pub fn new(params: AnalysisParams, composer: LightShowComposer, dir: &Path) -> Self {
        Self {
            params,
            composer,
            dir: dir.to_path_buf(),
        }
    }

    /// Where the show for `audio` is stored.
    pub fn path_for(&self, audio: &Path) -> PathBuf {
        let stem = audio
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "show".to_string());
        self.dir.join(format!("{}.json", stem))
    }

    pub fn analyze(&self, audio: &Path) -> Result<AudioAnalysis> {
        analysis::analyze_file(audio, &self.params)
            .with_context(|| format!("Failed to analyze {}", audio.display()))
    }

    pub fn compose(&self, analysis: &AudioAnalysis, on_frame: &(dyn Fn() + Sync)) -> LightShow {
        self.composer
            .generate_with_progress(analysis, analysis.duration, on_frame)
    }

    /// Frames the composer will produce for `analysis`.
    pub fn frame_count(&self, analysis: &AudioAnalysis) -> usize {
        self.composer.frame_count(analysis)
    }

    /// Load the stored show for `audio`, or analyze, compose and store one.
    pub fn load_or_build(&self, audio: &Path) -> Result<LightShow> {
        self.load_or_build_with(audio, &|_, _| {})
    }

    /// As [`load_or_build`](Self::load_or_build), reporting `Analyzing` and
    /// `Generating` progress in steps of ten percent.
    pub fn load_or_build_with(
        &self,
        audio: &Path,
        on_stage: &(dyn Fn(Stage, u8) + Sync),
    ) -> Result<LightShow> {
        let path = self.path_for(audio);
        if path.exists() {
            match LightShow::load(&path) {
                Ok(show) => {
                    log::info!("Using stored light show {}", path.display());
                    return Ok(show);
                }
                Err(e) => log::warn!("Rebuilding light show: {:#}", e),
            }
        }

        on_stage(Stage::Analyzing, 0);
        let analysis = self.analyze(audio)?;
        on_stage(Stage::Analyzing, 100);

        let total = self.frame_count(&analysis).max(1);
        let done = AtomicUsize::new(0);
        on_stage(Stage::Generating, 0);
        let show = self.compose(&analysis, &|| {
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            let (pct, prev) = (n * 100 / total, (n - 1) * 100 / total);
            if pct / 10 != prev / 10 {
                on_stage(Stage::Generating, pct.min(100) as u8);
            }
        });

        if let Err(e) = show.save(&path) {
            log::warn!("Could not store light show: {:#}", e);
        }
        Ok(show)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decode::tests::{sine, write_wav};
    use crate::config::default_strips;
    use crate::show::composer::ComposerSettings;

    #[test]
    fn builds_then_reuses_stored_show() {
        let wav = write_wav("library", 22050, 1, &sine(440.0, 22050, 1.0));
        let dir = std::env::temp_dir().join(format!("jukeled-library-{}", std::process::id()));
        let library = ShowLibrary::new(
            AnalysisParams::default(),
            LightShowComposer::new(default_strips(), ComposerSettings::default()),
            &dir,
        );
        let built = library.load_or_build(&wav).unwrap();
        assert!(library.path_for(&wav).exists());
        let reused = library.load_or_build(&wav).unwrap();
        assert_eq!(built.frames.len(), reused.frames.len());
        let (a, b) = (&built.frames[3], &reused.frames[3]);
        assert_eq!(a.strips, b.strips);
        assert!((a.timestamp - b.timestamp).abs() < 1e-9);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn reports_analysis_and_generation_progress() {
        let wav = write_wav("library-progress", 22050, 1, &sine(330.0, 22050, 2.0));
        let dir = std::env::temp_dir().join(format!("jukeled-library-progress-{}", std::process::id()));
        let library = ShowLibrary::new(
            AnalysisParams::default(),
            LightShowComposer::new(default_strips(), ComposerSettings::default()),
            &dir,
        );
        let seen = std::sync::Mutex::new(Vec::new());
        library
            .load_or_build_with(&wav, &|stage, pct| seen.lock().unwrap().push((stage, pct)))
            .unwrap();
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.first(), Some(&(Stage::Analyzing, 0)));
        assert!(seen.contains(&(Stage::Generating, 100)));
        let generating: Vec<u8> = seen
            .iter()
            .filter(|(s, _)| *s == Stage::Generating)
            .map(|(_, p)| *p)
            .collect();
        assert!(generating.len() <= 11);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn undecodable_audio_is_an_error() {
        let dir = std::env::temp_dir().join(format!("jukeled-library-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let bogus = dir.join("bogus.mp3");
        std::fs::write(&bogus, b"not audio at all").unwrap();
        let library = ShowLibrary::new(
            AnalysisParams::default(),
            LightShowComposer::new(default_strips(), ComposerSettings::default()),
            &dir,
        );
        assert!(library.load_or_build(&bogus).is_err());
        assert!(!library.path_for(&bogus).exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
