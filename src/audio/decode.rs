use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::AnalysisError;

pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioData {
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decode to mono f32 and resample to `target_rate`.
pub fn load(path: &Path, target_rate: u32) -> Result<AudioData, AnalysisError> {
    let audio = decode_audio(path)?;
    if audio.samples.is_empty() {
        return Err(AnalysisError::Empty);
    }
    if audio.sample_rate == target_rate {
        return Ok(audio);
    }
    let samples = resample(&audio.samples, audio.sample_rate, target_rate)?;
    log::debug!(
        "Resampled {}Hz -> {}Hz ({} -> {} samples)",
        audio.sample_rate,
        target_rate,
        audio.samples.len(),
        samples.len()
    );
    Ok(AudioData {
        samples,
        sample_rate: target_rate,
    })
}

pub fn decode_audio(path: &Path) -> Result<AudioData, AnalysisError> {
    let file = std::fs::File::open(path).map_err(|source| AnalysisError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != symphonia::core::codecs::CODEC_TYPE_NULL)
        .ok_or(AnalysisError::NoTrack)?;

    let track_id = track.id;
    let channels = track.codec_params.channels.map_or(1, |c| c.count());
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or(AnalysisError::UnknownSampleRate)?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())?;

    let mut all_samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(symphonia::core::errors::Error::DecodeError(_)) => continue,
            Err(e) => return Err(e.into()),
        };

        let spec = *decoded.spec();
        let num_frames = decoded.frames();

        let mut sample_buf = SampleBuffer::<f32>::new(num_frames as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        let samples = sample_buf.samples();

        // Downmix to mono
        if channels == 1 {
            all_samples.extend_from_slice(samples);
        } else {
            for frame_samples in samples.chunks(channels) {
                let mono: f32 = frame_samples.iter().sum::<f32>() / channels as f32;
                all_samples.push(mono);
            }
        }
    }

    log::info!(
        "Decoded audio: {} samples, {}Hz, {:.1}s",
        all_samples.len(),
        sample_rate,
        all_samples.len() as f32 / sample_rate as f32
    );

    Ok(AudioData {
        samples: all_samples,
        sample_rate,
    })
}

/// Resample mono f32 audio with a sinc interpolator in one pass.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AnalysisError> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, samples.len(), 1)
        .map_err(|e| AnalysisError::Resample(e.to_string()))?;

    let input = vec![samples.to_vec()];
    let output = resampler
        .process(&input, None)
        .map_err(|e| AnalysisError::Resample(e.to_string()))?;

    Ok(output.into_iter().next().unwrap_or_default())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Writes a 16-bit WAV into the temp dir and returns its path.
    pub(crate) fn write_wav(name: &str, sample_rate: u32, channels: u16, samples: &[f32]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "jukeled-{}-{}.wav",
            name,
            std::process::id()
        ));
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for &s in samples {
            writer
                .write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                .unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    pub(crate) fn sine(freq: f32, sample_rate: u32, seconds: f32) -> Vec<f32> {
        let n = (sample_rate as f32 * seconds) as usize;
        (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin())
            .collect()
    }

    #[test]
    fn decodes_and_downmixes_stereo() {
        let mono = sine(440.0, 8000, 0.5);
        let stereo: Vec<f32> = mono.iter().flat_map(|&s| [s, s]).collect();
        let path = write_wav("stereo", 8000, 2, &stereo);
        let audio = decode_audio(&path).unwrap();
        assert_eq!(audio.sample_rate, 8000);
        assert_eq!(audio.samples.len(), mono.len());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn load_resamples_to_target_rate() {
        let path = write_wav("resample", 44100, 1, &sine(220.0, 44100, 1.0));
        let audio = load(&path, 22050).unwrap();
        assert_eq!(audio.sample_rate, 22050);
        let expected = 22050.0;
        let got = audio.samples.len() as f32;
        assert!((got - expected).abs() / expected < 0.05, "got {} samples", got);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let err = decode_audio(Path::new("/nonexistent/song.mp3")).err().unwrap();
        assert!(matches!(err, AnalysisError::Open { .. }));
    }

    #[test]
    fn garbage_file_is_a_format_error() {
        let path = std::env::temp_dir().join(format!("jukeled-garbage-{}.wav", std::process::id()));
        std::fs::write(&path, b"definitely not audio data at all").unwrap();
        let err = decode_audio(&path).err().unwrap();
        assert!(matches!(err, AnalysisError::Format(_)));
        std::fs::remove_file(path).ok();
    }
}
