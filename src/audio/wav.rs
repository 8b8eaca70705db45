//! WAV file input and output for offline sessions.

use crate::defaults::{CHUNK_MS, SAMPLE_RATE};
use crate::error::{Result, VocalinkError};
use crate::frames::AudioChunk;
use std::fs::File;
use std::io::{BufWriter, Read};
use std::path::Path;

/// Audio source that reads from WAV file data.
/// Supports arbitrary sample rates and channels, resampling to 16kHz mono.
pub struct WavAudioSource {
    samples: Vec<i16>,
    position: usize,
    chunk_size: usize,
}

impl WavAudioSource {
    /// Create from any reader (for testing/flexibility).
    pub fn from_reader(reader: Box<dyn Read + Send>) -> Result<Self> {
        let mut wav_reader =
            hound::WavReader::new(reader).map_err(|e| VocalinkError::AudioFormat {
                message: format!("Failed to parse WAV file: {}", e),
            })?;

        let spec = wav_reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(VocalinkError::AudioFormat {
                message: format!(
                    "Unsupported WAV format: {} bit {:?}, expected 16 bit PCM",
                    spec.bits_per_sample, spec.sample_format
                ),
            });
        }
        if spec.channels == 0 {
            return Err(VocalinkError::AudioFormat {
                message: "WAV file declares zero channels".to_string(),
            });
        }

        let raw_samples: Vec<i16> = wav_reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| VocalinkError::AudioFormat {
                message: format!("Failed to read WAV samples: {}", e),
            })?;

        let mono_samples = downmix(raw_samples, spec.channels);
        let samples = resample(&mono_samples, spec.sample_rate, SAMPLE_RATE);

        Ok(Self {
            samples,
            position: 0,
            chunk_size: (SAMPLE_RATE * CHUNK_MS / 1000) as usize,
        })
    }

    /// Open a WAV file from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| VocalinkError::AudioFormat {
            message: format!("Failed to open {}: {}", path.display(), e),
        })?;
        Self::from_reader(Box::new(std::io::BufReader::new(file)))
    }

    /// Total playback length in samples at 16kHz.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Consume the source and return all samples as a single buffer.
    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    /// Next 20ms chunk, or `None` once the file is exhausted.
    pub fn next_chunk(&mut self) -> Option<AudioChunk> {
        if self.position >= self.samples.len() {
            return None;
        }

        let end = std::cmp::min(self.position + self.chunk_size, self.samples.len());
        let chunk = self.samples[self.position..end].to_vec();
        self.position = end;

        Some(AudioChunk::new(chunk, SAMPLE_RATE))
    }
}

impl Iterator for WavAudioSource {
    type Item = AudioChunk;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

/// Writes model output audio to a 16-bit PCM WAV file.
///
/// The format is fixed by the first chunk; later chunks at a different rate
/// are resampled to match.
pub struct WavAudioWriter {
    writer: hound::WavWriter<BufWriter<File>>,
    sample_rate: u32,
    samples_written: usize,
}

impl WavAudioWriter {
    pub fn create(path: &Path, sample_rate: u32) -> Result<Self> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec).map_err(|e| VocalinkError::AudioFormat {
            message: format!("Failed to create {}: {}", path.display(), e),
        })?;
        Ok(Self {
            writer,
            sample_rate,
            samples_written: 0,
        })
    }

    pub fn write_chunk(&mut self, chunk: &AudioChunk) -> Result<()> {
        let mono = downmix(chunk.samples.clone(), chunk.channels);
        let samples = resample(&mono, chunk.sample_rate, self.sample_rate);
        for sample in samples {
            self.writer
                .write_sample(sample)
                .map_err(|e| VocalinkError::AudioFormat {
                    message: format!("Failed to write WAV sample: {}", e),
                })?;
            self.samples_written += 1;
        }
        Ok(())
    }

    pub fn samples_written(&self) -> usize {
        self.samples_written
    }

    /// Flush the header and close the file.
    pub fn finalize(self) -> Result<()> {
        self.writer
            .finalize()
            .map_err(|e| VocalinkError::AudioFormat {
                message: format!("Failed to finalize WAV file: {}", e),
            })
    }
}

/// Average interleaved channels down to mono.
fn downmix(samples: Vec<i16>, channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples;
    }
    samples
        .chunks_exact(usize::from(channels))
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / i32::from(channels)) as i16
        })
        .collect()
}

/// Simple linear interpolation resampling.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = source_pos.floor() as usize;
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx.min(samples.len() - 1)]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction) as i16
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn make_wav_data(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    fn source(sample_rate: u32, channels: u16, samples: &[i16]) -> WavAudioSource {
        let data = make_wav_data(sample_rate, channels, samples);
        WavAudioSource::from_reader(Box::new(Cursor::new(data))).unwrap()
    }

    #[test]
    fn from_reader_16khz_mono_matches_exactly() {
        let input_samples = vec![100i16, 200, 300, 400, 500];
        let source = source(16000, 1, &input_samples);
        assert_eq!(source.samples, input_samples);
        assert_eq!(source.chunk_size, 320);
    }

    #[test]
    fn from_reader_stereo_downmixes_to_mono() {
        let source = source(16000, 2, &[100i16, 200, 300, 400, -500, 500]);
        assert_eq!(source.samples, vec![150i16, 350, 0]);
    }

    #[test]
    fn from_reader_48khz_resamples_to_16khz() {
        let source = source(48000, 1, &vec![0i16; 48000]);
        assert!((15900..=16100).contains(&source.len()));
    }

    #[test]
    fn chunks_are_20ms_with_short_tail() {
        let mut source = source(16000, 1, &vec![1i16; 1000]);
        let sizes: Vec<usize> = source.by_ref().map(|c| c.samples.len()).collect();
        assert_eq!(sizes, vec![320, 320, 320, 40]);
        assert!(source.next_chunk().is_none());
    }

    #[test]
    fn chunks_carry_sample_rate() {
        let mut source = source(8000, 1, &vec![0i16; 800]);
        let chunk = source.next_chunk().unwrap();
        assert_eq!(chunk.sample_rate, SAMPLE_RATE);
        assert_eq!(chunk.channels, 1);
    }

    #[test]
    fn invalid_wav_data_returns_error() {
        let result = WavAudioSource::from_reader(Box::new(Cursor::new(vec![0u8, 1, 2, 3])));
        match result {
            Err(VocalinkError::AudioFormat { message }) => {
                assert!(message.contains("Failed to parse WAV file"));
            }
            _ => panic!("Expected AudioFormat error"),
        }
    }

    #[test]
    fn float_wav_is_rejected() {
        let mut cursor = Cursor::new(Vec::new());
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        writer.write_sample(0.5f32).unwrap();
        writer.finalize().unwrap();

        let result = WavAudioSource::from_reader(Box::new(Cursor::new(cursor.into_inner())));
        assert!(matches!(result, Err(VocalinkError::AudioFormat { .. })));
    }

    #[test]
    fn missing_file_returns_error() {
        let result = WavAudioSource::from_path(Path::new("/nonexistent/input.wav"));
        assert!(matches!(result, Err(VocalinkError::AudioFormat { .. })));
    }

    #[test]
    fn resample_identity_and_edges() {
        assert_eq!(resample(&[1, 2, 3], 16000, 16000), vec![1, 2, 3]);
        assert!(resample(&[], 16000, 8000).is_empty());
        assert_eq!(resample(&[100], 16000, 8000), vec![100]);
    }

    #[test]
    fn resample_upsample_interpolates() {
        let resampled = resample(&[0i16, 1000, 2000], 8000, 16000);
        assert_eq!(resampled.len(), 6);
        assert_eq!(resampled[0], 0);
        assert!(resampled[1] > 0 && resampled[1] < 1000);
        assert_eq!(resampled[2], 1000);
    }

    #[test]
    fn writer_round_trips_through_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut writer = WavAudioWriter::create(&path, 16000).unwrap();
        writer
            .write_chunk(&AudioChunk::new(vec![7i16; 320], 16000))
            .unwrap();
        writer
            .write_chunk(&AudioChunk::new(vec![7i16; 160], 8000))
            .unwrap();
        assert_eq!(writer.samples_written(), 640);
        writer.finalize().unwrap();

        let source = WavAudioSource::from_path(&path).unwrap();
        assert_eq!(source.len(), 640);
        assert!(source.into_samples().iter().all(|&s| s == 7));
    }
}
