//! # Audio Processing and Validation
//!
//! Bridges the capture format to the recognizer format and the synthesis
//! format to the playback format. Also owns the per-chunk validation rules
//! applied before audio is accepted into a session buffer.
//!
//! ## Key Functions:
//! - **Chunk validation**: minimum size, 16-bit alignment, degenerate input
//! - **Recognition staging**: normalize, downmix to mono, resample to 16kHz
//! - **Playback staging**: decode float output, normalize, resample, lead-in silence

use crate::audio::buffer::AudioChunk;
use crate::audio::codec;
use crate::audio::format::{AudioEncoding, AudioError, AudioFormat, RECOGNITION_SAMPLE_RATE};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Tunables for validation and format staging.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Chunks smaller than this are rejected
    pub min_chunk_bytes: usize,

    /// Chunks with fewer distinct byte values are treated as corrupt/silent
    pub min_distinct_byte_values: usize,

    /// Peak level for audio handed to the recognizer (0.0 - 1.0)
    pub recognition_level: f64,

    /// Peak level for audio sent back to the client (0.0 - 1.0)
    pub playback_level: f64,

    /// Sample rate of audio sent back to the client
    pub playback_sample_rate: u32,

    /// Silence prepended to playback audio for a smooth start
    pub playback_lead_in_ms: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            min_chunk_bytes: 320, // 10ms at 16kHz mono
            min_distinct_byte_values: 10,
            recognition_level: 0.8,
            playback_level: 0.9,
            playback_sample_rate: 24000,
            playback_lead_in_ms: 50,
        }
    }
}

/// Audio validation and staging for the voice pipeline.
#[derive(Debug, Clone)]
pub struct AudioProcessor {
    config: ProcessorConfig,
}

impl AudioProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Validate one inbound chunk before it is buffered.
    ///
    /// ## Validation Checks:
    /// 1. **Not empty**
    /// 2. **Minimum size**: at least `min_chunk_bytes`
    /// 3. **Alignment**: even byte length (whole 16-bit samples)
    /// 4. **Not degenerate**: at least `min_distinct_byte_values` distinct bytes
    pub fn validate_chunk(&self, data: &[u8]) -> Result<(), AudioError> {
        if data.is_empty() {
            return Err(AudioError::Empty);
        }

        if data.len() < self.config.min_chunk_bytes {
            return Err(AudioError::TooSmall {
                size: data.len(),
                minimum: self.config.min_chunk_bytes,
            });
        }

        if data.len() % 2 != 0 {
            return Err(AudioError::MisalignedSamples(data.len()));
        }

        let distinct = count_distinct_bytes(data);
        if distinct < self.config.min_distinct_byte_values {
            return Err(AudioError::Degenerate {
                distinct,
                minimum: self.config.min_distinct_byte_values,
            });
        }

        Ok(())
    }

    /// Validate a merged window against its declared format.
    pub fn validate_window(&self, data: &[u8], format: &AudioFormat) -> Result<(), AudioError> {
        format.ensure_supported()?;
        codec::to_pcm16(data)?;

        let frame = format.bytes_per_frame();
        if data.len() % frame != 0 {
            return Err(AudioError::InvalidParameter(format!(
                "{} bytes is not a whole number of {}-channel frames",
                data.len(),
                format.channels
            )));
        }
        Ok(())
    }

    /// Stage captured audio for the recognizer.
    ///
    /// ## Steps:
    /// 1. Normalize amplitude to the recognition level
    /// 2. Downmix to mono if needed
    /// 3. Resample to 16kHz if needed
    ///
    /// Downmixing happens before resampling so interleaved channels are
    /// never interpolated into each other.
    pub fn optimize_for_recognition(&self, data: &[u8], format: &AudioFormat) -> Result<Vec<u8>, AudioError> {
        self.validate_window(data, format)?;

        let normalized = codec::normalize_pcm16(data, self.config.recognition_level);
        let mono = codec::convert_channels(&normalized, format.channels, 1)?;
        let resampled = codec::resample(&mono, format.sample_rate, RECOGNITION_SAMPLE_RATE)?;

        tracing::debug!(
            input_bytes = data.len(),
            output_bytes = resampled.len(),
            from_rate = format.sample_rate,
            from_channels = format.channels,
            "Audio optimized for recognition"
        );

        Ok(resampled.into_owned())
    }

    /// Stage a claimed window for the recognizer.
    ///
    /// Consecutive chunks sharing a declared format are merged and staged
    /// together; a capture-format change mid-window starts a new run, so
    /// every chunk is converted from the format it arrived in.
    pub fn optimize_window(&self, chunks: &[AudioChunk]) -> Result<Vec<u8>, AudioError> {
        if chunks.is_empty() {
            return Err(AudioError::Empty);
        }

        let mut staged = Vec::new();
        for run in chunks.chunk_by(|a, b| a.format == b.format) {
            let data: Vec<&[u8]> = run.iter().map(|chunk| chunk.data.as_slice()).collect();
            staged.extend(self.optimize_for_recognition(&codec::merge_chunks(&data), &run[0].format)?);
        }
        Ok(staged)
    }

    /// Stage synthesized audio for playback on the client.
    ///
    /// ## Steps:
    /// 1. Decode float output to PCM16 if the synthesizer produced floats
    /// 2. Normalize amplitude to the playback level
    /// 3. Downmix to mono and resample to the playback rate
    /// 4. Prepend lead-in silence at the playback rate
    pub fn optimize_for_playback(&self, data: &[u8], format: &AudioFormat) -> Result<Vec<u8>, AudioError> {
        if data.is_empty() {
            return Err(AudioError::Empty);
        }

        let (pcm, format) = match format.encoding {
            AudioEncoding::Float32 => {
                let samples = float_bytes_to_samples(data);
                let pcm = codec::encode_samples(&self.float_to_pcm(&samples));
                (pcm, AudioFormat::pcm16(format.sample_rate, format.channels))
            }
            _ => (data.to_vec(), *format),
        };
        self.validate_window(&pcm, &format)?;

        let target_rate = self.config.playback_sample_rate;
        let normalized = codec::normalize_pcm16(&pcm, self.config.playback_level);
        let mono = codec::convert_channels(&normalized, format.channels, 1)?;
        let resampled = codec::resample(&mono, format.sample_rate, target_rate)?;

        Ok(codec::prepend_silence(
            &resampled,
            self.config.playback_lead_in_ms,
            target_rate,
            1,
        ))
    }

    /// Format of audio produced by `optimize_for_playback`.
    pub fn playback_format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.config.playback_sample_rate, 1)
    }

    /// Convert 32-bit float samples back to 16-bit PCM format.
    pub fn float_to_pcm(&self, samples: &[f32]) -> Vec<i16> {
        samples
            .iter()
            .map(|&sample| {
                let scaled = sample * 32768.0;
                scaled.clamp(-32768.0, 32767.0) as i16
            })
            .collect()
    }
}

/// Count distinct byte values, stopping early once all 256 have been seen.
fn count_distinct_bytes(data: &[u8]) -> usize {
    let mut seen = [false; 256];
    let mut distinct = 0;
    for &byte in data {
        if !seen[byte as usize] {
            seen[byte as usize] = true;
            distinct += 1;
            if distinct == 256 {
                break;
            }
        }
    }
    distinct
}

/// Read little-endian f32 samples; a trailing partial sample is ignored.
fn float_bytes_to_samples(data: &[u8]) -> Vec<f32> {
    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speech_like(sample_count: usize) -> Vec<u8> {
        let samples: Vec<i16> = (0..sample_count)
            .map(|i| ((i as f32 * 0.3).sin() * 8000.0) as i16)
            .collect();
        codec::encode_samples(&samples)
    }

    #[test]
    fn test_chunk_validation() {
        let processor = AudioProcessor::new(ProcessorConfig::default());

        assert!(processor.validate_chunk(&speech_like(400)).is_ok());
        assert_eq!(processor.validate_chunk(&[]).unwrap_err(), AudioError::Empty);
        assert!(matches!(
            processor.validate_chunk(&speech_like(20)),
            Err(AudioError::TooSmall { size: 40, .. })
        ));

        let mut odd = speech_like(400);
        odd.push(1);
        assert_eq!(processor.validate_chunk(&odd).unwrap_err(), AudioError::MisalignedSamples(801));

        // only 9 distinct values
        let degenerate: Vec<u8> = (0..800).map(|i| (i % 9) as u8).collect();
        assert!(matches!(
            processor.validate_chunk(&degenerate),
            Err(AudioError::Degenerate { distinct: 9, minimum: 10 })
        ));
    }

    #[test]
    fn test_optimize_for_recognition_from_stereo_48k() {
        let processor = AudioProcessor::new(ProcessorConfig::default());
        let format = AudioFormat::pcm16(48000, 2);

        // 100ms of stereo 48kHz = 4800 frames
        let stereo = codec::convert_channels(&speech_like(4800), 1, 2).unwrap().into_owned();
        let optimized = processor.optimize_for_recognition(&stereo, &format).unwrap();

        // 100ms of mono 16kHz
        assert_eq!(optimized.len(), 3200);
        let peak = codec::decode_samples(&optimized)
            .iter()
            .map(|s| (*s as i32).abs())
            .max()
            .unwrap();
        assert!(peak <= (0.8 * 32767.0) as i32 + 1);
    }

    #[test]
    fn test_optimize_window_stages_each_chunk_in_its_own_format() {
        let processor = AudioProcessor::new(ProcessorConfig::default());
        let chunks = vec![
            // 200ms mono 16kHz
            AudioChunk::new(speech_like(3200), AudioFormat::recognition()),
            // 200ms stereo 48kHz, declared after a format change
            AudioChunk::new(
                codec::convert_channels(&speech_like(9600), 1, 2).unwrap().into_owned(),
                AudioFormat::pcm16(48000, 2),
            ),
            AudioChunk::new(speech_like(3200), AudioFormat::recognition()),
        ];

        let staged = processor.optimize_window(&chunks).unwrap();
        // 600ms of mono 16kHz
        assert_eq!(staged.len(), 3 * 6400);
        assert_eq!(codec::get_duration(&staged, 16000, 1), 600.0);
    }

    #[test]
    fn test_optimize_window_rejects_partial_frames() {
        let processor = AudioProcessor::new(ProcessorConfig::default());
        let mut data = speech_like(3200);
        data.extend_from_slice(&[1, 2]);
        let chunks = vec![AudioChunk::new(data, AudioFormat::pcm16(16000, 2))];

        assert!(matches!(
            processor.optimize_window(&chunks),
            Err(AudioError::InvalidParameter(_))
        ));
        assert_eq!(processor.optimize_window(&[]).unwrap_err(), AudioError::Empty);
    }

    #[test]
    fn test_optimize_for_recognition_rejects_unsupported_format() {
        let processor = AudioProcessor::new(ProcessorConfig::default());
        let format = AudioFormat::pcm16(16000, 4);
        assert!(processor.optimize_for_recognition(&speech_like(800), &format).is_err());
    }

    #[test]
    fn test_optimize_for_playback_adds_lead_in() {
        let processor = AudioProcessor::new(ProcessorConfig::default());
        let format = AudioFormat::pcm16(24000, 1);
        let audio = speech_like(2400);

        let playback = processor.optimize_for_playback(&audio, &format).unwrap();
        // 50ms of silence at 24kHz mono = 2400 bytes
        assert_eq!(playback.len(), 2400 + audio.len());
        assert!(playback[..2400].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_optimize_for_playback_decodes_float_output() {
        let processor = AudioProcessor::new(ProcessorConfig::default());
        let format = AudioFormat {
            sample_rate: 24000,
            channels: 1,
            bit_depth: 32,
            encoding: AudioEncoding::Float32,
        };
        let floats: Vec<u8> = (0..240)
            .flat_map(|i| ((i as f32 * 0.2).sin() * 0.5).to_le_bytes())
            .collect();

        let playback = processor.optimize_for_playback(&floats, &format).unwrap();
        assert_eq!(playback.len(), 2400 + 480);
    }

    #[test]
    fn test_float_to_pcm_scales_and_clamps() {
        let processor = AudioProcessor::new(ProcessorConfig::default());

        let converted = processor.float_to_pcm(&[0.0, 0.5, -0.5, 1.5, -1.5]);
        assert_eq!(converted, vec![0, 16384, -16384, 32767, -32768]);
    }
}
