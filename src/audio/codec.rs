//! # Audio Codec Utilities
//!
//! Pure, stateless transforms on raw audio byte buffers. Nothing in here
//! touches session state, so every function is safe to call from any task.
//!
//! ## Conventions:
//! - Buffers are 16-bit signed little-endian PCM unless a function says otherwise
//! - Durations are milliseconds, rates are Hz
//! - Functions that may return their input untouched hand back a `Cow`

use crate::audio::format::AudioError;
use byteorder::{ByteOrder, LittleEndian};
use std::borrow::Cow;

/// Decode little-endian 16-bit samples. A trailing odd byte is ignored.
pub fn decode_samples(buffer: &[u8]) -> Vec<i16> {
    let aligned = &buffer[..buffer.len() - buffer.len() % 2];
    let mut samples = vec![0i16; aligned.len() / 2];
    LittleEndian::read_i16_into(aligned, &mut samples);
    samples
}

/// Encode samples as little-endian 16-bit PCM bytes.
pub fn encode_samples(samples: &[i16]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut bytes);
    bytes
}

/// Resample mono PCM16 audio using linear interpolation.
///
/// ## Algorithm:
/// With `ratio = from_rate / to_rate`, output sample `i` sits at source
/// position `i * ratio` and is interpolated between the two nearest source
/// samples. The output holds `floor(samples / ratio)` samples.
///
/// Equal rates return the input borrowed, without copying.
pub fn resample(buffer: &[u8], from_rate: u32, to_rate: u32) -> Result<Cow<'_, [u8]>, AudioError> {
    if from_rate == 0 || to_rate == 0 {
        return Err(AudioError::InvalidParameter(format!(
            "cannot resample {}Hz -> {}Hz",
            from_rate, to_rate
        )));
    }
    if from_rate == to_rate {
        return Ok(Cow::Borrowed(buffer));
    }

    let samples = decode_samples(buffer);
    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).floor() as usize;

    let mut output = Vec::with_capacity(output_len);
    for i in 0..output_len {
        let position = i as f64 * ratio;
        let index = position.floor() as usize;
        let fraction = position - index as f64;

        let Some(&current) = samples.get(index) else {
            break;
        };
        let next = samples.get(index + 1).copied().unwrap_or(current);

        let value = current as f64 + (next as f64 - current as f64) * fraction;
        output.push(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
    }

    Ok(Cow::Owned(encode_samples(&output)))
}

/// Convert interleaved PCM16 audio between channel layouts.
///
/// ## Supported Conversions:
/// - **1 → 2**: each sample is duplicated into left and right
/// - **2 → 1**: left and right are averaged, rounding to the nearest integer
/// - **n → n**: returned unchanged
///
/// Anything else is an `UnsupportedConversion` error rather than a guess.
pub fn convert_channels(buffer: &[u8], from_channels: u16, to_channels: u16) -> Result<Cow<'_, [u8]>, AudioError> {
    match (from_channels, to_channels) {
        (from, to) if from == to && from > 0 => Ok(Cow::Borrowed(buffer)),
        (1, 2) => {
            let samples = decode_samples(buffer);
            let stereo: Vec<i16> = samples.iter().flat_map(|&s| [s, s]).collect();
            Ok(Cow::Owned(encode_samples(&stereo)))
        }
        (2, 1) => {
            let samples = decode_samples(buffer);
            let mono: Vec<i16> = samples
                .chunks_exact(2)
                .map(|frame| ((frame[0] as f64 + frame[1] as f64) / 2.0).round() as i16)
                .collect();
            Ok(Cow::Owned(encode_samples(&mono)))
        }
        (from, to) => Err(AudioError::UnsupportedConversion { from, to }),
    }
}

/// Validate a buffer as 16-bit PCM and decode its samples.
///
/// Odd-length buffers are rejected instead of padded: a dangling byte means
/// the stream lost sample alignment somewhere upstream.
pub fn to_pcm16(buffer: &[u8]) -> Result<Vec<i16>, AudioError> {
    if buffer.is_empty() {
        return Err(AudioError::Empty);
    }
    if buffer.len() % 2 != 0 {
        return Err(AudioError::MisalignedSamples(buffer.len()));
    }
    Ok(decode_samples(buffer))
}

/// Number of bytes covering `duration_ms` of PCM16 audio.
fn byte_len_for(duration_ms: u32, sample_rate: u32, channels: u16) -> usize {
    let frames = sample_rate as usize * duration_ms as usize / 1000;
    frames * 2 * channels as usize
}

/// Split a buffer into fixed windows of `chunk_duration_ms` each.
///
/// The trailing partial window is kept when non-empty, so merging the result
/// reproduces the input exactly.
pub fn chunk_audio(
    buffer: &[u8],
    chunk_duration_ms: u32,
    sample_rate: u32,
    channels: u16,
) -> Result<Vec<Vec<u8>>, AudioError> {
    let chunk_size = byte_len_for(chunk_duration_ms, sample_rate, channels);
    if chunk_size == 0 {
        return Err(AudioError::InvalidParameter(format!(
            "{}ms at {}Hz x{} yields an empty chunk",
            chunk_duration_ms, sample_rate, channels
        )));
    }
    Ok(buffer.chunks(chunk_size).map(<[u8]>::to_vec).collect())
}

/// Concatenate chunks in order.
pub fn merge_chunks<T: AsRef<[u8]>>(chunks: &[T]) -> Vec<u8> {
    let total: usize = chunks.iter().map(|c| c.as_ref().len()).sum();
    let mut merged = Vec::with_capacity(total);
    for chunk in chunks {
        merged.extend_from_slice(chunk.as_ref());
    }
    merged
}

/// Append `duration_ms` of digital silence.
pub fn add_silence(buffer: &[u8], duration_ms: u32, sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut padded = Vec::with_capacity(buffer.len() + byte_len_for(duration_ms, sample_rate, channels));
    padded.extend_from_slice(buffer);
    padded.resize(buffer.len() + byte_len_for(duration_ms, sample_rate, channels), 0);
    padded
}

/// Prepend `duration_ms` of digital silence (playback lead-in).
pub fn prepend_silence(buffer: &[u8], duration_ms: u32, sample_rate: u32, channels: u16) -> Vec<u8> {
    let mut padded = vec![0u8; byte_len_for(duration_ms, sample_rate, channels)];
    padded.extend_from_slice(buffer);
    padded
}

/// Peak-normalize unsigned 8-bit samples around the 128 midpoint.
///
/// The loudest deviation from 128 is scaled to `target_level * 128` and every
/// sample is clamped to [0, 255]. A flat buffer comes back unchanged.
pub fn normalize(buffer: &[u8], target_level: f64) -> Vec<u8> {
    let peak = buffer
        .iter()
        .map(|&b| (b as i32 - 128).abs())
        .max()
        .unwrap_or(0);
    if peak == 0 {
        return buffer.to_vec();
    }

    let scale = target_level * 128.0 / peak as f64;
    buffer
        .iter()
        .map(|&b| {
            let deviation = (b as f64 - 128.0) * scale;
            (128.0 + deviation).round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Peak-normalize signed 16-bit samples so the loudest one reaches
/// `target_level` of full scale.
pub fn normalize_pcm16(buffer: &[u8], target_level: f64) -> Vec<u8> {
    let mut samples = decode_samples(buffer);
    let peak = samples.iter().map(|&s| (s as i32).abs()).max().unwrap_or(0);
    if peak == 0 {
        return buffer.to_vec();
    }

    let scale = target_level * i16::MAX as f64 / peak as f64;
    for sample in &mut samples {
        let scaled = (*sample as f64 * scale).round();
        *sample = scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    }
    encode_samples(&samples)
}

/// Duration of a PCM16 buffer in milliseconds.
pub fn get_duration(buffer: &[u8], sample_rate: u32, channels: u16) -> f64 {
    if sample_rate == 0 || channels == 0 {
        return 0.0;
    }
    let frames = buffer.len() as f64 / (2.0 * channels as f64);
    frames / sample_rate as f64 * 1000.0
}

/// Generate a sine tone for self-tests.
///
/// Samples are unsigned 16-bit, biased around 32768 with half-scale
/// amplitude, written little-endian.
pub fn create_test_tone(frequency: f64, duration_ms: u32, sample_rate: u32) -> Vec<u8> {
    let sample_count = sample_rate as usize * duration_ms as usize / 1000;
    let mut tone = Vec::with_capacity(sample_count * 2);
    for i in 0..sample_count {
        let t = i as f64 / sample_rate as f64;
        let value = (2.0 * std::f64::consts::PI * frequency * t).sin() * 16383.0 + 32768.0;
        let sample = value.round().clamp(0.0, u16::MAX as f64) as u16;
        tone.extend_from_slice(&sample.to_le_bytes());
    }
    tone
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        encode_samples(samples)
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let buffer = pcm(&[1, -2, 300, -4000, 5]);
        let resampled = resample(&buffer, 16000, 16000).unwrap();
        assert!(matches!(resampled, Cow::Borrowed(_)));
        assert_eq!(resampled.as_ref(), buffer.as_slice());
    }

    #[test]
    fn test_resample_downsample_length_and_interpolation() {
        // 48kHz -> 16kHz keeps every third sample exactly
        let buffer = pcm(&[0, 10, 20, 30, 40, 50, 60, 70, 80]);
        let resampled = resample(&buffer, 48000, 16000).unwrap();
        assert_eq!(decode_samples(&resampled), vec![0, 30, 60]);
    }

    #[test]
    fn test_resample_upsample_interpolates_midpoints() {
        let buffer = pcm(&[0, 100, 200]);
        let resampled = resample(&buffer, 8000, 16000).unwrap();
        // floor(3 / 0.5) = 6 samples, the last one repeats the edge
        assert_eq!(decode_samples(&resampled), vec![0, 50, 100, 150, 200, 200]);
    }

    #[test]
    fn test_resample_rejects_zero_rate() {
        assert!(resample(&pcm(&[1, 2]), 0, 16000).is_err());
    }

    #[test]
    fn test_convert_channels_round_trip() {
        let mono = pcm(&[0, 1, -1, 32767, -32768, 1234]);
        let stereo = convert_channels(&mono, 1, 2).unwrap().into_owned();
        assert_eq!(stereo.len(), mono.len() * 2);

        let back = convert_channels(&stereo, 2, 1).unwrap().into_owned();
        for (original, converted) in decode_samples(&mono).iter().zip(decode_samples(&back).iter()) {
            assert!((*original as i32 - *converted as i32).abs() <= 1);
        }
    }

    #[test]
    fn test_stereo_downmix_averages_with_rounding() {
        let stereo = pcm(&[100, 201, -100, -300]);
        let mono = convert_channels(&stereo, 2, 1).unwrap();
        assert_eq!(decode_samples(&mono), vec![151, -200]);
    }

    #[test]
    fn test_unsupported_channel_conversion_is_an_error() {
        let buffer = pcm(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(
            convert_channels(&buffer, 6, 2).unwrap_err(),
            AudioError::UnsupportedConversion { from: 6, to: 2 }
        );
        assert!(convert_channels(&buffer, 0, 0).is_err());
    }

    #[test]
    fn test_to_pcm16_validation() {
        assert_eq!(to_pcm16(&[]).unwrap_err(), AudioError::Empty);
        assert_eq!(to_pcm16(&[1, 2, 3]).unwrap_err(), AudioError::MisalignedSamples(3));
        assert_eq!(to_pcm16(&pcm(&[7, -7])).unwrap(), vec![7, -7]);
    }

    #[test]
    fn test_chunk_then_merge_reconstructs_input() {
        // 100ms at 16kHz mono is 3200 bytes, so 7000 bytes gives 3 chunks
        let buffer: Vec<u8> = (0..7000u32).map(|i| (i % 251) as u8).collect();
        let chunks = chunk_audio(&buffer, 100, 16000, 1).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 3200);
        assert_eq!(chunks[2].len(), 600);
        assert_eq!(merge_chunks(&chunks), buffer);
    }

    #[test]
    fn test_chunk_audio_rejects_zero_window() {
        assert!(chunk_audio(&[0u8; 10], 0, 16000, 1).is_err());
    }

    #[test]
    fn test_silence_padding() {
        let buffer = pcm(&[5, 5]);
        let padded = add_silence(&buffer, 10, 16000, 1);
        assert_eq!(padded.len(), 4 + 320);
        assert!(padded[4..].iter().all(|&b| b == 0));

        let lead_in = prepend_silence(&buffer, 50, 24000, 1);
        assert_eq!(lead_in.len(), 2400 + 4);
        assert_eq!(&lead_in[2400..], buffer.as_slice());
    }

    #[test]
    fn test_normalize_byte_domain() {
        let buffer = vec![128, 160, 96, 128];
        let normalized = normalize(&buffer, 0.5);
        // peak deviation 32 maps to 64
        assert_eq!(normalized, vec![128, 192, 64, 128]);

        let flat = vec![128u8; 8];
        assert_eq!(normalize(&flat, 0.8), flat);
    }

    #[test]
    fn test_normalize_pcm16_scales_peak() {
        let buffer = pcm(&[1000, -2000, 500]);
        let normalized = decode_samples(&normalize_pcm16(&buffer, 0.5));
        assert_eq!(normalized[1], -16384);
        assert_eq!(normalized[0], 8192);
    }

    #[test]
    fn test_get_duration() {
        assert_eq!(get_duration(&vec![0u8; 32000], 16000, 1), 1000.0);
        assert_eq!(get_duration(&vec![0u8; 6400], 16000, 1), 200.0);
        assert_eq!(get_duration(&vec![0u8; 6400], 16000, 2), 100.0);
        assert_eq!(get_duration(&[0u8; 4], 0, 1), 0.0);
    }

    #[test]
    fn test_create_test_tone() {
        let tone = create_test_tone(440.0, 100, 16000);
        assert_eq!(tone.len(), 3200);
        // first sample is the bias point
        assert_eq!(u16::from_le_bytes([tone[0], tone[1]]), 32768);
        let distinct: std::collections::HashSet<u8> = tone.iter().copied().collect();
        assert!(distinct.len() > 10);
    }
}
