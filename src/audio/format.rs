//! # Audio Formats and Validation Errors
//!
//! Describes the shape of raw audio flowing through the pipeline and the
//! errors raised when a buffer doesn't match what a stage expects.
//!
//! ## Fixed Targets:
//! - **Recognition**: 16kHz, mono, 16-bit signed little-endian PCM
//! - **Playback**: configurable sample rate, mono, 16-bit PCM

use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample rate expected by the speech recognizer.
pub const RECOGNITION_SAMPLE_RATE: u32 = 16000;

/// Sample encoding of a raw audio buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM
    Pcm16Le,
    /// Unsigned 8-bit PCM (midpoint 128)
    Pcm8,
    /// 32-bit float samples in [-1.0, 1.0]
    Float32,
}

/// Audio format declared by a client or produced by a service.
///
/// ## Fields:
/// - **sample_rate**: samples per second per channel
/// - **channels**: interleaved channel count
/// - **bit_depth**: bits per sample
/// - **encoding**: how samples are laid out in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub encoding: AudioEncoding,
}

impl AudioFormat {
    /// 16-bit little-endian PCM at the given rate and channel count.
    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bit_depth: 16,
            encoding: AudioEncoding::Pcm16Le,
        }
    }

    /// The fixed format handed to the speech recognizer.
    pub fn recognition() -> Self {
        Self::pcm16(RECOGNITION_SAMPLE_RATE, 1)
    }

    /// Bytes occupied by one frame (one sample for every channel).
    pub fn bytes_per_frame(&self) -> usize {
        (self.bit_depth as usize / 8) * self.channels as usize
    }

    /// Whether the codec utilities can operate on this format.
    ///
    /// Only 16-bit little-endian PCM with one or two channels is handled.
    pub fn ensure_supported(&self) -> Result<(), AudioError> {
        if self.encoding != AudioEncoding::Pcm16Le || self.bit_depth != 16 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{:?} at {} bits",
                self.encoding, self.bit_depth
            )));
        }
        if self.sample_rate == 0 {
            return Err(AudioError::UnsupportedFormat("sample rate of 0".to_string()));
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(AudioError::UnsupportedFormat(format!(
                "{} channels",
                self.channels
            )));
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::recognition()
    }
}

/// Validation and conversion failures raised by the audio layer.
///
/// Every variant is recoverable: the offending chunk or cycle is dropped and
/// the session keeps running.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    /// Buffer contained no bytes
    Empty,
    /// Byte length is not a whole number of 16-bit samples
    MisalignedSamples(usize),
    /// Chunk is smaller than the configured minimum
    TooSmall { size: usize, minimum: usize },
    /// Too few distinct byte values, treated as corrupt or silent input
    Degenerate { distinct: usize, minimum: usize },
    /// Channel layout change that the codec doesn't implement
    UnsupportedConversion { from: u16, to: u16 },
    /// Format the codec can't operate on
    UnsupportedFormat(String),
    /// Parameter that would produce a meaningless result (e.g. zero window)
    InvalidParameter(String),
    /// Session already holds the maximum amount of unprocessed audio
    BufferFull { pending_ms: f64, limit_ms: f64 },
}

impl fmt::Display for AudioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioError::Empty => write!(f, "Audio data is empty"),
            AudioError::MisalignedSamples(len) => write!(
                f,
                "Audio data length must be even for 16-bit samples (got {} bytes)",
                len
            ),
            AudioError::TooSmall { size, minimum } => write!(
                f,
                "Audio chunk too small: {} bytes (minimum: {})",
                size, minimum
            ),
            AudioError::Degenerate { distinct, minimum } => write!(
                f,
                "Audio chunk has only {} distinct byte values (minimum: {}), may be corrupted or silent",
                distinct, minimum
            ),
            AudioError::UnsupportedConversion { from, to } => write!(
                f,
                "Unsupported channel conversion: {} -> {}",
                from, to
            ),
            AudioError::UnsupportedFormat(desc) => write!(f, "Unsupported audio format: {}", desc),
            AudioError::InvalidParameter(desc) => write!(f, "Invalid parameter: {}", desc),
            AudioError::BufferFull { pending_ms, limit_ms } => write!(
                f,
                "Session audio buffer full: {:.0}ms pending (limit: {:.0}ms)",
                pending_ms, limit_ms
            ),
        }
    }
}

impl std::error::Error for AudioError {}
