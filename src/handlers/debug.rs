//! Debug endpoint for exercising the audio staging path without a client.
//!
//! Generates a test tone, pushes it through chunking, validation and the
//! recognition optimizer, and reports what came out at each stage.

use crate::audio::codec;
use crate::audio::format::AudioFormat;
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct SelfTestRequest {
    /// Tone frequency in Hz (defaults to 440)
    pub frequency: Option<f64>,
    /// Tone length (defaults to 1000ms)
    pub duration_ms: Option<u32>,
    /// Capture rate to simulate (defaults to 48000)
    pub sample_rate: Option<u32>,
    /// Capture channels to simulate, 1 or 2 (defaults to 1)
    pub channels: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SelfTestResponse {
    pub success: bool,
    pub capture_format: AudioFormat,
    pub input_bytes: usize,
    pub input_duration_ms: f64,
    pub chunk_count: usize,
    pub chunks_accepted: usize,
    pub round_trip_exact: bool,
    pub recognition_bytes: usize,
    pub recognition_duration_ms: f64,
    pub elapsed_ms: u64,
    pub error_details: Option<String>,
}

/// POST /debug/self-test
/// Body (all optional): {"frequency": 440, "duration_ms": 1000, "sample_rate": 48000, "channels": 2}
pub async fn self_test(
    state: web::Data<AppState>,
    body: Option<web::Json<SelfTestRequest>>,
) -> Result<HttpResponse, AppError> {
    let req = body.map(|b| b.into_inner()).unwrap_or_default();
    let frequency = req.frequency.unwrap_or(440.0);
    let duration_ms = req.duration_ms.unwrap_or(1000);
    let sample_rate = req.sample_rate.unwrap_or(48000);
    let channels = req.channels.unwrap_or(1);

    if !(20.0..=20000.0).contains(&frequency) {
        return Err(AppError::ValidationError("frequency must be between 20 and 20000 Hz".to_string()));
    }
    if duration_ms == 0 || duration_ms > 10_000 {
        return Err(AppError::ValidationError("duration_ms must be between 1 and 10000".to_string()));
    }

    let format = AudioFormat::pcm16(sample_rate, channels);
    format.ensure_supported()?;

    let started = std::time::Instant::now();
    tracing::info!(frequency, duration_ms, sample_rate, channels, "Debug: running audio self-test");

    let mono = codec::create_test_tone(frequency, duration_ms, sample_rate);
    let input = codec::convert_channels(&mono, 1, channels)?.into_owned();

    let chunks = codec::chunk_audio(&input, 100, sample_rate, channels)?;
    let processor = state.sessions.processor();
    let chunks_accepted = chunks
        .iter()
        .filter(|chunk| processor.validate_chunk(chunk).is_ok())
        .count();
    let merged = codec::merge_chunks(&chunks);

    let (recognition_bytes, recognition_duration_ms, error_details) =
        match processor.optimize_for_recognition(&merged, &format) {
            Ok(pcm) => (pcm.len(), codec::get_duration(&pcm, 16000, 1), None),
            Err(err) => (0, 0.0, Some(err.to_string())),
        };

    let round_trip_exact = merged == input;
    let response = SelfTestResponse {
        success: error_details.is_none() && round_trip_exact,
        capture_format: format,
        input_bytes: input.len(),
        input_duration_ms: codec::get_duration(&input, sample_rate, channels),
        chunk_count: chunks.len(),
        chunks_accepted,
        round_trip_exact,
        recognition_bytes,
        recognition_duration_ms,
        elapsed_ms: started.elapsed().as_millis() as u64,
        error_details,
    };

    Ok(HttpResponse::Ok().json(response))
}
