//! HTTP-backed implementations of the service contracts.
//!
//! Each client posts to a single configured endpoint. Audio travels as WAV
//! to the recognizer; the synthesizer may answer with WAV or raw PCM16.

use crate::audio::codec;
use crate::audio::format::{AudioEncoding, AudioFormat};
use crate::chat::history::ChatMessage;
use crate::config::ServicesConfig;
use crate::services::{
    estimate_confidence, ReplyGenerator, SpeechRecognizer, SpeechSynthesizer, SynthesizedAudio, Transcript,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;

fn build_client(config: &ServicesConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .context("failed to build HTTP client")
}

fn with_auth(request: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        request
    } else {
        request.bearer_auth(api_key)
    }
}

/// Wrap PCM16 samples in a WAV container.
pub fn encode_wav(pcm: &[u8], format: &AudioFormat) -> Result<Vec<u8>> {
    let header = wav::Header::new(
        wav::header::WAV_FORMAT_PCM,
        format.channels,
        format.sample_rate,
        format.bit_depth,
    );
    let samples = codec::to_pcm16(pcm)?;
    let mut cursor = Cursor::new(Vec::new());
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut cursor)?;
    Ok(cursor.into_inner())
}

/// Unwrap a WAV container into raw bytes plus their format.
pub fn decode_wav(bytes: &[u8]) -> Result<SynthesizedAudio> {
    let mut cursor = Cursor::new(bytes);
    let (header, data) = wav::read(&mut cursor).context("invalid WAV payload")?;

    match data {
        wav::BitDepth::Sixteen(samples) => Ok(SynthesizedAudio {
            data: codec::encode_samples(&samples),
            format: AudioFormat::pcm16(header.sampling_rate, header.channel_count),
        }),
        wav::BitDepth::ThirtyTwoFloat(samples) => Ok(SynthesizedAudio {
            data: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            format: AudioFormat {
                sample_rate: header.sampling_rate,
                channels: header.channel_count,
                bit_depth: 32,
                encoding: AudioEncoding::Float32,
            },
        }),
        _ => Err(anyhow!(
            "unsupported WAV sample depth: {} bits",
            header.bits_per_sample
        )),
    }
}

#[derive(Debug, Deserialize)]
struct RecognitionResponse {
    #[serde(alias = "transcript")]
    text: String,
    confidence: Option<f32>,
}

/// Speech recognizer behind an HTTP endpoint accepting `audio/wav`.
pub struct HttpSpeechRecognizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpSpeechRecognizer {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            url: config.recognition_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl SpeechRecognizer for HttpSpeechRecognizer {
    async fn transcribe(&self, pcm: &[u8], format: &AudioFormat) -> Result<Transcript> {
        let body = encode_wav(pcm, format)?;
        let audio_secs = codec::get_duration(pcm, format.sample_rate, format.channels) / 1000.0;

        let request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(body);
        let response: RecognitionResponse = with_auth(request, &self.api_key)
            .send()
            .await
            .context("recognition request failed")?
            .error_for_status()?
            .json()
            .await
            .context("invalid recognition response")?;

        let text = response.text.trim().to_string();
        let confidence = response
            .confidence
            .unwrap_or_else(|| estimate_confidence(&text, audio_secs));

        Ok(Transcript { text, confidence })
    }
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
    sample_rate: u32,
}

/// Speech synthesizer behind an HTTP endpoint answering with WAV or raw PCM16.
pub struct HttpSpeechSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: String,
    voice: String,
    sample_rate: u32,
}

impl HttpSpeechSynthesizer {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            url: config.synthesis_url.clone(),
            api_key: config.api_key.clone(),
            voice: config.voice.clone(),
            sample_rate: config.synthesis_sample_rate,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio> {
        let request = self.client.post(&self.url).json(&SynthesisRequest {
            text,
            voice: &self.voice,
            sample_rate: self.sample_rate,
        });
        let response = with_auth(request, &self.api_key)
            .send()
            .await
            .context("synthesis request failed")?
            .error_for_status()?;

        let is_wav = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("wav"));
        let bytes = response.bytes().await.context("failed to read synthesized audio")?;

        if is_wav || bytes.starts_with(b"RIFF") {
            decode_wav(&bytes)
        } else {
            Ok(SynthesizedAudio {
                data: bytes.to_vec(),
                format: AudioFormat::pcm16(self.sample_rate, 1),
            })
        }
    }
}

#[derive(Debug, Serialize)]
struct ReplyRequest<'a> {
    session_id: &'a str,
    message: &'a str,
    history: Vec<HistoryEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct HistoryEntry<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ReplyResponse {
    #[serde(alias = "response", alias = "text")]
    reply: Option<String>,
}

/// Reply generator behind an HTTP endpoint (retrieval-augmented or plain LLM).
pub struct HttpReplyGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpReplyGenerator {
    pub fn new(config: &ServicesConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            url: config.reply_url.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ReplyGenerator for HttpReplyGenerator {
    async fn generate(
        &self,
        session_id: &str,
        message: &str,
        history: &[ChatMessage],
    ) -> Result<Option<String>> {
        let body = ReplyRequest {
            session_id,
            message,
            history: history
                .iter()
                .map(|m| HistoryEntry {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
        };

        let request = self.client.post(&self.url).json(&body);
        let response: ReplyResponse = with_auth(request, &self.api_key)
            .send()
            .await
            .context("reply request failed")?
            .error_for_status()?
            .json()
            .await
            .context("invalid reply response")?;

        Ok(response.reply.filter(|r| !r.trim().is_empty()))
    }
}
