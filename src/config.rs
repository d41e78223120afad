//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables (deployment platforms)
//! 2. Environment variables (APP__SERVER__PORT, APP__CHAT__MAX_HISTORY, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Keys use a double underscore between path segments so that field names
//! containing underscores (`max_concurrent_sessions`) survive the mapping.

use crate::audio::format::AudioFormat;
use crate::audio::processor::ProcessorConfig;
use crate::pipeline::PipelineConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one concern (transport, audio staging, external
/// services, chat limits, resource limits) and can be updated independently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub services: ServicesConfig,
    pub chat: ChatConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to
/// - `port`: TCP port number to listen on
/// - `heartbeat_interval_secs`: how often WebSocket ping frames are sent
/// - `connection_max_idle_secs`: close connections silent for this long (0 = never)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub connection_max_idle_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(), // Localhost only (safe for development)
            port: 8080,
            heartbeat_interval_secs: 30,
            connection_max_idle_secs: 0,
        }
    }
}

/// Audio validation, accumulation and staging settings.
///
/// ## Accumulation:
/// - `min_processing_duration_ms`: buffered audio needed to start a cycle
/// - `flush_min_duration_ms`: buffered audio needed to process on `stop_streaming`
/// - `max_buffered_duration_ms`: unprocessed audio above this is rejected
///
/// ## Staging:
/// - `recognition_level` / `playback_level`: peak normalization targets (0.0 - 1.0)
/// - `playback_sample_rate`: rate of audio returned to the client
/// - `playback_lead_in_ms`: silence prepended to reply audio
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub default_sample_rate: u32,
    pub default_channels: u16,
    pub min_chunk_bytes: usize,
    pub min_distinct_byte_values: usize,
    pub min_processing_duration_ms: f64,
    pub flush_min_duration_ms: f64,
    pub max_buffered_duration_ms: f64,
    pub recognition_level: f64,
    pub playback_level: f64,
    pub playback_sample_rate: u32,
    pub playback_lead_in_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        let processor = ProcessorConfig::default();
        let pipeline = PipelineConfig::default();
        Self {
            default_sample_rate: 16000,
            default_channels: 1,
            min_chunk_bytes: processor.min_chunk_bytes,
            min_distinct_byte_values: processor.min_distinct_byte_values,
            min_processing_duration_ms: pipeline.min_processing_duration_ms,
            flush_min_duration_ms: pipeline.flush_min_duration_ms,
            max_buffered_duration_ms: 30_000.0,
            recognition_level: processor.recognition_level,
            playback_level: processor.playback_level,
            playback_sample_rate: processor.playback_sample_rate,
            playback_lead_in_ms: processor.playback_lead_in_ms,
        }
    }
}

impl AudioConfig {
    pub fn to_processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            min_chunk_bytes: self.min_chunk_bytes,
            min_distinct_byte_values: self.min_distinct_byte_values,
            recognition_level: self.recognition_level,
            playback_level: self.playback_level,
            playback_sample_rate: self.playback_sample_rate,
            playback_lead_in_ms: self.playback_lead_in_ms,
        }
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            min_processing_duration_ms: self.min_processing_duration_ms,
            flush_min_duration_ms: self.flush_min_duration_ms,
        }
    }

    /// Capture format assumed until a client declares its own.
    pub fn default_capture_format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.default_sample_rate, self.default_channels)
    }
}

/// Endpoints of the external recognition, reply and synthesis services.
///
/// `api_key` is sent as a bearer token when non-empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub recognition_url: String,
    pub reply_url: String,
    pub synthesis_url: String,
    pub api_key: String,
    pub request_timeout_secs: u64,
    pub voice: String,
    /// Sample rate assumed for raw (non-WAV) synthesis output
    pub synthesis_sample_rate: u32,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            recognition_url: "http://127.0.0.1:9000/v1/transcribe".to_string(),
            reply_url: "http://127.0.0.1:9001/v1/reply".to_string(),
            synthesis_url: "http://127.0.0.1:9002/v1/synthesize".to_string(),
            api_key: String::new(),
            request_timeout_secs: 30,
            voice: "default".to_string(),
            synthesis_sample_rate: 24000,
        }
    }
}

/// Chat history and rate-limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Lifetime of an idle chat session and of its lifetime counter
    pub session_ttl_secs: u64,
    /// Messages kept per session; older ones are trimmed
    pub max_history: usize,
    pub max_message_length: usize,
    /// Messages accepted per `window_secs`
    pub window_message_limit: u32,
    pub window_secs: u64,
    /// Messages accepted over a session's lifetime
    pub session_message_limit: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 3600,
            max_history: 50,
            max_message_length: 2000,
            window_message_limit: 10,
            window_secs: 60,
            session_message_limit: 100,
        }
    }
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: voice sessions handled simultaneously
/// - `latency_window`: processing latencies kept per session
/// - `session_idle_timeout_secs`: voice sessions idle this long are evicted
/// - `maintenance_interval_secs`: how often eviction and store purging run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub latency_window: usize,
    pub session_idle_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 100,
            latency_window: 10,
            session_idle_timeout_secs: 600,
            maintenance_interval_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__AUDIO__MIN_PROCESSING_DURATION_MS=750`: Override the cycle threshold
    /// - `APP__SERVICES__API_KEY=...`: Credentials for the external services
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );

        // Deployment platforms set these without the APP prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        let audio = &self.audio;
        if audio.default_sample_rate == 0 || audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if !(1..=2).contains(&audio.default_channels) {
            return Err(anyhow::anyhow!("Default channel count must be 1 or 2"));
        }

        if audio.min_chunk_bytes < 2 {
            return Err(anyhow::anyhow!("Minimum chunk size must hold at least one sample"));
        }

        if audio.min_processing_duration_ms <= 0.0 || audio.flush_min_duration_ms <= 0.0 {
            return Err(anyhow::anyhow!("Processing thresholds must be greater than 0"));
        }

        if audio.flush_min_duration_ms > audio.min_processing_duration_ms {
            return Err(anyhow::anyhow!(
                "Flush threshold cannot exceed the processing threshold"
            ));
        }

        if audio.max_buffered_duration_ms < audio.min_processing_duration_ms {
            return Err(anyhow::anyhow!(
                "Maximum buffered duration must be at least the processing threshold"
            ));
        }

        for (name, level) in [
            ("recognition_level", audio.recognition_level),
            ("playback_level", audio.playback_level),
        ] {
            if !(level > 0.0 && level <= 1.0) {
                return Err(anyhow::anyhow!("{} must be in (0.0, 1.0]", name));
            }
        }

        if self.services.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Service request timeout must be greater than 0"));
        }

        let chat = &self.chat;
        if chat.max_history == 0 || chat.max_message_length == 0 {
            return Err(anyhow::anyhow!("Chat history and message length limits must be greater than 0"));
        }

        if chat.window_message_limit == 0 || chat.session_message_limit == 0 || chat.window_secs == 0 {
            return Err(anyhow::anyhow!("Chat rate limits must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.latency_window == 0 {
            return Err(anyhow::anyhow!("Latency window must be greater than 0"));
        }

        if self.performance.maintenance_interval_secs == 0 {
            return Err(anyhow::anyhow!("Maintenance interval must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON change, e.g.
    /// `{"chat": {"window_message_limit": 20}}`. The update is applied only if
    /// the resulting configuration validates; otherwise nothing changes.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Copy safe to expose over HTTP.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.services.api_key.is_empty() {
            copy.services.api_key = "***".to_string();
        }
        copy
    }
}

fn merge_json(target: &mut serde_json::Value, patch: serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.min_processing_duration_ms, 500.0);
        assert_eq!(config.audio.min_chunk_bytes, 320);
        assert_eq!(config.performance.latency_window, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.flush_min_duration_ms = 900.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.playback_level = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.default_channels = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "chat": {"window_message_limit": 20}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.chat.window_message_limit, 20);
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.chat.max_history, 50);
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        assert!(config.update_from_json(r#"{"server": {"port": 0}}"#).is_err());
        assert_eq!(config.server.port, 8080);

        assert!(config.update_from_json(r#"{"audio": {"min_chunk_bytes": "big"}}"#).is_err());
        assert!(config.update_from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = AppConfig::default();
        let processor = config.audio.to_processor_config();
        assert_eq!(processor.playback_sample_rate, 24000);
        assert_eq!(processor.playback_lead_in_ms, 50);

        let pipeline = config.audio.to_pipeline_config();
        assert_eq!(pipeline.flush_min_duration_ms, 250.0);
        assert_eq!(config.audio.default_capture_format(), AudioFormat::recognition());
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.services.api_key = "secret".to_string();
        assert_eq!(config.redacted().services.api_key, "***");
        assert_eq!(config.services.api_key, "secret");
    }
}
