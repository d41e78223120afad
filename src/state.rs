//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## Components:
//! - **config**: runtime-updatable configuration
//! - **metrics**: request and connection counters
//! - **sessions / pipeline / registry**: the voice session core
//! - **chat / store**: text chat on top of the shared session store
//!
//! Everything is behind `Arc`, so cloning the state is cheap and every clone
//! sees the same sessions.

use crate::audio::processor::AudioProcessor;
use crate::audio::session::SessionManager;
use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::pipeline::VoicePipeline;
use crate::registry::{ConnectionRegistry, InMemoryConnectionRegistry};
use crate::services::http::{HttpReplyGenerator, HttpSpeechRecognizer, HttpSpeechSynthesizer};
use crate::services::{ReplyGenerator, SpeechRecognizer, SpeechSynthesizer};
use crate::store::{InMemorySessionStore, SessionStore};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    pub sessions: Arc<SessionManager>,
    pub pipeline: Arc<VoicePipeline>,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub chat: Arc<ChatService>,
    pub store: Arc<dyn SessionStore>,
}

/// Counters collected across all HTTP requests and connections.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Currently open voice connections
    pub active_connections: u32,

    /// Voice connections accepted since server start
    pub total_connections: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Build the state with HTTP-backed collaborators and an in-memory store.
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let recognizer = Arc::new(HttpSpeechRecognizer::new(&config.services)?);
        let generator = Arc::new(HttpReplyGenerator::new(&config.services)?);
        let synthesizer = Arc::new(HttpSpeechSynthesizer::new(&config.services)?);
        let store = Arc::new(InMemorySessionStore::new());

        Ok(Self::with_services(config, recognizer, generator, synthesizer, store))
    }

    /// Build the state around explicit collaborators.
    pub fn with_services(
        config: AppConfig,
        recognizer: Arc<dyn SpeechRecognizer>,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let sessions = Arc::new(SessionManager::new(
            config.performance.max_concurrent_sessions,
            config.performance.latency_window,
            config.audio.max_buffered_duration_ms,
            config.audio.default_capture_format(),
            AudioProcessor::new(config.audio.to_processor_config()),
        ));
        let registry: Arc<dyn ConnectionRegistry> = Arc::new(InMemoryConnectionRegistry::new());
        let chat = Arc::new(ChatService::new(Arc::clone(&store), generator, &config.chat));
        let pipeline = Arc::new(VoicePipeline::new(
            Arc::clone(&sessions),
            recognizer,
            chat.clone(),
            synthesizer,
            Arc::clone(&registry),
            config.audio.to_pipeline_config(),
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            sessions,
            pipeline,
            registry,
            chat,
            store,
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Audio, service and chat settings are read when the core is built, so
    /// changes to them take effect on restart; server limits apply at once.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        Ok(())
    }

    fn metrics_mut(&self) -> std::sync::RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn connection_opened(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_connections += 1;
        metrics.total_connections += 1;
    }

    pub fn connection_closed(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    /// Snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Fake collaborators shared by handler tests.

    use super::*;
    use crate::audio::codec;
    use crate::audio::format::AudioFormat;
    use crate::chat::history::ChatMessage;
    use crate::services::{SynthesizedAudio, Transcript};
    use async_trait::async_trait;

    pub struct CannedRecognizer(pub String);

    #[async_trait]
    impl SpeechRecognizer for CannedRecognizer {
        async fn transcribe(&self, _pcm: &[u8], _format: &AudioFormat) -> anyhow::Result<Transcript> {
            Ok(Transcript {
                text: self.0.clone(),
                confidence: 0.95,
            })
        }
    }

    pub struct EchoGenerator;

    #[async_trait]
    impl ReplyGenerator for EchoGenerator {
        async fn generate(
            &self,
            _session_id: &str,
            message: &str,
            _history: &[ChatMessage],
        ) -> anyhow::Result<Option<String>> {
            Ok(Some(format!("You said: {}", message)))
        }
    }

    pub struct ToneSynthesizer;

    #[async_trait]
    impl SpeechSynthesizer for ToneSynthesizer {
        async fn synthesize(&self, _text: &str) -> anyhow::Result<SynthesizedAudio> {
            Ok(SynthesizedAudio {
                data: codec::create_test_tone(330.0, 100, 24000),
                format: AudioFormat::pcm16(24000, 1),
            })
        }
    }

    pub fn test_state(config: AppConfig) -> AppState {
        AppState::with_services(
            config,
            Arc::new(CannedRecognizer("hello".to_string())),
            Arc::new(EchoGenerator),
            Arc::new(ToneSynthesizer),
            Arc::new(InMemorySessionStore::new()),
        )
    }
}
