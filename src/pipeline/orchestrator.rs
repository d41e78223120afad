//! # Voice Pipeline Orchestrator
//!
//! Decides when a session has buffered enough audio and drives one processing
//! cycle over it: optimize → recognize → reply → synthesize → optimize for
//! playback.
//!
//! ## Session States:
//! - **Idle**: nothing buffered, or below the threshold
//! - **Accumulating**: audio buffered, below `min_processing_duration_ms`
//! - **Processing**: threshold reached, guard acquired, cycle running
//!
//! A session whose guard is held defers: its audio keeps accumulating and is
//! picked up by the next eligible cycle. Cycles run as tokio tasks and hold
//! only the per-session processing guard while they await collaborators.

use crate::audio::buffer::ProcessingGuard;
use crate::audio::format::{AudioError, AudioFormat};
use crate::audio::session::{SessionManager, VoiceSession};
use crate::protocol::{now_millis, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::services::{ReplyService, SpeechRecognizer, SpeechSynthesizer};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accumulation thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Pending audio needed before a cycle starts on ingest
    pub min_processing_duration_ms: f64,
    /// Pending audio needed before a cycle starts on `stop_streaming`
    pub flush_min_duration_ms: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_processing_duration_ms: 500.0,
            flush_min_duration_ms: 250.0,
        }
    }
}

/// What happened to the session after an ingest or flush.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Below the threshold; audio is waiting
    Buffered { pending_ms: f64 },
    /// Threshold reached but a cycle is already running
    Deferred { pending_ms: f64 },
    /// A new cycle was spawned over the pending window
    CycleStarted {
        window_ms: f64,
        handle: JoinHandle<CycleReport>,
    },
}

impl IngestOutcome {
    pub fn pending_ms(&self) -> f64 {
        match self {
            IngestOutcome::Buffered { pending_ms } | IngestOutcome::Deferred { pending_ms } => *pending_ms,
            IngestOutcome::CycleStarted { .. } => 0.0,
        }
    }
}

/// Result of one processing cycle.
///
/// Failures still produce a report: `error` is set, and `transcript` is empty
/// unless recognition succeeded before the failure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub session_id: String,
    pub transcript: String,
    pub confidence: f32,
    pub reply: Option<String>,
    pub audio_bytes: usize,
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl CycleReport {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Self::default()
        }
    }

    fn failed(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Owns the processing cycles for every voice session.
pub struct VoicePipeline {
    sessions: Arc<SessionManager>,
    recognizer: Arc<dyn SpeechRecognizer>,
    replies: Arc<dyn ReplyService>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    registry: Arc<dyn ConnectionRegistry>,
    config: PipelineConfig,
}

impl VoicePipeline {
    pub fn new(
        sessions: Arc<SessionManager>,
        recognizer: Arc<dyn SpeechRecognizer>,
        replies: Arc<dyn ReplyService>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        registry: Arc<dyn ConnectionRegistry>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            sessions,
            recognizer,
            replies,
            synthesizer,
            registry,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<dyn ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Buffer one inbound chunk and start a cycle if the session is due.
    ///
    /// Returns immediately; the cycle (if any) runs on its own task.
    pub fn ingest(self: &Arc<Self>, session: &Arc<VoiceSession>, data: Vec<u8>) -> Result<IngestOutcome, AudioError> {
        let bytes = data.len();
        let pending_ms = session.append_audio(data, self.sessions.processor(), self.sessions.max_buffered_ms())?;
        debug!(
            session_id = %session.session_id,
            bytes,
            pending_ms,
            "Audio chunk buffered"
        );

        Ok(self.start_if_due(session, self.config.min_processing_duration_ms))
    }

    /// Process whatever is pending at the end of a speaking turn, as long as
    /// it reaches the flush threshold.
    pub fn flush(self: &Arc<Self>, session: &Arc<VoiceSession>) -> IngestOutcome {
        self.start_if_due(session, self.config.flush_min_duration_ms)
    }

    fn start_if_due(self: &Arc<Self>, session: &Arc<VoiceSession>, threshold_ms: f64) -> IngestOutcome {
        let pending_ms = session.buffer.total_duration_ms();
        if pending_ms < threshold_ms {
            return IngestOutcome::Buffered { pending_ms };
        }

        let Some(guard) = session.buffer.begin_processing() else {
            debug!(session_id = %session.session_id, pending_ms, "Cycle already running, deferring");
            return IngestOutcome::Deferred { pending_ms };
        };

        let pipeline = Arc::clone(self);
        let session = Arc::clone(session);
        let handle = tokio::spawn(async move {
            let report = pipeline.run_cycle(Arc::clone(&session), guard).await;
            // Audio deferred while this cycle ran is due as soon as it ends
            if let IngestOutcome::CycleStarted { window_ms, .. } =
                pipeline.start_if_due(&session, pipeline.config.min_processing_duration_ms)
            {
                debug!(session_id = %session.session_id, window_ms, "Started cycle over deferred audio");
            }
            report
        });

        IngestOutcome::CycleStarted {
            window_ms: pending_ms,
            handle,
        }
    }

    /// Tear down sessions idle for longer than `max_idle` that no live
    /// connection is attached to.
    pub fn evict_idle_sessions(&self, max_idle: chrono::Duration) -> usize {
        self.sessions
            .cleanup_idle_sessions(max_idle, |session_id| self.registry.lookup(session_id).is_some())
    }

    /// Run one cycle over the window claimed by `guard`.
    ///
    /// The guard is consumed on every exit path, so the claimed window is
    /// drained and the processing flag cleared even if a step fails.
    pub async fn run_cycle(&self, session: Arc<VoiceSession>, guard: ProcessingGuard) -> CycleReport {
        let started = Instant::now();
        let mut report = self.process_window(&session, &guard).await;
        guard.finish();

        report.latency_ms = started.elapsed().as_millis() as u64;
        session.record_cycle(report.latency_ms, report.succeeded());

        match &report.error {
            None => info!(
                session_id = %session.session_id,
                latency_ms = report.latency_ms,
                transcript_chars = report.transcript.len(),
                audio_bytes = report.audio_bytes,
                "Processing cycle completed"
            ),
            Some(err) => warn!(
                session_id = %session.session_id,
                latency_ms = report.latency_ms,
                error = %err,
                "Processing cycle ended early"
            ),
        }

        report
    }

    async fn process_window(&self, session: &VoiceSession, guard: &ProcessingGuard) -> CycleReport {
        let session_id = session.session_id.as_str();
        let report = CycleReport::new(session_id);
        let processor = self.sessions.processor();

        let window = guard.window();
        if window.is_empty() {
            return report.failed("no audio claimed for processing");
        }

        // Validate and stage every chunk from its declared format
        let pcm = match processor.optimize_window(&window) {
            Ok(pcm) => pcm,
            Err(err) => {
                self.emit(session_id, ServerMessage::error("invalid_audio", err.to_string()));
                return report.failed(err.to_string());
            }
        };

        let transcript = match self.recognizer.transcribe(&pcm, &AudioFormat::recognition()).await {
            Ok(transcript) => transcript,
            Err(err) => {
                self.emit(
                    session_id,
                    ServerMessage::error("recognition_failed", format!("Speech recognition failed: {}", err)),
                );
                return report.failed(format!("recognition: {}", err));
            }
        };

        if transcript.is_blank() {
            debug!(session_id = %session_id, "Blank transcript, no reply");
            return report;
        }

        let mut report = CycleReport {
            transcript: transcript.text.clone(),
            confidence: transcript.confidence,
            ..report
        };
        self.emit(
            session_id,
            ServerMessage::Transcription {
                transcript: transcript.text.clone(),
                confidence: transcript.confidence,
                timestamp: now_millis(),
            },
        );

        let reply = match self.replies.reply(&transcript.text, session_id).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                debug!(session_id = %session_id, "No reply generated");
                return report;
            }
            Err(err) => {
                self.emit(session_id, ServerMessage::reply_error(&err));
                return report.failed(format!("reply: {}", err));
            }
        };
        report.reply = Some(reply.clone());

        let synthesized = match self.synthesizer.synthesize(&reply).await {
            Ok(audio) => audio,
            Err(err) => {
                self.emit(
                    session_id,
                    ServerMessage::error("synthesis_failed", format!("Speech synthesis failed: {}", err)),
                );
                return report.failed(format!("synthesis: {}", err));
            }
        };

        let playback = match processor.optimize_for_playback(&synthesized.data, &synthesized.format) {
            Ok(audio) => audio,
            Err(err) => {
                self.emit(session_id, ServerMessage::error("synthesis_failed", err.to_string()));
                return report.failed(format!("playback: {}", err));
            }
        };

        report.audio_bytes = playback.len();
        self.emit(
            session_id,
            ServerMessage::AudioResponse {
                audio: playback,
                format: processor.playback_format(),
                timestamp: now_millis(),
            },
        );

        report
    }

    fn emit(&self, session_id: &str, message: ServerMessage) {
        let kind = message.type_name();
        if !self.registry.send(session_id, message) {
            debug!(session_id = %session_id, kind, "Connection gone, dropping output");
        }
    }
}
