//! # Voice Session Management
//!
//! Tracks every live voice session: its capture format, connection state,
//! audio buffer and rolling processing statistics. Sessions are handed out as
//! `Arc<VoiceSession>` handles so each operation works on an explicit session
//! object rather than looking state up behind the caller's back.
//!
//! ## Session Lifecycle:
//! 1. **Created**: first connection for a session id
//! 2. **Connected / Streaming**: receiving audio, running cycles
//! 3. **Removed**: connection close, explicit end, or idle expiry

use crate::audio::buffer::{AudioChunk, BufferStats, SessionAudioBuffer};
use crate::audio::format::{AudioError, AudioFormat};
use crate::audio::processor::AudioProcessor;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Connection state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Connection open, no active speaking turn
    Connected,
    /// Client is in an active speaking turn
    Streaming,
    /// Connection closed, awaiting teardown
    Disconnected,
}

/// Errors from keyed session operations.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    NotFound(String),
    LimitReached(usize),
    Audio(AudioError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotFound(id) => write!(f, "Voice session not found: {}", id),
            SessionError::LimitReached(max) => {
                write!(f, "Maximum concurrent sessions ({}) reached", max)
            }
            SessionError::Audio(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<AudioError> for SessionError {
    fn from(err: AudioError) -> Self {
        SessionError::Audio(err)
    }
}

/// Processing-cycle performance for one session.
#[derive(Debug)]
struct SessionPerformance {
    /// Most recent cycle latencies, oldest first
    recent_latencies_ms: VecDeque<u64>,
    latency_window: usize,
    cycles_completed: u64,
    cycles_failed: u64,
}

impl SessionPerformance {
    fn new(latency_window: usize) -> Self {
        Self {
            recent_latencies_ms: VecDeque::with_capacity(latency_window),
            latency_window,
            cycles_completed: 0,
            cycles_failed: 0,
        }
    }
}

/// One logical voice conversation.
#[derive(Debug)]
pub struct VoiceSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    connection_state: RwLock<ConnectionState>,
    capture_format: RwLock<AudioFormat>,
    pub buffer: Arc<SessionAudioBuffer>,
    performance: RwLock<SessionPerformance>,
}

impl VoiceSession {
    pub fn new(session_id: String, capture_format: AudioFormat, latency_window: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            last_activity: RwLock::new(now),
            connection_state: RwLock::new(ConnectionState::Connected),
            capture_format: RwLock::new(capture_format),
            buffer: Arc::new(SessionAudioBuffer::new()),
            performance: RwLock::new(SessionPerformance::new(latency_window.max(1))),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.write().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        *self.connection_state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn capture_format(&self) -> AudioFormat {
        *self.capture_format.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Change the declared capture format for chunks received from now on.
    pub fn set_capture_format(&self, format: AudioFormat) -> Result<(), AudioError> {
        format.ensure_supported()?;
        *self.capture_format.write().unwrap_or_else(|e| e.into_inner()) = format;
        Ok(())
    }

    /// Validate and buffer one inbound chunk.
    ///
    /// ## Returns:
    /// Pending (unprocessed) audio duration in milliseconds after the append.
    pub fn append_audio(
        &self,
        data: Vec<u8>,
        processor: &AudioProcessor,
        max_buffered_ms: f64,
    ) -> Result<f64, AudioError> {
        self.touch();

        if let Err(err) = processor.validate_chunk(&data) {
            self.buffer.record_rejection();
            return Err(err);
        }

        let chunk = AudioChunk::new(data, self.capture_format());
        self.buffer.append(chunk, max_buffered_ms)
    }

    /// Record the outcome of one processing cycle.
    ///
    /// Latencies are kept in a bounded window; the oldest is evicted first.
    pub fn record_cycle(&self, latency_ms: u64, succeeded: bool) {
        let mut perf = self.performance.write().unwrap_or_else(|e| e.into_inner());
        if perf.recent_latencies_ms.len() == perf.latency_window {
            perf.recent_latencies_ms.pop_front();
        }
        perf.recent_latencies_ms.push_back(latency_ms);

        if succeeded {
            perf.cycles_completed += 1;
        } else {
            perf.cycles_failed += 1;
        }
    }

    pub fn recent_latencies_ms(&self) -> Vec<u64> {
        let perf = self.performance.read().unwrap_or_else(|e| e.into_inner());
        perf.recent_latencies_ms.iter().copied().collect()
    }

    /// Whether the session has been quiet for longer than `max_idle`.
    pub fn is_idle(&self, max_idle: Duration) -> bool {
        Utc::now().signed_duration_since(self.last_activity()) > max_idle
    }

    /// Snapshot of the session for API responses.
    pub fn stats(&self) -> SessionStats {
        let perf = self.performance.read().unwrap_or_else(|e| e.into_inner());
        let recent: Vec<u64> = perf.recent_latencies_ms.iter().copied().collect();
        let average_latency_ms = if recent.is_empty() {
            0.0
        } else {
            recent.iter().sum::<u64>() as f64 / recent.len() as f64
        };

        SessionStats {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            connection_state: self.connection_state(),
            capture_format: self.capture_format(),
            is_processing: self.buffer.is_processing(),
            pending_duration_ms: self.buffer.total_duration_ms(),
            buffer: self.buffer.stats(),
            cycles_completed: perf.cycles_completed,
            cycles_failed: perf.cycles_failed,
            recent_latencies_ms: recent,
            average_latency_ms,
        }
    }
}

/// Serializable snapshot of a voice session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub connection_state: ConnectionState,
    pub capture_format: AudioFormat,
    pub is_processing: bool,
    pub pending_duration_ms: f64,
    pub buffer: BufferStats,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub recent_latencies_ms: Vec<u64>,
    pub average_latency_ms: f64,
}

/// Manages every live voice session, keyed by session id.
///
/// ## Thread Safety:
/// The map itself is behind an RwLock; each session carries its own locks,
/// so no operation on one session ever waits on another.
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<VoiceSession>>>,
    max_concurrent_sessions: usize,
    latency_window: usize,
    max_buffered_ms: f64,
    default_format: AudioFormat,
    processor: AudioProcessor,
}

impl SessionManager {
    pub fn new(
        max_concurrent_sessions: usize,
        latency_window: usize,
        max_buffered_ms: f64,
        default_format: AudioFormat,
        processor: AudioProcessor,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
            latency_window,
            max_buffered_ms,
            default_format,
            processor,
        }
    }

    pub fn processor(&self) -> &AudioProcessor {
        &self.processor
    }

    /// Cap on unprocessed audio per session.
    pub fn max_buffered_ms(&self) -> f64 {
        self.max_buffered_ms
    }

    /// Create a session, or return the existing one for a known id.
    ///
    /// ## Parameters:
    /// - **session_id**: client-supplied id; a UUID is generated when absent
    pub fn create_session(&self, session_id: Option<String>) -> Result<Arc<VoiceSession>, SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(existing) = sessions.get(&session_id) {
            existing.touch();
            existing.set_connection_state(ConnectionState::Connected);
            return Ok(Arc::clone(existing));
        }

        if sessions.len() >= self.max_concurrent_sessions {
            return Err(SessionError::LimitReached(self.max_concurrent_sessions));
        }

        let session = Arc::new(VoiceSession::new(
            session_id.clone(),
            self.default_format,
            self.latency_window,
        ));
        sessions.insert(session_id.clone(), Arc::clone(&session));
        tracing::info!(session_id = %session_id, "Voice session created");

        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<VoiceSession>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).cloned()
    }

    /// Tear a session down: drop its buffer and remove it.
    pub fn clear(&self, session_id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.remove(session_id)
        };

        match removed {
            Some(session) => {
                session.set_connection_state(ConnectionState::Disconnected);
                session.buffer.clear();
                tracing::info!(session_id = %session_id, "Voice session torn down");
                true
            }
            None => false,
        }
    }

    /// Remove sessions with no activity for longer than `max_idle`.
    ///
    /// Sessions for which `in_use` returns true are kept regardless of
    /// activity; their connection owns the teardown.
    pub fn cleanup_idle_sessions(&self, max_idle: Duration, in_use: impl Fn(&str) -> bool) -> usize {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            sessions
                .values()
                .filter(|session| session.is_idle(max_idle) && !in_use(&session.session_id))
                .map(|session| session.session_id.clone())
                .collect()
        };

        expired.iter().filter(|id| self.clear(id)).count()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_concurrent_sessions
    }

    /// Snapshot of every live session.
    pub fn get_sessions_summary(&self) -> SessionManagerSummary {
        let sessions: Vec<Arc<VoiceSession>> = {
            let map = self.sessions.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };

        let mut state_counts = HashMap::new();
        let mut total_audio_bytes = 0;
        let mut stats = Vec::with_capacity(sessions.len());

        for session in sessions {
            let snapshot = session.stats();
            let key = match snapshot.connection_state {
                ConnectionState::Connected => "connected",
                ConnectionState::Streaming => "streaming",
                ConnectionState::Disconnected => "disconnected",
            };
            *state_counts.entry(key.to_string()).or_insert(0) += 1;
            total_audio_bytes += snapshot.buffer.total_bytes;
            stats.push(snapshot);
        }

        SessionManagerSummary {
            total_sessions: stats.len(),
            max_sessions: self.max_concurrent_sessions,
            state_counts,
            total_audio_bytes,
            sessions: stats,
        }
    }
}

/// Summary of session manager state.
#[derive(Debug, Serialize)]
pub struct SessionManagerSummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub state_counts: HashMap<String, usize>,
    pub total_audio_bytes: u64,
    pub sessions: Vec<SessionStats>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;
    use crate::audio::processor::ProcessorConfig;

    fn manager(max_sessions: usize) -> SessionManager {
        SessionManager::new(
            max_sessions,
            10,
            30_000.0,
            AudioFormat::recognition(),
            AudioProcessor::new(ProcessorConfig::default()),
        )
    }

    fn speech_ms(duration_ms: u32) -> Vec<u8> {
        let count = 16 * duration_ms as usize;
        let samples: Vec<i16> = (0..count).map(|i| ((i as f32 * 0.1).sin() * 6000.0) as i16).collect();
        codec::encode_samples(&samples)
    }

    #[test]
    fn test_create_session_generates_id_and_reuses_known_ids() {
        let manager = manager(4);
        let generated = manager.create_session(None).unwrap();
        assert!(!generated.session_id.is_empty());

        let named = manager.create_session(Some("abc".to_string())).unwrap();
        let again = manager.create_session(Some("abc".to_string())).unwrap();
        assert!(Arc::ptr_eq(&named, &again));
        assert_eq!(manager.active_session_count(), 2);
    }

    #[test]
    fn test_session_limit() {
        let manager = manager(1);
        manager.create_session(Some("a".to_string())).unwrap();
        assert_eq!(
            manager.create_session(Some("b".to_string())).unwrap_err(),
            SessionError::LimitReached(1)
        );
    }

    fn append(manager: &SessionManager, session: &VoiceSession, data: Vec<u8>) -> Result<f64, AudioError> {
        session.append_audio(data, manager.processor(), manager.max_buffered_ms())
    }

    #[test]
    fn test_append_tracks_pending_duration() {
        let manager = manager(4);
        let session = manager.create_session(Some("s1".to_string())).unwrap();

        assert_eq!(append(&manager, &session, speech_ms(200)).unwrap(), 200.0);
        assert_eq!(append(&manager, &session, speech_ms(100)).unwrap(), 300.0);
        assert_eq!(session.buffer.total_duration_ms(), 300.0);
    }

    #[test]
    fn test_rejected_chunks_never_reach_the_buffer() {
        let manager = manager(4);
        let session = manager.create_session(Some("s1".to_string())).unwrap();

        let mut odd = speech_ms(100);
        odd.push(0);
        assert!(append(&manager, &session, odd).is_err());
        assert!(append(&manager, &session, vec![1, 2, 3, 4]).is_err());
        assert!(append(&manager, &session, vec![7u8; 4000]).is_err());

        assert_eq!(session.buffer.chunk_count(), 0);
        assert_eq!(session.stats().buffer.rejected_chunks, 3);
    }

    #[test]
    fn test_chunks_keep_the_format_declared_at_arrival() {
        let manager = manager(4);
        let session = manager.create_session(Some("s1".to_string())).unwrap();

        append(&manager, &session, speech_ms(200)).unwrap();
        session.set_capture_format(AudioFormat::pcm16(48000, 2)).unwrap();
        let stereo = codec::convert_channels(&speech_ms(600), 1, 2).unwrap().into_owned();
        // 9600 stereo frames at 48kHz
        assert_eq!(append(&manager, &session, stereo).unwrap(), 400.0);

        assert!(session.buffer.try_begin_processing());
        let formats: Vec<AudioFormat> = session.buffer.claimed_chunks().iter().map(|c| c.format).collect();
        assert_eq!(formats, vec![AudioFormat::recognition(), AudioFormat::pcm16(48000, 2)]);
    }

    #[test]
    fn test_latency_window_evicts_oldest() {
        let session = VoiceSession::new("s".to_string(), AudioFormat::recognition(), 10);
        for latency in 1..=12 {
            session.record_cycle(latency, true);
        }
        assert_eq!(session.recent_latencies_ms(), (3..=12).collect::<Vec<u64>>());
        assert_eq!(session.stats().cycles_completed, 12);
    }

    #[test]
    fn test_clear_and_idle_cleanup() {
        let manager = manager(4);
        let session = manager.create_session(Some("s1".to_string())).unwrap();
        append(&manager, &session, speech_ms(200)).unwrap();

        assert!(manager.clear("s1"));
        assert!(!manager.clear("s1"));
        assert_eq!(session.buffer.chunk_count(), 0);
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);

        manager.create_session(Some("s2".to_string())).unwrap();
        manager.create_session(Some("connected".to_string())).unwrap();
        let in_use = |id: &str| id == "connected";

        assert_eq!(manager.cleanup_idle_sessions(Duration::hours(1), in_use), 0);
        assert_eq!(manager.cleanup_idle_sessions(Duration::milliseconds(-1), in_use), 1);
        assert_eq!(manager.active_session_count(), 1);
        assert!(manager.get_session("connected").is_some());
    }
}
