//! # Session Audio Buffer
//!
//! Ordered accumulation of the audio chunks one session has received, plus
//! the single-flight guard that keeps two processing cycles from consuming
//! the same audio.
//!
//! ## Key Features:
//! - **Claimed windows**: a cycle claims exactly the chunks present when it
//!   starts; chunks arriving during the cycle stay for the next one
//! - **Single-flight**: at most one cycle per buffer, released on every exit
//!   path through `ProcessingGuard`
//! - **Thread safety**: one mutex covers chunks, flag and stats, so appends
//!   and drains never interleave

use crate::audio::codec;
use crate::audio::format::{AudioError, AudioFormat};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// One unit of captured audio as received from the transport.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub data: Vec<u8>,
    pub received_at: DateTime<Utc>,
    pub format: AudioFormat,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, format: AudioFormat) -> Self {
        Self {
            data,
            received_at: Utc::now(),
            format,
        }
    }

    pub fn duration_ms(&self) -> f64 {
        codec::get_duration(&self.data, self.format.sample_rate, self.format.channels)
    }
}

/// Rolling statistics over every chunk accepted by a buffer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BufferStats {
    pub chunk_count: u64,
    pub total_bytes: u64,
    pub total_duration_ms: f64,
    pub average_chunk_bytes: f64,
    pub rejected_chunks: u64,
}

#[derive(Debug, Default)]
struct BufferState {
    chunks: VecDeque<AudioChunk>,
    /// Number of leading chunks claimed by the running cycle
    claimed: usize,
    processing: bool,
    stats: BufferStats,
}

impl BufferState {
    fn pending_duration_ms(&self) -> f64 {
        self.chunks.iter().skip(self.claimed).map(AudioChunk::duration_ms).sum()
    }
}

/// Per-session audio accumulation with a single-flight processing flag.
#[derive(Debug, Default)]
pub struct SessionAudioBuffer {
    state: Mutex<BufferState>,
}

impl SessionAudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        // State stays consistent even if a holder panicked mid-update
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a validated chunk and update the rolling statistics.
    ///
    /// ## Returns:
    /// Pending (unclaimed) duration after the append, in milliseconds.
    ///
    /// ## Errors:
    /// `BufferFull` when accepting the chunk would take the unclaimed audio
    /// past `limit_ms`.
    pub fn append(&self, chunk: AudioChunk, limit_ms: f64) -> Result<f64, AudioError> {
        let mut state = self.lock();

        let pending = state.pending_duration_ms();
        let duration = chunk.duration_ms();
        if pending + duration > limit_ms {
            state.stats.rejected_chunks += 1;
            return Err(AudioError::BufferFull {
                pending_ms: pending,
                limit_ms,
            });
        }

        let stats = &mut state.stats;
        stats.chunk_count += 1;
        stats.total_bytes += chunk.data.len() as u64;
        stats.total_duration_ms += duration;
        stats.average_chunk_bytes = stats.total_bytes as f64 / stats.chunk_count as f64;

        state.chunks.push_back(chunk);
        Ok(pending + duration)
    }

    /// Count a chunk that failed validation.
    pub fn record_rejection(&self) {
        self.lock().stats.rejected_chunks += 1;
    }

    /// Duration of buffered audio not claimed by a running cycle.
    pub fn total_duration_ms(&self) -> f64 {
        self.lock().pending_duration_ms()
    }

    /// Number of chunks currently held, claimed or not.
    pub fn chunk_count(&self) -> usize {
        self.lock().chunks.len()
    }

    pub fn is_processing(&self) -> bool {
        self.lock().processing
    }

    /// Atomically set the processing flag and claim the buffered chunks.
    ///
    /// Returns false when a cycle is already running; the caller must not
    /// start another one.
    pub fn try_begin_processing(&self) -> bool {
        let mut state = self.lock();
        if state.processing {
            return false;
        }
        state.processing = true;
        state.claimed = state.chunks.len();
        true
    }

    /// Copies of the chunks claimed by the running cycle, oldest first.
    ///
    /// Each chunk keeps the format declared when it arrived; empty when no
    /// cycle is running.
    pub fn claimed_chunks(&self) -> Vec<AudioChunk> {
        let state = self.lock();
        if !state.processing {
            return Vec::new();
        }
        state.chunks.iter().take(state.claimed).cloned().collect()
    }

    /// Remove the claimed window, clear the flag and return the merged window.
    ///
    /// Chunks appended while the cycle ran are left in place.
    pub fn drain_and_end_processing(&self) -> Vec<u8> {
        let mut state = self.lock();
        let claimed = state.claimed.min(state.chunks.len());
        let drained: Vec<AudioChunk> = state.chunks.drain(..claimed).collect();
        state.claimed = 0;
        state.processing = false;
        codec::merge_chunks(&drained.iter().map(|c| c.data.as_slice()).collect::<Vec<_>>())
    }

    /// Drop every buffered chunk.
    ///
    /// A running cycle keeps its flag; its guard releases it when it ends.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.chunks.clear();
        state.claimed = 0;
    }

    pub fn stats(&self) -> BufferStats {
        self.lock().stats.clone()
    }

    /// Claim the buffer for one processing cycle.
    ///
    /// The returned guard drains the claimed window and clears the flag when
    /// it is finished or dropped, whichever comes first.
    pub fn begin_processing(self: &Arc<Self>) -> Option<ProcessingGuard> {
        if self.try_begin_processing() {
            Some(ProcessingGuard {
                buffer: Arc::clone(self),
                released: false,
            })
        } else {
            None
        }
    }
}

/// Ownership of one processing cycle over a session buffer.
#[derive(Debug)]
pub struct ProcessingGuard {
    buffer: Arc<SessionAudioBuffer>,
    released: bool,
}

impl ProcessingGuard {
    /// The audio this cycle is responsible for.
    pub fn window(&self) -> Vec<AudioChunk> {
        self.buffer.claimed_chunks()
    }

    /// Drain the claimed window and release the flag.
    pub fn finish(mut self) -> Vec<u8> {
        self.released = true;
        self.buffer.drain_and_end_processing()
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        if !self.released {
            self.buffer.drain_and_end_processing();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_ms(duration_ms: u32, fill: u8) -> AudioChunk {
        let bytes = 16000 * duration_ms as usize / 1000 * 2;
        let data = (0..bytes).map(|i| fill.wrapping_add((i % 17) as u8)).collect();
        AudioChunk::new(data, AudioFormat::recognition())
    }

    #[test]
    fn test_append_tracks_duration_and_stats() {
        let buffer = SessionAudioBuffer::new();
        assert_eq!(buffer.append(chunk_ms(200, 0), 30_000.0).unwrap(), 200.0);
        assert_eq!(buffer.append(chunk_ms(100, 0), 30_000.0).unwrap(), 300.0);

        let stats = buffer.stats();
        assert_eq!(stats.chunk_count, 2);
        assert_eq!(stats.total_duration_ms, 300.0);
        assert_eq!(stats.average_chunk_bytes, 4800.0);
        assert_eq!(buffer.total_duration_ms(), 300.0);
    }

    #[test]
    fn test_append_rejects_when_full() {
        let buffer = SessionAudioBuffer::new();
        buffer.append(chunk_ms(500, 0), 500.0).unwrap();
        assert!(matches!(
            buffer.append(chunk_ms(100, 0), 500.0),
            Err(AudioError::BufferFull { .. })
        ));
        assert_eq!(buffer.stats().rejected_chunks, 1);
    }

    #[test]
    fn test_append_never_overshoots_the_cap() {
        let buffer = SessionAudioBuffer::new();
        buffer.append(chunk_ms(200, 0), 300.0).unwrap();

        // 200 + 200 would pass 300 even though 200 alone is under it
        assert!(matches!(
            buffer.append(chunk_ms(200, 0), 300.0),
            Err(AudioError::BufferFull { pending_ms, .. }) if pending_ms == 200.0
        ));
        assert_eq!(buffer.append(chunk_ms(100, 0), 300.0).unwrap(), 300.0);
        assert_eq!(buffer.total_duration_ms(), 300.0);
    }

    #[test]
    fn test_try_begin_processing_is_single_flight() {
        let buffer = SessionAudioBuffer::new();
        buffer.append(chunk_ms(200, 0), 30_000.0).unwrap();

        assert!(buffer.try_begin_processing());
        assert!(!buffer.try_begin_processing());
        assert!(buffer.is_processing());

        buffer.drain_and_end_processing();
        assert!(!buffer.is_processing());
        assert!(buffer.try_begin_processing());
    }

    #[test]
    fn test_chunks_appended_during_cycle_survive_drain() {
        let buffer = SessionAudioBuffer::new();
        let first = chunk_ms(200, 1);
        let second = chunk_ms(200, 2);
        let late = chunk_ms(100, 3);
        let late_data = late.data.clone();

        buffer.append(first.clone(), 30_000.0).unwrap();
        buffer.append(second.clone(), 30_000.0).unwrap();
        assert!(buffer.try_begin_processing());

        // arrives while the cycle runs, not part of its window
        buffer.append(late, 30_000.0).unwrap();
        assert_eq!(buffer.total_duration_ms(), 100.0);

        let window: Vec<Vec<u8>> = buffer.claimed_chunks().into_iter().map(|c| c.data).collect();
        assert_eq!(window, vec![first.data.clone(), second.data.clone()]);

        let drained = buffer.drain_and_end_processing();
        assert_eq!(drained, codec::merge_chunks(&[&first.data, &second.data]));
        assert_eq!(buffer.chunk_count(), 1);
        assert_eq!(buffer.total_duration_ms(), 100.0);

        assert!(buffer.try_begin_processing());
        let next = buffer.claimed_chunks();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].data, late_data);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let buffer = Arc::new(SessionAudioBuffer::new());
        buffer.append(chunk_ms(200, 0), 30_000.0).unwrap();

        {
            let guard = buffer.begin_processing().unwrap();
            assert_eq!(guard.window().len(), 1);
            assert!(buffer.begin_processing().is_none());
        }

        assert!(!buffer.is_processing());
        assert_eq!(buffer.chunk_count(), 0);
    }

    #[test]
    fn test_clear_keeps_running_cycle_flag() {
        let buffer = Arc::new(SessionAudioBuffer::new());
        buffer.append(chunk_ms(200, 0), 30_000.0).unwrap();

        let guard = buffer.begin_processing().unwrap();
        buffer.clear();
        assert_eq!(buffer.chunk_count(), 0);
        assert!(buffer.is_processing());

        assert!(guard.finish().is_empty());
        assert!(!buffer.is_processing());
    }
}
