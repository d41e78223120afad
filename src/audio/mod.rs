//! # Audio Module
//!
//! Everything that touches raw audio bytes on the server side.
//!
//! ## Key Components:
//! - **Codec**: pure transforms (resample, channel conversion, chunking, normalization)
//! - **Format**: audio format descriptions and validation errors
//! - **Processor**: chunk validation and recognition/playback staging
//! - **Buffer**: per-session chunk accumulation with a single-flight guard
//! - **Session**: voice session records and the session manager
//!
//! ## Audio Format Requirements:
//! - **Recognition**: 16kHz, 16-bit PCM, mono, little-endian
//! - **Capture**: declared per session, 16-bit PCM with one or two channels

pub mod buffer;
pub mod codec;
pub mod format;
pub mod processor;
pub mod session;
