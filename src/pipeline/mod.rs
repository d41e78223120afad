//! Voice processing pipeline.

pub mod orchestrator;

pub use orchestrator::{PipelineConfig, VoicePipeline};
