//! Import jobs: fetch, normalize and stage a source, then build and swap in
//! a new generation.

pub mod job;
pub mod orchestrator;
pub mod pipeline;
pub mod staging;

pub use job::{ImportJob, ImportStatus, JobCheckpoint, JobId, JobState, JobStore};
pub use orchestrator::ImportOrchestrator;
pub use pipeline::PipelineOptions;
