//! Phase orchestrator: job lifecycle, persisted state and live event stream.

pub mod engine;
pub mod job;
pub mod store;

pub use engine::JobEngine;
pub use job::{FailureReport, JobState, JobStatus, JobSummary, PhaseRecord, ResourceUsage};
pub use store::{JobStore, JobSubscription};
