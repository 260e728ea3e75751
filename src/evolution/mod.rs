//! Evolution pipeline: promote a completed project's artifacts from the
//! phase output directories through the test environment into production.

pub mod environment;
pub mod pipeline;
pub mod record;

pub use environment::Environment;
pub use pipeline::{EvolutionPipeline, PipelineStatus};
pub use record::{PromotionRecord, PromotionStage, PromotionStore, StageName, StageOutcome};
