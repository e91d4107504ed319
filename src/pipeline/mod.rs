//! Session pipeline: the ordered stages a completed session goes through,
//! the collaborator contracts each stage calls out to, and the job handler
//! that routes scheduled jobs onto the store and the stage driver.

mod collaborators;
mod driver;
mod handler;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::db::{ExampleShape, QualityMetrics};

pub use collaborators::{
    ArchiveReceipt, Archiver, Collaborators, ContextEnhancer, QualityAssessment, QualityControl,
    TrainingGenerator, TrainingOutput, ValidationMetrics, ValidationReport, Validator,
};
pub use driver::{DriverConfig, StageDriver, TrainingRun};
pub use handler::PipelineJobHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Validation,
    Quality,
    Enhancement,
    Training,
    Archiving,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Quality => "quality",
            Stage::Enhancement => "enhancement",
            Stage::Training => "training",
            Stage::Archiving => "archiving",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a full stage run, reported to subscribers of the
/// `session_complete` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub session_id: String,
    pub validation_score: f64,
    pub quality: QualityMetrics,
    pub training_examples: usize,
    pub training_shape: ExampleShape,
    pub training_value: Option<f64>,
    pub archive_ref: Option<String>,
}
