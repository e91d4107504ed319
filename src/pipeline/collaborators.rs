use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{ExampleShape, QualityMetrics, Session, TrainingExample};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationMetrics {
    pub completeness_score: f64,
    pub reliability_score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub overall_score: f64,
    pub errors: Vec<String>,
    pub metrics: ValidationMetrics,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualityAssessment {
    pub overall_score: f64,
    pub completeness_score: f64,
    pub reliability_score: f64,
}

impl From<QualityAssessment> for QualityMetrics {
    fn from(assessment: QualityAssessment) -> Self {
        QualityMetrics {
            quality_score: assessment.overall_score,
            completeness: assessment.completeness_score,
            reliability: assessment.reliability_score,
        }
    }
}

/// Generator output. Current generators fill `examples`; older ones emit
/// the same items under `messages`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrainingOutput {
    pub examples: Option<Vec<Value>>,
    pub messages: Option<Vec<Value>>,
    pub training_value: Option<f64>,
}

impl TrainingOutput {
    /// Pick the populated shape, preferring `examples`. `None` when both
    /// are missing or empty.
    pub fn into_examples(self) -> Option<(ExampleShape, Vec<TrainingExample>)> {
        let (shape, items) = match (self.examples, self.messages) {
            (Some(examples), _) if !examples.is_empty() => (ExampleShape::Examples, examples),
            (_, Some(messages)) if !messages.is_empty() => (ExampleShape::Messages, messages),
            _ => return None,
        };

        let examples = items
            .into_iter()
            .zip(0u32..)
            .map(|(payload, position)| TrainingExample {
                position,
                shape,
                payload,
            })
            .collect();
        Some((shape, examples))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReceipt {
    pub archive_ref: String,
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate_session(&self, session_id: &str) -> Result<ValidationReport>;
}

#[async_trait]
pub trait QualityControl: Send + Sync {
    async fn assess_session(&self, session_id: &str) -> Result<QualityAssessment>;
}

#[async_trait]
pub trait ContextEnhancer: Send + Sync {
    /// The enrichment record is only logged.
    async fn enhance_session_context(&self, session_id: &str) -> Result<Value>;
}

#[async_trait]
pub trait TrainingGenerator: Send + Sync {
    async fn generate_training_data(&self, session: &Session) -> Result<TrainingOutput>;
}

#[async_trait]
pub trait Archiver: Send + Sync {
    async fn create_session_archive(&self, session_id: &str) -> Result<ArchiveReceipt>;
}

/// The external services the stage driver calls. Without an archiver the
/// archiving stage is skipped.
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn Validator>,
    pub quality: Arc<dyn QualityControl>,
    pub enhancer: Arc<dyn ContextEnhancer>,
    pub trainer: Arc<dyn TrainingGenerator>,
    pub archiver: Option<Arc<dyn Archiver>>,
}

impl Collaborators {
    pub fn new(
        validator: Arc<dyn Validator>,
        quality: Arc<dyn QualityControl>,
        enhancer: Arc<dyn ContextEnhancer>,
        trainer: Arc<dyn TrainingGenerator>,
    ) -> Self {
        Self {
            validator,
            quality,
            enhancer,
            trainer,
            archiver: None,
        }
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }
}
