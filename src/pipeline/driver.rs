use std::{future::Future, time::Duration};

use tokio::time;

use crate::db::{CompletionRecord, ExampleShape, ProcessingStatus, QualityMetrics};
use crate::error::{PipelineError, Result};
use crate::settings::PipelineSettings;
use crate::store::SessionStore;
use crate::{log_debug, log_info, log_warn};

use super::collaborators::Collaborators;
use super::{PipelineSummary, Stage};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub validation_score_floor: f64,
    pub stage_timeout: Duration,
    pub archive_enabled: bool,
}

impl DriverConfig {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            validation_score_floor: settings.validation_score_floor,
            stage_timeout: settings.stage_timeout(),
            archive_enabled: settings.archive_enabled,
        }
    }
}

/// What one training stage run persisted.
#[derive(Debug, Clone, Copy)]
pub struct TrainingRun {
    pub examples: usize,
    pub shape: ExampleShape,
    pub training_value: Option<f64>,
}

/// Sequences a session through validation, quality, enhancement, training
/// and archiving. A failed run is retried by the scheduler from the first
/// stage; every stage's writes are safe to repeat.
pub struct StageDriver {
    store: SessionStore,
    collaborators: Collaborators,
    config: DriverConfig,
}

impl StageDriver {
    pub fn new(store: SessionStore, collaborators: Collaborators, config: DriverConfig) -> Self {
        Self {
            store,
            collaborators,
            config,
        }
    }

    pub async fn run(&self, session_id: &str) -> Result<PipelineSummary> {
        // No-op when the completion signal already moved the session.
        self.store.begin_processing(session_id).await?;

        self.enter(session_id, ProcessingStatus::Validating).await?;
        let report = self
            .call(
                Stage::Validation,
                self.collaborators.validator.validate_session(session_id),
            )
            .await?;

        let floor = self.config.validation_score_floor;
        if report.overall_score < floor {
            self.store.mark_failed(session_id).await?;
            log_warn!(
                "session {} failed validation with score {:.1} (floor {:.1}): {:?}",
                session_id,
                report.overall_score,
                floor,
                report.errors
            );
            return Err(PipelineError::ValidationFailed {
                session_id: session_id.to_string(),
                score: report.overall_score,
                floor,
            });
        }
        if !report.is_valid {
            log_warn!(
                "session {} flagged invalid above the floor (score {:.1}), continuing: {:?}",
                session_id,
                report.overall_score,
                report.errors
            );
        }

        let quality = self.assess_quality(session_id).await?;
        if !self.store.record_quality(session_id, quality).await? {
            log_debug!("quality for session {} already recorded", session_id);
        }

        self.enter(session_id, ProcessingStatus::Enhancing).await?;
        let enrichment = self
            .call(
                Stage::Enhancement,
                self.collaborators.enhancer.enhance_session_context(session_id),
            )
            .await?;
        log_debug!("session {} enrichment: {}", session_id, enrichment);

        self.enter(session_id, ProcessingStatus::Training).await?;
        let training = self.run_training(session_id).await?;

        let archive_ref = match (&self.collaborators.archiver, self.config.archive_enabled) {
            (Some(archiver), true) => {
                self.enter(session_id, ProcessingStatus::Archiving).await?;
                let receipt = self
                    .call(Stage::Archiving, archiver.create_session_archive(session_id))
                    .await?;
                Some(receipt.archive_ref)
            }
            _ => {
                log_debug!("archiving disabled, skipping for session {}", session_id);
                None
            }
        };

        self.store
            .commit_completion(
                session_id,
                CompletionRecord {
                    quality: Some(quality),
                    training_value: training.training_value,
                    archive_ref: archive_ref.clone(),
                },
            )
            .await?;

        log_info!(
            "session {} completed: score {:.1}, {} training examples ({})",
            session_id,
            report.overall_score,
            training.examples,
            training.shape.as_str()
        );

        Ok(PipelineSummary {
            session_id: session_id.to_string(),
            validation_score: report.overall_score,
            quality,
            training_examples: training.examples,
            training_shape: training.shape,
            training_value: training.training_value,
            archive_ref,
        })
    }

    /// Interim assessment for a session still being recorded. Nothing is
    /// written; the pipeline's own quality stage owns the stored metrics.
    pub async fn run_quality_check(&self, session_id: &str) -> Result<QualityMetrics> {
        self.store.get_session(session_id).await?;
        self.assess_quality(session_id).await
    }

    /// Generate and persist training examples, replacing any earlier set.
    pub async fn run_training(&self, session_id: &str) -> Result<TrainingRun> {
        let session = self.store.get_session(session_id).await?;
        let output = self
            .call(
                Stage::Training,
                self.collaborators.trainer.generate_training_data(&session),
            )
            .await?;

        let training_value = output.training_value;
        let Some((shape, examples)) = output.into_examples() else {
            return Err(PipelineError::EmptyTrainingOutput(session_id.to_string()));
        };
        if shape == ExampleShape::Messages {
            log_warn!(
                "training generator used legacy messages output for session {}",
                session_id
            );
        }

        self.store
            .replace_training_examples(session_id, &examples)
            .await?;

        Ok(TrainingRun {
            examples: examples.len(),
            shape,
            training_value,
        })
    }

    async fn assess_quality(&self, session_id: &str) -> Result<QualityMetrics> {
        let assessment = self
            .call(
                Stage::Quality,
                self.collaborators.quality.assess_session(session_id),
            )
            .await?;
        Ok(assessment.into())
    }

    async fn enter(&self, session_id: &str, status: ProcessingStatus) -> Result<()> {
        log_debug!("session {} entering {}", session_id, status.as_str());
        self.store.update_processing_status(session_id, status).await
    }

    /// Bound a collaborator call by the stage deadline.
    async fn call<T, F>(&self, stage: Stage, call: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match time::timeout(self.config.stage_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(PipelineError::Collaborator { stage, source }),
            Err(_) => Err(PipelineError::StageTimeout {
                stage,
                after: self.config.stage_timeout,
            }),
        }
    }
}
