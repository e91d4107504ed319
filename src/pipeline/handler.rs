use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::jobs::{Job, JobHandler, JobOutput, JobPayload};
use crate::store::SessionStore;

use super::driver::StageDriver;

/// Routes each job type onto the session store or the stage driver.
pub struct PipelineJobHandler {
    store: SessionStore,
    driver: Arc<StageDriver>,
}

impl PipelineJobHandler {
    pub fn new(store: SessionStore, driver: Arc<StageDriver>) -> Self {
        Self { store, driver }
    }
}

#[async_trait]
impl JobHandler for PipelineJobHandler {
    async fn handle(&self, job: &Job) -> Result<JobOutput> {
        let session_id = job.session_id.as_str();
        match &job.payload {
            JobPayload::Interaction { interaction } => {
                let version = self
                    .store
                    .append_interaction(session_id, interaction.clone())
                    .await?;
                Ok(JobOutput::InteractionAppended { version })
            }
            JobPayload::Screenshot { screenshot } => {
                self.store.record_screenshot(screenshot).await?;
                Ok(JobOutput::ScreenshotRecorded {
                    screenshot_id: screenshot.id.clone(),
                })
            }
            JobPayload::SessionComplete => {
                let summary = self.driver.run(session_id).await?;
                Ok(JobOutput::SessionCompleted(summary))
            }
            JobPayload::QualityCheck => {
                let quality = self.driver.run_quality_check(session_id).await?;
                Ok(JobOutput::QualityAssessed { quality })
            }
            JobPayload::TrainingData => {
                let run = self.driver.run_training(session_id).await?;
                Ok(JobOutput::TrainingGenerated {
                    examples: run.examples,
                })
            }
        }
    }
}
