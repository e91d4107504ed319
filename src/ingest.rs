//! Front door for the recording client: every inbound event either goes
//! through the operation batcher to the session store, or becomes a job.

use crate::db::{Interaction, OperationBatcher, OperationKind, Screenshot, Session};
use crate::error::Result;
use crate::jobs::{Job, JobPayload, Scheduler};
use crate::store::SessionStore;
use crate::{log_debug, log_info};

const ENABLE_LOGS: bool = true;

#[derive(Clone)]
pub struct SessionIngestor {
    store: SessionStore,
    batcher: OperationBatcher,
    scheduler: Scheduler,
    max_retries: u32,
}

impl SessionIngestor {
    pub fn new(
        store: SessionStore,
        batcher: OperationBatcher,
        scheduler: Scheduler,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            batcher,
            scheduler,
            max_retries,
        }
    }

    pub async fn start_session(&self, session_id: Option<String>) -> Result<Session> {
        self.store.create_session(session_id).await
    }

    pub async fn session(&self, session_id: &str) -> Result<Session> {
        let store = self.store.clone();
        let session_id = session_id.to_string();
        self.batcher
            .enqueue(OperationKind::Read, move || async move {
                store.get_session(&session_id).await
            })
            .await
    }

    /// Append through the batcher and return the session's new version.
    /// Appends to one session land in the order they were recorded. A
    /// navigation or form submit also queues an interim quality check.
    pub async fn record_interaction(
        &self,
        session_id: &str,
        interaction: Interaction,
    ) -> Result<u64> {
        let high_value = interaction.is_high_value();
        let store = self.store.clone();
        let owned_id = session_id.to_string();
        let version = self
            .batcher
            .enqueue_ordered(OperationKind::AppendInteraction, session_id, move || async move {
                store.append_interaction(&owned_id, interaction).await
            })
            .await?;

        if high_value {
            let job_id = self.submit(session_id, JobPayload::QualityCheck);
            log_debug!(
                "high-value interaction on session {} queued quality check {}",
                session_id,
                job_id
            );
        }
        Ok(version)
    }

    /// Defer the append to an `interaction` job so that an exhausted
    /// optimistic-lock loop gets the scheduler's retries.
    pub fn enqueue_interaction(&self, session_id: &str, interaction: Interaction) -> String {
        self.submit(session_id, JobPayload::Interaction { interaction })
    }

    pub async fn record_screenshot(&self, screenshot: Screenshot) -> Result<()> {
        let store = self.store.clone();
        self.batcher
            .enqueue(OperationKind::ScreenshotRecord, move || async move {
                store.record_screenshot(&screenshot).await
            })
            .await
    }

    pub fn enqueue_screenshot(&self, screenshot: Screenshot) -> String {
        let session_id = screenshot.session_id.clone();
        self.submit(&session_id, JobPayload::Screenshot { screenshot })
    }

    /// Completion signal: move the session to `PROCESSING` once its queued
    /// appends have landed, then queue the pipeline. Returns the
    /// `session_complete` job id; a repeated signal while that job is still
    /// queued, running or waiting to retry gets the same id back.
    pub async fn complete_session(&self, session_id: &str) -> Result<String> {
        let store = self.store.clone();
        let owned_id = session_id.to_string();
        self.batcher
            .enqueue_ordered(OperationKind::StatusUpdate, session_id, move || async move {
                store.begin_processing(&owned_id).await
            })
            .await?;

        let job_id = self.submit(session_id, JobPayload::SessionComplete);
        log_info!(
            "session {} completed by client, pipeline job {}",
            session_id,
            job_id
        );
        Ok(job_id)
    }

    pub fn request_training_data(&self, session_id: &str) -> String {
        self.submit(session_id, JobPayload::TrainingData)
    }

    fn submit(&self, session_id: &str, payload: JobPayload) -> String {
        self.scheduler
            .submit(Job::new(session_id, payload).with_max_retries(self.max_retries))
    }
}
