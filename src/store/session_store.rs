use std::{sync::Arc, time::Duration};

use chrono::Utc;
use rand::Rng;
use uuid::Uuid;

use crate::{
    db::{
        CompletionRecord, Database, DbThrottle, Interaction, ProcessingStatus, QualityMetrics,
        Screenshot, Session, SessionStatus, TrainingExample,
    },
    error::{PipelineError, Result},
    settings::PipelineSettings,
};
use crate::{log_debug, log_info, log_warn};

const ENABLE_LOGS: bool = true;

/// Bounds for the optimistic-lock loop in [`SessionStore::append_interaction`].
#[derive(Debug, Clone, Copy)]
pub struct AppendPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl AppendPolicy {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            max_attempts: settings.append_max_attempts.max(1),
            min_delay: Duration::from_millis(settings.append_retry_min_delay_ms),
            max_delay: Duration::from_millis(
                settings
                    .append_retry_max_delay_ms
                    .max(settings.append_retry_min_delay_ms),
            ),
        }
    }

    fn jitter(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Sole writer of persisted session fields.
///
/// Every database call goes through the shared [`DbThrottle`].
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
    throttle: Arc<DbThrottle>,
    append_policy: AppendPolicy,
}

impl SessionStore {
    pub fn new(db: Database, throttle: Arc<DbThrottle>, append_policy: AppendPolicy) -> Self {
        Self {
            db,
            throttle,
            append_policy,
        }
    }

    pub fn throttle(&self) -> &Arc<DbThrottle> {
        &self.throttle
    }

    pub async fn create_session(&self, session_id: Option<String>) -> Result<Session> {
        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Session::new(id, Utc::now());
        self.throttle
            .execute(|| self.db.insert_session(&session))
            .await?;
        log_info!("session {} started", session.id);
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.throttle
            .execute(|| self.db.get_session(session_id))
            .await?
            .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))
    }

    /// Append one interaction with a read-modify-conditional-write cycle.
    ///
    /// The write only lands if the stored version is still the one that was
    /// read; on a mismatch the whole cycle is repeated after a short random
    /// delay, up to `max_attempts` times. Returns the new version.
    pub async fn append_interaction(
        &self,
        session_id: &str,
        interaction: Interaction,
    ) -> Result<u64> {
        let policy = self.append_policy;

        for attempt in 1..=policy.max_attempts {
            let snapshot = self
                .throttle
                .execute(|| self.db.get_interaction_log(session_id))
                .await?
                .ok_or_else(|| PipelineError::SessionNotFound(session_id.to_string()))?;

            if snapshot.status != SessionStatus::Active {
                return Err(PipelineError::SessionNotActive {
                    session_id: session_id.to_string(),
                    status: snapshot.status.as_str().to_string(),
                });
            }

            let read_version = snapshot.version;
            let mut log = snapshot.interaction_log;
            log.push(interaction.clone());

            let applied = self
                .throttle
                .execute(|| {
                    self.db
                        .compare_and_set_interaction_log(session_id, read_version, log, Utc::now())
                })
                .await?;

            if applied {
                return Ok(read_version + 1);
            }

            log_debug!(
                "version conflict appending to session {} (read v{}, attempt {}/{})",
                session_id,
                read_version,
                attempt,
                policy.max_attempts
            );

            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.jitter()).await;
            }
        }

        log_warn!(
            "giving up on append to session {} after {} conflicting attempts",
            session_id,
            policy.max_attempts
        );
        Err(PipelineError::ConcurrencyConflict {
            session_id: session_id.to_string(),
            attempts: policy.max_attempts,
        })
    }

    /// Plain keyed update; only one pipeline run drives a session at a time.
    pub async fn update_processing_status(
        &self,
        session_id: &str,
        status: ProcessingStatus,
    ) -> Result<()> {
        let updated = self
            .throttle
            .execute(|| self.db.update_processing_status(session_id, status, Utc::now()))
            .await?;
        if !updated {
            return Err(PipelineError::SessionNotFound(session_id.to_string()));
        }
        log_debug!("session {} -> {}", session_id, status.as_str());
        Ok(())
    }

    /// Handle the client's completion signal: `ACTIVE -> PROCESSING`.
    pub async fn begin_processing(&self, session_id: &str) -> Result<()> {
        let updated = self
            .throttle
            .execute(|| self.db.begin_processing(session_id, Utc::now()))
            .await?;
        if updated {
            return Ok(());
        }

        let session = self.get_session(session_id).await?;
        Err(PipelineError::SessionNotActive {
            session_id: session_id.to_string(),
            status: session.status.as_str().to_string(),
        })
    }

    /// Returns `false` when quality had already been recorded.
    pub async fn record_quality(&self, session_id: &str, quality: QualityMetrics) -> Result<bool> {
        let written = self
            .throttle
            .execute(|| self.db.record_quality(session_id, quality, Utc::now()))
            .await?;
        Ok(written)
    }

    pub async fn mark_failed(&self, session_id: &str) -> Result<()> {
        self.throttle
            .execute(|| self.db.mark_session_failed(session_id, Utc::now()))
            .await?;
        Ok(())
    }

    pub async fn commit_completion(&self, session_id: &str, record: CompletionRecord) -> Result<()> {
        let updated = self
            .throttle
            .execute(|| self.db.commit_completion(session_id, record, Utc::now()))
            .await?;
        if !updated {
            return Err(PipelineError::SessionNotFound(session_id.to_string()));
        }
        Ok(())
    }

    pub async fn replace_training_examples(
        &self,
        session_id: &str,
        examples: &[TrainingExample],
    ) -> Result<()> {
        self.throttle
            .execute(|| self.db.replace_training_examples(session_id, examples))
            .await?;
        Ok(())
    }

    pub async fn training_examples(&self, session_id: &str) -> Result<Vec<TrainingExample>> {
        let examples = self
            .throttle
            .execute(|| self.db.get_training_examples(session_id))
            .await?;
        Ok(examples)
    }

    pub async fn record_screenshot(&self, screenshot: &Screenshot) -> Result<()> {
        // Surface a missing session as such rather than as a foreign-key error.
        self.get_session(&screenshot.session_id).await?;
        self.throttle
            .execute(|| self.db.insert_screenshot(screenshot))
            .await?;
        Ok(())
    }

    pub async fn screenshots(&self, session_id: &str) -> Result<Vec<Screenshot>> {
        let screenshots = self
            .throttle
            .execute(|| self.db.get_screenshots_for_session(session_id))
            .await?;
        Ok(screenshots)
    }

    pub async fn sessions_awaiting_pipeline(&self) -> Result<Vec<String>> {
        let ids = self
            .throttle
            .execute(|| self.db.list_sessions_awaiting_pipeline())
            .await?;
        Ok(ids)
    }
}
