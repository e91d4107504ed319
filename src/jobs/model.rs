use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{Interaction, QualityMetrics, Screenshot};
use crate::pipeline::PipelineSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Interaction,
    Screenshot,
    SessionComplete,
    QualityCheck,
    TrainingData,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Interaction => "interaction",
            JobType::Screenshot => "screenshot",
            JobType::SessionComplete => "session_complete",
            JobType::QualityCheck => "quality_check",
            JobType::TrainingData => "training_data",
        }
    }

    /// Lower runs first.
    pub fn default_priority(&self) -> u32 {
        match self {
            JobType::SessionComplete => 1,
            JobType::Interaction => 2,
            JobType::QualityCheck => 3,
            JobType::TrainingData => 4,
            JobType::Screenshot => 5,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Stage-specific parameters carried alongside the session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Interaction { interaction: Interaction },
    Screenshot { screenshot: Screenshot },
    SessionComplete,
    QualityCheck,
    TrainingData,
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Interaction { .. } => JobType::Interaction,
            JobPayload::Screenshot { .. } => JobType::Screenshot,
            JobPayload::SessionComplete => JobType::SessionComplete,
            JobPayload::QualityCheck => JobType::QualityCheck,
            JobPayload::TrainingData => JobType::TrainingData,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub session_id: String,
    pub payload: JobPayload,
    pub priority: u32,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(session_id: impl Into<String>, payload: JobPayload) -> Self {
        let now = Utc::now();
        let priority = payload.job_type().default_priority();
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            payload,
            priority,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn job_type(&self) -> JobType {
        self.payload.job_type()
    }

    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub(crate) fn set_status(&mut self, status: JobStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// What a successful handler run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutput {
    InteractionAppended { version: u64 },
    ScreenshotRecorded { screenshot_id: String },
    SessionCompleted(PipelineSummary),
    /// Interim assessment; not persisted on the session.
    QualityAssessed { quality: QualityMetrics },
    TrainingGenerated { examples: usize },
}
