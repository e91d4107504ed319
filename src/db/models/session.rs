//! Session-related data models.
//!
//! A session is the aggregate of one recording: its coarse lifecycle, the
//! pipeline stage it is in, the embedded interaction log and the quality
//! metrics written once by the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Interaction;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Processing,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "ACTIVE",
            SessionStatus::Processing => "PROCESSING",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }
}

/// Fine-grained pipeline stage, advanced by the stage driver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Validating,
    Enhancing,
    Training,
    Archiving,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "PENDING",
            ProcessingStatus::Validating => "VALIDATING",
            ProcessingStatus::Enhancing => "ENHANCING",
            ProcessingStatus::Training => "TRAINING",
            ProcessingStatus::Archiving => "ARCHIVING",
            ProcessingStatus::Completed => "COMPLETED",
            ProcessingStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QualityMetrics {
    pub quality_score: f64,
    pub completeness: f64,
    pub reliability: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub processing_status: ProcessingStatus,
    pub interaction_log: Vec<Interaction>,
    pub interaction_count: u64,
    pub version: u64,
    pub quality: Option<QualityMetrics>,
    pub training_value: Option<f64>,
    pub archive_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: SessionStatus::Active,
            processing_status: ProcessingStatus::Pending,
            interaction_log: Vec::new(),
            interaction_count: 0,
            version: 0,
            quality: None,
            training_value: None,
            archive_ref: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// The fields a read-modify-write append needs, without the quality columns.
#[derive(Debug, Clone)]
pub struct InteractionLogSnapshot {
    pub status: SessionStatus,
    pub version: u64,
    pub interaction_log: Vec<Interaction>,
}

/// Values committed together with the final `COMPLETED` transition.
#[derive(Debug, Clone, Default)]
pub struct CompletionRecord {
    pub quality: Option<QualityMetrics>,
    pub training_value: Option<f64>,
    pub archive_ref: Option<String>,
}
