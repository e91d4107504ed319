//! Error taxonomy for the job pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::pipeline::Stage;

/// Errors surfaced by the session store, the stage driver and job handlers.
///
/// The scheduler decides retry versus terminal failure from
/// [`PipelineError::is_retryable`]; nothing below it retries on its own
/// except the store's bounded optimistic-lock loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {session_id} is {status}, expected ACTIVE")]
    SessionNotActive { session_id: String, status: String },

    /// Version mismatch persisted across every append attempt.
    #[error("concurrent update conflict on session {session_id} after {attempts} attempts")]
    ConcurrencyConflict { session_id: String, attempts: u32 },

    #[error("session {session_id} failed validation: score {score:.1} below floor {floor:.1}")]
    ValidationFailed {
        session_id: String,
        score: f64,
        floor: f64,
    },

    #[error("training generator returned no examples or messages for session {0}")]
    EmptyTrainingOutput(String),

    #[error("{stage} stage timed out after {}ms", .after.as_millis())]
    StageTimeout { stage: Stage, after: Duration },

    #[error("{stage} stage failed: {source:#}")]
    Collaborator {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("job handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("batched {kind} operation panicked: {message}")]
    OperationPanicked { kind: String, message: String },

    #[error("pipeline is shutting down")]
    Shutdown,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    /// Whether the scheduler should requeue the job after a backoff.
    ///
    /// Structural problems (invalid session data, unknown or closed
    /// sessions) will not fix themselves on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::ValidationFailed { .. }
                | PipelineError::SessionNotFound(_)
                | PipelineError::SessionNotActive { .. }
                | PipelineError::Shutdown
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
