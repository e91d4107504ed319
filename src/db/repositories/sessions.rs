use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{
        parse_datetime, parse_optional_datetime, parse_processing_status, parse_status, to_i64,
        to_u64,
    },
    models::{
        CompletionRecord, Interaction, InteractionLogSnapshot, ProcessingStatus, QualityMetrics,
        Session, SessionStatus,
    },
};

const SESSION_COLUMNS: &str = "id, status, processing_status, interaction_log, interaction_count, version,
     quality_score, completeness, reliability, training_value, archive_ref,
     created_at, updated_at, completed_at";

fn parse_log(raw: &str) -> Result<Vec<Interaction>> {
    serde_json::from_str(raw).context("failed to decode interaction_log")
}

fn row_to_session(row: &Row) -> Result<Session> {
    let status: String = row.get("status")?;
    let processing_status: String = row.get("processing_status")?;
    let interaction_log: String = row.get("interaction_log")?;
    let interaction_count: i64 = row.get("interaction_count")?;
    let version: i64 = row.get("version")?;
    let quality_score: Option<f64> = row.get("quality_score")?;
    let completeness: Option<f64> = row.get("completeness")?;
    let reliability: Option<f64> = row.get("reliability")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;

    let quality = match (quality_score, completeness, reliability) {
        (Some(quality_score), Some(completeness), Some(reliability)) => Some(QualityMetrics {
            quality_score,
            completeness,
            reliability,
        }),
        _ => None,
    };

    Ok(Session {
        id: row.get("id")?,
        status: parse_status(&status)?,
        processing_status: parse_processing_status(&processing_status)?,
        interaction_log: parse_log(&interaction_log)?,
        interaction_count: to_u64(interaction_count, "interaction_count")?,
        version: to_u64(version, "version")?,
        quality,
        training_value: row.get("training_value")?,
        archive_ref: row.get("archive_ref")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
        completed_at: parse_optional_datetime(completed_at, "completed_at")?,
    })
}

impl Database {
    pub async fn insert_session(&self, session: &Session) -> Result<()> {
        let record = session.clone();
        self.execute(move |conn| {
            let log = serde_json::to_string(&record.interaction_log)?;
            conn.execute(
                "INSERT INTO sessions (id, status, processing_status, interaction_log, interaction_count, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.id,
                    record.status.as_str(),
                    record.processing_status.as_str(),
                    log,
                    to_i64(record.interaction_count)?,
                    to_i64(record.version)?,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                ],
            )
            .with_context(|| format!("failed to insert session {}", record.id))?;
            Ok(())
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"
            ))?;

            let mut rows = stmt.query(params![session_id])?;
            let session = match rows.next()? {
                Some(row) => Some(row_to_session(row)?),
                None => None,
            };
            Ok(session)
        })
        .await
    }

    pub async fn get_interaction_log(
        &self,
        session_id: &str,
    ) -> Result<Option<InteractionLogSnapshot>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT status, version, interaction_log FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((status, version, log)) = raw else {
                return Ok(None);
            };

            Ok(Some(InteractionLogSnapshot {
                status: parse_status(&status)?,
                version: to_u64(version, "version")?,
                interaction_log: parse_log(&log)?,
            }))
        })
        .await
    }

    /// Writes `log` only if the stored version still equals `expected_version`
    /// and the session is still accepting interactions. Returns whether the
    /// row was updated.
    pub async fn compare_and_set_interaction_log(
        &self,
        session_id: &str,
        expected_version: u64,
        log: Vec<Interaction>,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let encoded = serde_json::to_string(&log)?;
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET interaction_log = ?1,
                     interaction_count = ?2,
                     version = ?3,
                     updated_at = ?4
                 WHERE id = ?5 AND version = ?6 AND status = ?7",
                params![
                    encoded,
                    to_i64(log.len() as u64)?,
                    to_i64(expected_version + 1)?,
                    updated_at.to_rfc3339(),
                    session_id,
                    to_i64(expected_version)?,
                    SessionStatus::Active.as_str(),
                ],
            )?;
            Ok(rows_affected == 1)
        })
        .await
    }

    pub async fn update_processing_status(
        &self,
        session_id: &str,
        status: ProcessingStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET processing_status = ?1,
                     updated_at = ?2
                 WHERE id = ?3",
                params![status.as_str(), updated_at.to_rfc3339(), session_id],
            )?;
            Ok(rows_affected > 0)
        })
        .await
    }

    /// Moves an `ACTIVE` session to `PROCESSING`. A session already in
    /// `PROCESSING` is accepted unchanged so completion can be re-triggered.
    pub async fn begin_processing(
        &self,
        session_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     updated_at = ?2
                 WHERE id = ?3 AND status IN (?4, ?1)",
                params![
                    SessionStatus::Processing.as_str(),
                    updated_at.to_rfc3339(),
                    session_id,
                    SessionStatus::Active.as_str(),
                ],
            )?;
            Ok(rows_affected > 0)
        })
        .await
    }

    /// Quality fields are write-once; a second call leaves the first values.
    pub async fn record_quality(
        &self,
        session_id: &str,
        quality: QualityMetrics,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET quality_score = ?1,
                     completeness = ?2,
                     reliability = ?3,
                     updated_at = ?4
                 WHERE id = ?5 AND quality_score IS NULL",
                params![
                    quality.quality_score,
                    quality.completeness,
                    quality.reliability,
                    updated_at.to_rfc3339(),
                    session_id,
                ],
            )?;
            Ok(rows_affected > 0)
        })
        .await
    }

    pub async fn mark_session_failed(
        &self,
        session_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     processing_status = ?2,
                     updated_at = ?3
                 WHERE id = ?4",
                params![
                    SessionStatus::Failed.as_str(),
                    ProcessingStatus::Failed.as_str(),
                    updated_at.to_rfc3339(),
                    session_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn commit_completion(
        &self,
        session_id: &str,
        record: CompletionRecord,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let quality = record.quality;
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET status = ?1,
                     processing_status = ?2,
                     quality_score = COALESCE(quality_score, ?3),
                     completeness = COALESCE(completeness, ?4),
                     reliability = COALESCE(reliability, ?5),
                     training_value = ?6,
                     archive_ref = ?7,
                     completed_at = ?8,
                     updated_at = ?8
                 WHERE id = ?9",
                params![
                    SessionStatus::Completed.as_str(),
                    ProcessingStatus::Completed.as_str(),
                    quality.map(|q| q.quality_score),
                    quality.map(|q| q.completeness),
                    quality.map(|q| q.reliability),
                    record.training_value,
                    record.archive_ref,
                    completed_at.to_rfc3339(),
                    session_id,
                ],
            )?;
            Ok(rows_affected > 0)
        })
        .await
    }

    /// Sessions whose completion was signalled but whose pipeline never
    /// reached a terminal stage.
    pub async fn list_sessions_awaiting_pipeline(&self) -> Result<Vec<String>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions
                 WHERE status = ?1 AND processing_status NOT IN (?2, ?3)
                 ORDER BY updated_at ASC",
            )?;

            let mut rows = stmt.query(params![
                SessionStatus::Processing.as_str(),
                ProcessingStatus::Completed.as_str(),
                ProcessingStatus::Failed.as_str(),
            ])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                ids.push(row.get(0)?);
            }

            Ok(ids)
        })
        .await
    }
}
