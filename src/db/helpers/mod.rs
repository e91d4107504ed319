use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::db::models::{ExampleShape, ProcessingStatus, SessionStatus};

/// SQLite integers are signed; counters and versions are stored as `u64`.
pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    value.map(|raw| parse_datetime(&raw, field)).transpose()
}

pub fn parse_status(value: &str) -> Result<SessionStatus> {
    match value {
        "ACTIVE" => Ok(SessionStatus::Active),
        "PROCESSING" => Ok(SessionStatus::Processing),
        "COMPLETED" => Ok(SessionStatus::Completed),
        "FAILED" => Ok(SessionStatus::Failed),
        other => Err(anyhow!("unknown session status {other}")),
    }
}

pub fn parse_processing_status(value: &str) -> Result<ProcessingStatus> {
    match value {
        "PENDING" => Ok(ProcessingStatus::Pending),
        "VALIDATING" => Ok(ProcessingStatus::Validating),
        "ENHANCING" => Ok(ProcessingStatus::Enhancing),
        "TRAINING" => Ok(ProcessingStatus::Training),
        "ARCHIVING" => Ok(ProcessingStatus::Archiving),
        "COMPLETED" => Ok(ProcessingStatus::Completed),
        "FAILED" => Ok(ProcessingStatus::Failed),
        other => Err(anyhow!("unknown processing status {other}")),
    }
}

pub fn parse_example_shape(value: &str) -> Result<ExampleShape> {
    match value {
        "examples" => Ok(ExampleShape::Examples),
        "messages" => Ok(ExampleShape::Messages),
        other => Err(anyhow!("unknown training example shape {other}")),
    }
}
