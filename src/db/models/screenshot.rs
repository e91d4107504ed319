use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata for a captured screenshot; the image itself lives in blob storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Screenshot {
    pub id: String,
    pub session_id: String,
    pub captured_at: DateTime<Utc>,
    pub blob_ref: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}
