use anyhow::{Context, Result};
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{parse_datetime, to_i64},
    models::Screenshot,
};

impl Database {
    pub async fn insert_screenshot(&self, screenshot: &Screenshot) -> Result<()> {
        let record = screenshot.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO screenshots (id, session_id, captured_at, blob_ref, width, height)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.session_id,
                    record.captured_at.to_rfc3339(),
                    record.blob_ref,
                    record.width.map(|w| to_i64(u64::from(w))).transpose()?,
                    record.height.map(|h| to_i64(u64::from(h))).transpose()?,
                ],
            )
            .with_context(|| format!("failed to insert screenshot {}", record.id))?;
            Ok(())
        })
        .await
    }

    pub async fn get_screenshots_for_session(&self, session_id: &str) -> Result<Vec<Screenshot>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, captured_at, blob_ref, width, height
                 FROM screenshots
                 WHERE session_id = ?1
                 ORDER BY captured_at ASC",
            )?;

            let mut rows = stmt.query(params![session_id])?;
            let mut screenshots = Vec::new();
            while let Some(row) = rows.next()? {
                let captured_at: String = row.get(2)?;
                screenshots.push(Screenshot {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    captured_at: parse_datetime(&captured_at, "captured_at")?,
                    blob_ref: row.get(3)?,
                    width: row.get(4)?,
                    height: row.get(5)?,
                });
            }

            Ok(screenshots)
        })
        .await
    }
}
