use anyhow::Result;
use chrono::Utc;
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::parse_example_shape,
    models::TrainingExample,
};

impl Database {
    /// Replace the session's training examples in one transaction, so a
    /// retried pipeline run never leaves a mix of old and new artifacts.
    pub async fn replace_training_examples(
        &self,
        session_id: &str,
        examples: &[TrainingExample],
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let examples = examples.to_vec();
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "DELETE FROM training_examples WHERE session_id = ?1",
                params![session_id],
            )?;

            let created_at = Utc::now().to_rfc3339();
            for example in &examples {
                tx.execute(
                    "INSERT INTO training_examples (session_id, position, payload, source_shape, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        session_id,
                        example.position,
                        serde_json::to_string(&example.payload)?,
                        example.shape.as_str(),
                        created_at,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn get_training_examples(&self, session_id: &str) -> Result<Vec<TrainingExample>> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT position, payload, source_shape
                 FROM training_examples
                 WHERE session_id = ?1
                 ORDER BY position ASC",
            )?;

            let mut rows = stmt.query(params![session_id])?;
            let mut examples = Vec::new();
            while let Some(row) = rows.next()? {
                let payload: String = row.get(1)?;
                let shape: String = row.get(2)?;
                examples.push(TrainingExample {
                    position: row.get(0)?,
                    shape: parse_example_shape(&shape)?,
                    payload: serde_json::from_str(&payload)?,
                });
            }

            Ok(examples)
        })
        .await
    }
}
