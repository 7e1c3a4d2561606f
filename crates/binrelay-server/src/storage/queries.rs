//! Judgment queries.

use super::db::JudgmentDatabase;
use super::models::{Judgment, NewJudgment};
use binrelay_core::db::DatabaseError;

impl JudgmentDatabase {
    pub async fn insert_judgment(&self, judgment: &NewJudgment) -> Result<i64, DatabaseError> {
        let detected_items = serde_json::to_string(&judgment.detected_items)
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        let raw_json = judgment.result_json().to_string();

        let result = sqlx::query(
            "INSERT INTO judgments (user_id, recorded_at, image_path, detected_items, is_valid, \
             rejection_reason, has_change, message, raw_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&judgment.user_id)
        .bind(judgment.recorded_at)
        .bind(&judgment.image_path)
        .bind(detected_items)
        .bind(judgment.is_valid)
        .bind(&judgment.rejection_reason)
        .bind(judgment.has_change)
        .bind(&judgment.message)
        .bind(raw_json)
        .execute(self.pool())
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Replace the message of every record for `user_id` written at
    /// `recorded_at`. Returns whether any row changed.
    pub async fn update_message(
        &self,
        user_id: &str,
        recorded_at: i64,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE judgments SET message = ?, \
             raw_json = json_set(raw_json, '$.message', ?) \
             WHERE user_id = ? AND recorded_at = ?",
        )
        .bind(message)
        .bind(message)
        .bind(user_id)
        .bind(recorded_at)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get_judgment(&self, id: i64) -> Result<Judgment, DatabaseError> {
        sqlx::query_as::<_, Judgment>("SELECT * FROM judgments WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("judgment {id}")))
    }

    /// Most recent judgments first.
    pub async fn recent_judgments(&self, limit: i64) -> Result<Vec<Judgment>, DatabaseError> {
        let rows = sqlx::query_as::<_, Judgment>(
            "SELECT * FROM judgments ORDER BY recorded_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}
