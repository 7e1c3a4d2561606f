//! SQLite storage for disposal judgments.

mod db;
mod models;
mod queries;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests;

use async_trait::async_trait;

pub use binrelay_core::db::DatabaseError;
pub use db::JudgmentDatabase;
pub use models::*;

/// Record store used by the dispatcher. Inserts are append-only; the only
/// later change is replacing a record's message.
#[async_trait]
pub trait JudgmentStore: Send + Sync {
    /// Persist a judgment and return its row id.
    async fn record(&self, judgment: &NewJudgment) -> Result<i64, DatabaseError>;

    /// Replace the message of the record written at `recorded_at`. Returns
    /// whether a record matched.
    async fn patch_message(
        &self,
        user_id: &str,
        recorded_at: i64,
        message: &str,
    ) -> Result<bool, DatabaseError>;
}

#[async_trait]
impl JudgmentStore for JudgmentDatabase {
    async fn record(&self, judgment: &NewJudgment) -> Result<i64, DatabaseError> {
        self.insert_judgment(judgment).await
    }

    async fn patch_message(
        &self,
        user_id: &str,
        recorded_at: i64,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        self.update_message(user_id, recorded_at, message).await
    }
}
