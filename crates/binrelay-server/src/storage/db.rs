//! SQLite database for recorded judgments.

use std::path::Path;

use sqlx::{Pool, Sqlite};
use tracing::info;

use binrelay_core::db::{self, DatabaseError};

/// Handle to the judgment database. Cheap to clone.
#[derive(Clone)]
pub struct JudgmentDatabase {
    pool: Pool<Sqlite>,
}

impl JudgmentDatabase {
    /// Open or create the database at `path` and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(db::open_pool(path).await?).await
    }

    /// Open a private in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(db::open_pool_in_memory().await?).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Judgment database migrations complete");
        Ok(Self { pool })
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
