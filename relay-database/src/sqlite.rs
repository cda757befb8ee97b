use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use relay_models::jobs::CompletionRecord;
use sqlx::{ConnectOptions, SqlitePool, sqlite::SqliteConnectOptions};

use crate::{
    StoreError,
    interfaces::CompletionStore,
    mappers::{CompletionRow, row_to_completion},
};

const SQLITE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS fcm_job (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identifier TEXT NOT NULL UNIQUE,
    deliver_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
)";

const SQLITE_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_fcm_job_deliver_at ON fcm_job (deliver_at)";

pub struct SqliteStore {
    pub pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(filename: &str) -> Result<Self, StoreError> {
        let mut options = SqliteConnectOptions::new()
            .filename(filename)
            .create_if_missing(true);
        options
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }
}

impl CompletionStore for SqliteStore {
    async fn create_table(&self) -> Result<(), StoreError> {
        sqlx::query(SQLITE_TABLE_SQL).execute(&self.pool).await?;
        sqlx::query(SQLITE_INDEX_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn record_completion(
        &self,
        identifier: &str,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO fcm_job (identifier, deliver_at, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(identifier) DO NOTHING",
        )
        .bind(identifier)
        .bind(deliver_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(identifier.to_string()));
        }
        debug!("FCM job saved to database: {}", identifier);
        Ok(())
    }

    async fn find_completion(&self, identifier: &str) -> Result<Option<CompletionRecord>, StoreError> {
        let row = sqlx::query_as::<_, CompletionRow>(
            "SELECT identifier, deliver_at, created_at FROM fcm_job WHERE identifier = ?",
        )
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_completion).transpose()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
