use std::{str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use log::debug;
use relay_models::jobs::CompletionRecord;
use sqlx::{
    ConnectOptions, PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};

use crate::{
    StoreError,
    interfaces::CompletionStore,
    mappers::{CompletionRow, row_to_completion},
};

const POSTGRES_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS fcm_job (
    id BIGSERIAL PRIMARY KEY,
    identifier TEXT NOT NULL UNIQUE,
    deliver_at BIGINT NOT NULL,
    created_at BIGINT NOT NULL
)";

const POSTGRES_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_fcm_job_deliver_at ON fcm_job (deliver_at)";

pub struct PostgresStore {
    pub pool: PgPool,
}

impl PostgresStore {
    pub async fn new(connection_str: &str) -> Result<Self, StoreError> {
        let mut options = PgConnectOptions::from_str(connection_str)?;
        options
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(1));

        let pool = PgPoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }
}

impl CompletionStore for PostgresStore {
    async fn create_table(&self) -> Result<(), StoreError> {
        sqlx::query(POSTGRES_TABLE_SQL).execute(&self.pool).await?;
        sqlx::query(POSTGRES_INDEX_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn record_completion(
        &self,
        identifier: &str,
        deliver_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO fcm_job (identifier, deliver_at, created_at)
             VALUES ($1, $2, $3)
             ON CONFLICT (identifier) DO NOTHING",
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
            "SELECT identifier, deliver_at, created_at FROM fcm_job WHERE identifier = $1",
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
