use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::{IdempotencyError, Result};
use crate::persistence::PersistenceStore;
use crate::record::{IdempotencyRecord, RecordStatus};

const DEFAULT_TABLE: &str = "idempotency_records";

/// PostgreSQL-backed persistence store.
///
/// The claim is a single conditional statement, so concurrent `put_record`
/// calls for the same key are serialized by the database: exactly one writer
/// wins, the rest observe the conflict.
pub struct PostgresStore {
    pool: PgPool,
    table: String,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_table(pool, DEFAULT_TABLE)
    }

    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Creates the backing table if it does not exist yet.
    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                idempotency_key TEXT PRIMARY KEY,
                status VARCHAR NOT NULL,
                expiry_timestamp BIGINT NOT NULL,
                in_progress_expiry_timestamp BIGINT,
                response_data JSONB,
                payload_hash TEXT
            )
            "#,
            table = self.table
        );

        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let sql = format!(
            r#"
            SELECT idempotency_key, status, expiry_timestamp, in_progress_expiry_timestamp, response_data, payload_hash
            FROM {table}
            WHERE idempotency_key = $1
            "#,
            table = self.table
        );

        let record = sqlx::query_as::<_, IdempotencyRecord>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn put_record(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Result<()> {
        // Insert, or overwrite a stale row (expired, or in-progress past its
        // in-progress expiry). When the guard is false the conflict action is
        // skipped and no row comes back, which is the live-conflict case.
        let sql = format!(
            r#"
            INSERT INTO {table} (idempotency_key, status, expiry_timestamp, in_progress_expiry_timestamp, response_data, payload_hash)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key) DO UPDATE
            SET status = EXCLUDED.status,
                expiry_timestamp = EXCLUDED.expiry_timestamp,
                in_progress_expiry_timestamp = EXCLUDED.in_progress_expiry_timestamp,
                response_data = EXCLUDED.response_data,
                payload_hash = EXCLUDED.payload_hash
            WHERE {table}.expiry_timestamp < $7
               OR ({table}.status = 'INPROGRESS' AND {table}.in_progress_expiry_timestamp < $7)
            RETURNING idempotency_key
            "#,
            table = self.table
        );

        let claimed: Option<(String,)> = sqlx::query_as(&sql)
            .bind(&record.idempotency_key)
            .bind(record.status)
            .bind(record.expiry_timestamp)
            .bind(record.in_progress_expiry_timestamp)
            .bind(&record.response_data)
            .bind(&record.payload_hash)
            .bind(now.timestamp())
            .fetch_optional(&self.pool)
            .await?;

        if claimed.is_none() {
            return Err(IdempotencyError::KeyAlreadyExists(
                record.idempotency_key.clone(),
            ));
        }

        Ok(())
    }

    async fn update_record(&self, record: &IdempotencyRecord) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = $2,
                expiry_timestamp = $3,
                in_progress_expiry_timestamp = $4,
                response_data = $5,
                payload_hash = $6
            WHERE idempotency_key = $1 AND status = $7
            "#,
            table = self.table
        );

        let result = sqlx::query(&sql)
            .bind(&record.idempotency_key)
            .bind(record.status)
            .bind(record.expiry_timestamp)
            .bind(record.in_progress_expiry_timestamp)
            .bind(&record.response_data)
            .bind(&record.payload_hash)
            .bind(RecordStatus::InProgress)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(IdempotencyError::InconsistentState(
                record.idempotency_key.clone(),
                "record was removed or already transitioned".to_string(),
            ));
        }

        Ok(())
    }

    async fn delete_record(&self, key: &str) -> Result<()> {
        let sql = format!(
            r#"
            DELETE FROM {table}
            WHERE idempotency_key = $1
            "#,
            table = self.table
        );

        sqlx::query(&sql).bind(key).execute(&self.pool).await?;
        Ok(())
    }
}
