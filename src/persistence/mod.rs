pub mod memory;
pub mod postgres;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::record::IdempotencyRecord;

#[cfg(test)]
use mockall::automock;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use redis::RedisStore;

/// Attribute names used by schemaless adapters when serializing records.
///
/// Stores with fixed schemas (Postgres) ignore these; the Redis adapter maps
/// record fields onto these names so existing tables written by other
/// runtimes can be shared. The storage key itself is always
/// `{prefix}:{idempotency_key}` (Redis) or the primary-key column (Postgres);
/// `key_attr` and the optional `sort_key_attr` control where the idempotency
/// key is mirrored inside the serialized record body.
#[derive(Debug, Clone)]
pub struct RecordAttributes {
    pub key_attr: String,
    pub sort_key_attr: Option<String>,
    pub status_attr: String,
    pub expiry_attr: String,
    pub in_progress_expiry_attr: String,
    pub data_attr: String,
    pub validation_key_attr: String,
}

impl Default for RecordAttributes {
    fn default() -> Self {
        Self {
            key_attr: "id".to_string(),
            sort_key_attr: None,
            status_attr: "status".to_string(),
            expiry_attr: "expiration".to_string(),
            in_progress_expiry_attr: "in_progress_expiration".to_string(),
            data_attr: "data".to_string(),
            validation_key_attr: "validation".to_string(),
        }
    }
}

/// Durable storage for idempotency records with atomic claim semantics.
///
/// All operations are remote calls; transport failures surface as
/// [`crate::error::IdempotencyError::PersistenceLayer`] and are not retried
/// here. Retry policy lives in the orchestrator.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Fetches the latest committed record for `key`, or `None`.
    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>>;

    /// Conditionally creates `record`: succeeds only if no non-expired record
    /// holds the key. An existing record past its expiry, or in-progress past
    /// its in-progress expiry, counts as absent and is overwritten.
    ///
    /// A live conflicting record is reported as
    /// [`crate::error::IdempotencyError::KeyAlreadyExists`], distinct from
    /// transport errors, so the orchestrator can branch into conflict
    /// handling.
    async fn put_record(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Result<()>;

    /// Transitions an existing in-progress record to its completed state.
    /// Fails with `InconsistentState` if the record was removed or already
    /// transitioned by someone else.
    async fn update_record(&self, record: &IdempotencyRecord) -> Result<()>;

    /// Removes the record for `key`. Used after handler failure so a future
    /// attempt is not blocked until expiry.
    async fn delete_record(&self, key: &str) -> Result<()>;
}
