use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of an idempotency record.
///
/// `Expired` is never written by this crate; it is the derived state of a
/// record past its expiry timestamp (see [`IdempotencyRecord::effective_status`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    InProgress,
    Completed,
    Expired,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::InProgress => "INPROGRESS",
            RecordStatus::Completed => "COMPLETED",
            RecordStatus::Expired => "EXPIRED",
        }
    }
}

/// One idempotency key's state in the backing store.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub status: RecordStatus,
    /// Epoch seconds after which a completed record is stale and the key is
    /// claimable again.
    pub expiry_timestamp: i64,
    /// Epoch seconds after which an in-progress record is considered
    /// abandoned and may be reclaimed.
    pub in_progress_expiry_timestamp: Option<i64>,
    /// Serialized return value of the wrapped function; only present once the
    /// record is completed.
    pub response_data: Option<serde_json::Value>,
    pub payload_hash: Option<String>,
}

impl IdempotencyRecord {
    /// Creates a fresh in-progress record claiming `idempotency_key`.
    pub fn in_progress(
        idempotency_key: String,
        expiry_timestamp: i64,
        in_progress_expiry_timestamp: i64,
        payload_hash: Option<String>,
    ) -> Self {
        Self {
            idempotency_key,
            status: RecordStatus::InProgress,
            expiry_timestamp,
            in_progress_expiry_timestamp: Some(in_progress_expiry_timestamp),
            response_data: None,
            payload_hash,
        }
    }

    /// Whether the record is past its expiry timestamp at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.expiry_timestamp
    }

    /// Whether an in-progress record has been abandoned (its in-progress
    /// expiry has passed). Completed records are never orphaned.
    pub fn is_in_progress_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.in_progress_expiry_timestamp) {
            (RecordStatus::InProgress, Some(ts)) => now.timestamp() > ts,
            _ => false,
        }
    }

    /// Stored status with expiry applied: records past `expiry_timestamp`
    /// read as `Expired` regardless of what the store holds.
    pub fn effective_status(&self, now: DateTime<Utc>) -> RecordStatus {
        if self.is_expired(now) {
            RecordStatus::Expired
        } else {
            self.status
        }
    }

    /// Transitions this record to completed with the serialized response.
    pub fn complete(&mut self, response_data: serde_json::Value, expiry_timestamp: i64) {
        self.status = RecordStatus::Completed;
        self.response_data = Some(response_data);
        self.expiry_timestamp = expiry_timestamp;
        self.in_progress_expiry_timestamp = None;
    }
}
