use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};

use crate::error::{IdempotencyError, Result};
use crate::persistence::{PersistenceStore, RecordAttributes};
use crate::record::{IdempotencyRecord, RecordStatus};

/// Lua script for atomic claim of a stale key.
///
/// Runs when `SET NX` lost: decodes the stored record server-side and
/// overwrites it only if it is expired, or in-progress past its in-progress
/// expiry. KEYS[1] = record key; ARGV = body, ttl seconds, now (epoch
/// seconds), expiry attr, status attr, in-progress expiry attr.
/// Returns 1 when the claim was taken, 0 when a live record holds the key.
const CLAIM_SCRIPT: &str = r#"
local raw = redis.call("get", KEYS[1])
if not raw then
    redis.call("set", KEYS[1], ARGV[1], "EX", ARGV[2])
    return 1
end
local record = cjson.decode(raw)
local now = tonumber(ARGV[3])
local expiry = tonumber(record[ARGV[4]])
local stale = expiry == nil or now > expiry
if not stale and record[ARGV[5]] == "INPROGRESS" then
    local in_progress_expiry = tonumber(record[ARGV[6]])
    stale = in_progress_expiry ~= nil and now > in_progress_expiry
end
if stale then
    redis.call("set", KEYS[1], ARGV[1], "EX", ARGV[2])
    return 1
end
return 0
"#;

/// Lua script for the completed transition.
///
/// Only overwrites a record that is still in progress, so a record deleted or
/// completed by someone else between claim and completion is never
/// resurrected. KEYS[1] = record key; ARGV = body, ttl seconds, status attr.
/// Returns 1 on success, 0 when the record is no longer in progress, -1 when
/// it is gone.
const UPDATE_SCRIPT: &str = r#"
local raw = redis.call("get", KEYS[1])
if not raw then
    return -1
end
local record = cjson.decode(raw)
if record[ARGV[3]] ~= "INPROGRESS" then
    return 0
end
redis.call("set", KEYS[1], ARGV[1], "EX", ARGV[2])
return 1
"#;

/// Redis-backed persistence store.
///
/// Records are JSON objects under a prefixed key. The claim is first-writer-
/// wins: `SET NX` covers the fresh-key fast path, and reclaiming a logically
/// stale record runs server-side as a Lua compare-and-swap, so concurrent
/// claimers of an orphaned key resolve to exactly one winner. The completed
/// transition is the same shape and never resurrects a deleted record.
pub struct RedisStore {
    client: redis::Client,
    key_prefix: String,
    attrs: RecordAttributes,
}

impl RedisStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            attrs: RecordAttributes::default(),
        }
    }

    pub fn with_attributes(mut self, attrs: RecordAttributes) -> Self {
        self.attrs = attrs;
        self
    }

    fn make_key(&self, idempotency_key: &str) -> String {
        format!("{}:{}", self.key_prefix, idempotency_key)
    }

    fn serialize(&self, record: &IdempotencyRecord) -> Result<String> {
        let mut map = serde_json::Map::new();
        map.insert(
            self.attrs.key_attr.clone(),
            serde_json::Value::from(record.idempotency_key.clone()),
        );
        if let Some(ref sort_key) = self.attrs.sort_key_attr {
            map.insert(
                sort_key.clone(),
                serde_json::Value::from(record.idempotency_key.clone()),
            );
        }
        map.insert(
            self.attrs.status_attr.clone(),
            serde_json::Value::from(record.status.as_str()),
        );
        map.insert(
            self.attrs.expiry_attr.clone(),
            serde_json::Value::from(record.expiry_timestamp),
        );
        if let Some(ts) = record.in_progress_expiry_timestamp {
            map.insert(
                self.attrs.in_progress_expiry_attr.clone(),
                serde_json::Value::from(ts),
            );
        }
        if let Some(ref data) = record.response_data {
            map.insert(self.attrs.data_attr.clone(), data.clone());
        }
        if let Some(ref hash) = record.payload_hash {
            map.insert(
                self.attrs.validation_key_attr.clone(),
                serde_json::Value::from(hash.clone()),
            );
        }
        Ok(serde_json::to_string(&serde_json::Value::Object(map))?)
    }

    fn deserialize(&self, idempotency_key: &str, raw: &str) -> Result<IdempotencyRecord> {
        let value: serde_json::Value = serde_json::from_str(raw)?;

        let status = match value.get(&self.attrs.status_attr).and_then(|v| v.as_str()) {
            Some("INPROGRESS") => RecordStatus::InProgress,
            Some("COMPLETED") => RecordStatus::Completed,
            Some("EXPIRED") => RecordStatus::Expired,
            other => {
                return Err(IdempotencyError::InconsistentState(
                    idempotency_key.to_string(),
                    format!("unrecognized stored status {:?}", other),
                ))
            }
        };

        let expiry_timestamp = value
            .get(&self.attrs.expiry_attr)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                IdempotencyError::InconsistentState(
                    idempotency_key.to_string(),
                    "stored record has no expiry timestamp".to_string(),
                )
            })?;

        Ok(IdempotencyRecord {
            idempotency_key: idempotency_key.to_string(),
            status,
            expiry_timestamp,
            in_progress_expiry_timestamp: value
                .get(&self.attrs.in_progress_expiry_attr)
                .and_then(|v| v.as_i64()),
            response_data: value.get(&self.attrs.data_attr).cloned(),
            payload_hash: value
                .get(&self.attrs.validation_key_attr)
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    fn ttl_seconds(record: &IdempotencyRecord, now: DateTime<Utc>) -> u64 {
        (record.expiry_timestamp - now.timestamp()).max(1) as u64
    }
}

#[async_trait]
impl PersistenceStore for RedisStore {
    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let raw: Option<String> = conn.get(self.make_key(key)).await?;
        match raw {
            Some(raw) => Ok(Some(self.deserialize(key, &raw)?)),
            None => Ok(None),
        }
    }

    async fn put_record(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let key = self.make_key(&record.idempotency_key);
        let body = self.serialize(record)?;
        let ttl = Self::ttl_seconds(record, now);

        let set: Option<String> = conn
            .set_options(
                &key,
                &body,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::EX(ttl as usize)),
            )
            .await?;

        if set.is_some() {
            return Ok(());
        }

        // NX lost: the key exists, but it may still be logically stale. The
        // script re-checks and swaps atomically so one claimer wins.
        let claimed: i64 = Script::new(CLAIM_SCRIPT)
            .key(&key)
            .arg(&body)
            .arg(ttl)
            .arg(now.timestamp())
            .arg(&self.attrs.expiry_attr)
            .arg(&self.attrs.status_attr)
            .arg(&self.attrs.in_progress_expiry_attr)
            .invoke_async(&mut conn)
            .await?;

        if claimed == 1 {
            Ok(())
        } else {
            Err(IdempotencyError::KeyAlreadyExists(
                record.idempotency_key.clone(),
            ))
        }
    }

    async fn update_record(&self, record: &IdempotencyRecord) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let key = self.make_key(&record.idempotency_key);
        let body = self.serialize(record)?;
        let ttl = Self::ttl_seconds(record, Utc::now());

        let updated: i64 = Script::new(UPDATE_SCRIPT)
            .key(&key)
            .arg(&body)
            .arg(ttl)
            .arg(&self.attrs.status_attr)
            .invoke_async(&mut conn)
            .await?;

        match updated {
            1 => Ok(()),
            0 => Err(IdempotencyError::InconsistentState(
                record.idempotency_key.clone(),
                "record is no longer in progress".to_string(),
            )),
            _ => Err(IdempotencyError::InconsistentState(
                record.idempotency_key.clone(),
                "record was removed before update".to_string(),
            )),
        }
    }

    async fn delete_record(&self, key: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let _: i64 = conn.del(self.make_key(key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> RedisStore {
        // Client::open only parses the URL; no connection is made here.
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        RedisStore::new(client, "idem")
    }

    fn completed_record(now: DateTime<Utc>) -> IdempotencyRecord {
        let mut record = IdempotencyRecord::in_progress(
            "order-42".to_string(),
            (now + Duration::hours(1)).timestamp(),
            (now + Duration::minutes(1)).timestamp(),
            Some("abc123".to_string()),
        );
        record.complete(
            serde_json::json!({"payment_id": "1"}),
            (now + Duration::hours(1)).timestamp(),
        );
        record
    }

    #[test]
    fn test_key_prefixing() {
        assert_eq!(store().make_key("abc"), "idem:abc");
    }

    #[test]
    fn test_record_round_trip_default_attributes() {
        let s = store();
        let now = Utc::now();
        let record = completed_record(now);

        let raw = s.serialize(&record).unwrap();
        let parsed = s.deserialize("order-42", &raw).unwrap();

        assert_eq!(parsed.status, RecordStatus::Completed);
        assert_eq!(parsed.expiry_timestamp, record.expiry_timestamp);
        assert_eq!(parsed.payload_hash.as_deref(), Some("abc123"));
        assert_eq!(parsed.response_data, record.response_data);
    }

    #[test]
    fn test_serialized_body_carries_key_attribute() {
        let s = store();
        let now = Utc::now();
        let raw = s.serialize(&completed_record(now)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["id"], "order-42");
    }

    #[test]
    fn test_custom_attribute_names() {
        let client = redis::Client::open("redis://localhost:6379").unwrap();
        let s = RedisStore::new(client, "idem").with_attributes(RecordAttributes {
            key_attr: "pk".to_string(),
            sort_key_attr: Some("sk".to_string()),
            status_attr: "st".to_string(),
            expiry_attr: "exp".to_string(),
            in_progress_expiry_attr: "ipexp".to_string(),
            data_attr: "body".to_string(),
            validation_key_attr: "vh".to_string(),
        });

        let now = Utc::now();
        let raw = s.serialize(&completed_record(now)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value["pk"], "order-42");
        assert_eq!(value["sk"], "order-42");
        assert_eq!(value["st"], "COMPLETED");
        assert!(value.get("status").is_none());
        assert!(value.get("exp").is_some());
        assert_eq!(value["body"]["payment_id"], "1");

        let parsed = s.deserialize("order-42", &raw).unwrap();
        assert_eq!(parsed.status, RecordStatus::Completed);
    }

    #[test]
    fn test_deserialize_rejects_unknown_status() {
        let s = store();
        let err = s
            .deserialize("k", r#"{"status": "BOGUS", "expiration": 1}"#)
            .unwrap_err();
        assert!(matches!(err, IdempotencyError::InconsistentState(_, _)));
    }

    #[test]
    fn test_ttl_floor_is_one_second() {
        let now = Utc::now();
        let mut record = completed_record(now);
        record.expiry_timestamp = now.timestamp() - 100;
        assert_eq!(RedisStore::ttl_seconds(&record, now), 1);
    }
}
