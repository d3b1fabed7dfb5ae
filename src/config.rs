use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{IdempotencyError, Result};

/// Pluggable key-extraction strategy: picks the key material out of an
/// invocation payload. `None` means the payload held no match.
pub type KeyExtractor = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Pluggable hash over canonicalized key material.
pub type HashFunction = Arc<dyn Fn(&[u8]) -> String + Send + Sync>;

/// Default hash: SHA-256 hex digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Operational parameters for idempotent execution.
#[derive(Clone)]
pub struct IdempotencyConfig {
    /// Extracts key material from the payload; default is the whole payload.
    pub event_key_extractor: Option<KeyExtractor>,
    /// Extracts the portion of the payload subject to hash validation;
    /// validation is disabled when unset.
    pub payload_validation_extractor: Option<KeyExtractor>,
    /// When the extractor finds nothing: fail fast if set, else fall back to
    /// hashing the entire payload.
    pub throw_on_no_idempotency_key: bool,
    pub expires_after_seconds: i64,
    pub use_local_cache: bool,
    pub max_local_cache_size: usize,
    pub key_prefix: String,
    pub hash_function: HashFunction,
    /// Claim-conflict retry budget. Models a short contention window, not
    /// long-polling.
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            event_key_extractor: None,
            payload_validation_extractor: None,
            throw_on_no_idempotency_key: false,
            expires_after_seconds: 3600,
            use_local_cache: false,
            max_local_cache_size: 256,
            key_prefix: "idempotency".to_string(),
            hash_function: Arc::new(sha256_hex),
            max_retries: 2,
            retry_backoff_ms: 50,
        }
    }
}

impl fmt::Debug for IdempotencyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotencyConfig")
            .field("has_event_key_extractor", &self.event_key_extractor.is_some())
            .field(
                "has_payload_validation_extractor",
                &self.payload_validation_extractor.is_some(),
            )
            .field("throw_on_no_idempotency_key", &self.throw_on_no_idempotency_key)
            .field("expires_after_seconds", &self.expires_after_seconds)
            .field("use_local_cache", &self.use_local_cache)
            .field("max_local_cache_size", &self.max_local_cache_size)
            .field("key_prefix", &self.key_prefix)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .finish()
    }
}

impl IdempotencyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_key_extractor(
        mut self,
        extractor: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.event_key_extractor = Some(Arc::new(extractor));
        self
    }

    pub fn with_payload_validation(
        mut self,
        extractor: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.payload_validation_extractor = Some(Arc::new(extractor));
        self
    }

    pub fn with_throw_on_no_idempotency_key(mut self, throw: bool) -> Self {
        self.throw_on_no_idempotency_key = throw;
        self
    }

    pub fn with_expires_after_seconds(mut self, seconds: i64) -> Self {
        self.expires_after_seconds = seconds;
        self
    }

    pub fn with_local_cache(mut self, enabled: bool) -> Self {
        self.use_local_cache = enabled;
        self
    }

    pub fn with_max_local_cache_size(mut self, size: usize) -> Self {
        self.max_local_cache_size = size;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_hash_function(
        mut self,
        hash: impl Fn(&[u8]) -> String + Send + Sync + 'static,
    ) -> Self {
        self.hash_function = Arc::new(hash);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.retry_backoff_ms = backoff_ms;
        self
    }

    /// Resolves the key material for `payload`, applying the no-match policy.
    pub fn extract_key_material(&self, payload: &Value) -> Result<Value> {
        let Some(ref extractor) = self.event_key_extractor else {
            return Ok(payload.clone());
        };

        match extractor(payload) {
            Some(material) if !material.is_null() => Ok(material),
            _ => {
                if self.throw_on_no_idempotency_key {
                    Err(IdempotencyError::Configuration(
                        "no idempotency key material found in payload".to_string(),
                    ))
                } else {
                    tracing::warn!(
                        "No idempotency key material found; falling back to full payload hash"
                    );
                    Ok(payload.clone())
                }
            }
        }
    }

    /// Computes the final idempotency key. The digest covers the prefix plus
    /// the canonical (sorted-key) JSON form of the key material, so distinct
    /// prefixes never collide; the prefix is kept readable in front of the
    /// digest for store operations.
    pub fn idempotency_key(&self, payload: &Value) -> Result<String> {
        let material = self.extract_key_material(payload)?;
        let canonical = serde_json::to_string(&material)?;
        let hashed = format!("{}{}", self.key_prefix, canonical);
        let digest = (self.hash_function)(hashed.as_bytes());
        Ok(format!("{}#{}", self.key_prefix, digest))
    }

    /// Hash of the validation portion of the payload, if validation is on.
    pub fn validation_hash(&self, payload: &Value) -> Option<String> {
        let extractor = self.payload_validation_extractor.as_ref()?;
        let material = extractor(payload).unwrap_or(Value::Null);
        let canonical = serde_json::to_string(&material).unwrap_or_default();
        Some((self.hash_function)(canonical.as_bytes()))
    }

    pub fn expiry_timestamp(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() + self.expires_after_seconds
    }

    /// In-progress expiry: bounded by the remaining invocation time when the
    /// runtime reports one, else by the record TTL.
    pub fn in_progress_expiry_timestamp(
        &self,
        now: DateTime<Utc>,
        remaining_time_ms: Option<u64>,
    ) -> i64 {
        match remaining_time_ms {
            Some(ms) => now.timestamp() + (ms as i64 + 999) / 1000,
            None => now.timestamp() + self.expires_after_seconds,
        }
    }
}
