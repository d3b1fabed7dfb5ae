use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::cache::LocalCache;
use crate::config::IdempotencyConfig;
use crate::error::{IdempotencyError, Result};
use crate::observability::get_metrics;
use crate::persistence::PersistenceStore;
use crate::record::{IdempotencyRecord, RecordStatus};

/// Error returned by [`IdempotencyHandler::execute`].
///
/// Business-logic errors from the wrapped function pass through the
/// `Handler` variant unchanged; the idempotency machinery never swallows or
/// transforms them.
#[derive(Debug, Error)]
pub enum ExecutionError<E>
where
    E: std::error::Error,
{
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
    #[error(transparent)]
    Handler(E),
}

/// Per-invocation context supplied by the caller. The remaining invocation
/// time, when the runtime reports one, bounds the in-progress expiry of the
/// claimed record.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub invocation_id: String,
    pub remaining_time_ms: Option<u64>,
}

impl InvocationContext {
    pub fn new() -> Self {
        Self {
            invocation_id: Uuid::new_v4().to_string(),
            remaining_time_ms: None,
        }
    }

    pub fn with_remaining_time_ms(mut self, ms: u64) -> Self {
        self.remaining_time_ms = Some(ms);
        self
    }
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process counters for idempotent execution.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_invocations: AtomicU64,
    pub local_cache_hits: AtomicU64,
    pub replayed_responses: AtomicU64,
    pub executions: AtomicU64,
    pub completions: AtomicU64,
    pub failures: AtomicU64,
    pub claim_conflicts: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_invocation(&self) {
        self.total_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_cache_hit(&self) {
        self.local_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed_response(&self) {
        self.replayed_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self) {
        self.completions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claim_conflict(&self) {
        self.claim_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Share of invocations answered without executing the wrapped function.
    pub fn replay_rate(&self) -> f64 {
        let total = self.total_invocations.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let replayed = self.replayed_responses.load(Ordering::Relaxed)
            + self.local_cache_hits.load(Ordering::Relaxed);
        replayed as f64 / total as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_invocations: self.total_invocations.load(Ordering::Relaxed),
            local_cache_hits: self.local_cache_hits.load(Ordering::Relaxed),
            replayed_responses: self.replayed_responses.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            claim_conflicts: self.claim_conflicts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_invocations: u64,
    pub local_cache_hits: u64,
    pub replayed_responses: u64,
    pub executions: u64,
    pub completions: u64,
    pub failures: u64,
    pub claim_conflicts: u64,
}

/// Outcome of the claim protocol for one invocation.
enum Claim {
    /// We hold the in-progress record; the wrapped function must run.
    Acquired(IdempotencyRecord),
    /// Another invocation already completed; replay its stored response.
    Replayed(Value),
}

/// The idempotency orchestrator.
///
/// Per invocation it derives the key, consults the local cache, claims the
/// key through the persistence store, executes the wrapped function at most
/// once per claim, and persists the outcome. Cross-process races on a key are
/// resolved entirely by the store's conditional writes; there is no
/// in-process locking across invocations.
pub struct IdempotencyHandler {
    store: Arc<dyn PersistenceStore>,
    cache: Option<LocalCache>,
    config: IdempotencyConfig,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyHandler {
    pub fn new(store: Arc<dyn PersistenceStore>, config: IdempotencyConfig) -> Self {
        let cache = config
            .use_local_cache
            .then(|| LocalCache::new(config.max_local_cache_size));

        Self {
            store,
            cache,
            config,
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn local_cache(&self) -> Option<&LocalCache> {
        self.cache.as_ref()
    }

    /// Runs `handler` idempotently for `payload`.
    ///
    /// A repeated call with the same payload within the TTL window returns
    /// the stored response without invoking `handler` again. Errors from
    /// `handler` propagate unchanged and unblock future retries by deleting
    /// the claimed record.
    pub async fn execute<T, E, F, Fut>(
        &self,
        payload: &Value,
        ctx: &InvocationContext,
        handler: F,
    ) -> std::result::Result<T, ExecutionError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.metrics.record_invocation();

        // Key derivation happens before any store access so configuration
        // errors fail fast.
        let key = self.config.idempotency_key(payload)?;
        let payload_hash = self.config.validation_hash(payload);

        if let Some(cache) = &self.cache {
            let now = Utc::now();
            if let Some(record) = cache.get(&key, now) {
                check_payload_hash(&record, payload_hash.as_deref())?;
                self.metrics.record_local_cache_hit();
                get_metrics().record_cache_hit();
                tracing::debug!(
                    key = %record.idempotency_key,
                    invocation_id = %ctx.invocation_id,
                    "Returning locally cached response"
                );
                return Ok(deserialize_response::<T>(&record.idempotency_key, record.response_data)?);
            }
        }

        match self.claim(&key, payload_hash, ctx).await? {
            Claim::Replayed(data) => {
                self.metrics.record_replayed_response();
                get_metrics().record_replayed_response();
                tracing::debug!(
                    key = %key,
                    invocation_id = %ctx.invocation_id,
                    "Returning stored response for duplicate invocation"
                );
                Ok(serde_json::from_value(data).map_err(IdempotencyError::Serialization)?)
            }
            Claim::Acquired(record) => self.run_handler(record, ctx, handler).await,
        }
    }

    /// Claim loop: attempt the conditional create, branching on the state of
    /// any conflicting record, bounded by the configured retry budget.
    async fn claim(
        &self,
        key: &str,
        payload_hash: Option<String>,
        ctx: &InvocationContext,
    ) -> Result<Claim> {
        let attempts = self.config.max_retries + 1;
        let mut saw_live_in_progress = false;

        for attempt in 0..attempts {
            if attempt > 0 && self.config.retry_backoff_ms > 0 {
                let backoff = self.config.retry_backoff_ms * attempt as u64;
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }

            let now = Utc::now();
            let record = IdempotencyRecord::in_progress(
                key.to_string(),
                self.config.expiry_timestamp(now),
                self.config
                    .in_progress_expiry_timestamp(now, ctx.remaining_time_ms),
                payload_hash.clone(),
            );

            match self.store.put_record(&record, now).await {
                Ok(()) => return Ok(Claim::Acquired(record)),
                Err(IdempotencyError::KeyAlreadyExists(_)) => {
                    self.metrics.record_claim_conflict();
                    get_metrics().record_claim_conflict();
                }
                Err(other) => return Err(other),
            }

            let Some(existing) = self.store.get_record(key).await? else {
                // Deleted or evicted between claim and read; claim again.
                tracing::debug!(key = %key, "Conflicting record vanished; retrying claim");
                saw_live_in_progress = false;
                continue;
            };

            let now = Utc::now();
            match existing.effective_status(now) {
                RecordStatus::Completed => {
                    check_payload_hash(&existing, payload_hash.as_deref())?;
                    let data = existing.response_data.clone().ok_or_else(|| {
                        IdempotencyError::InconsistentState(
                            key.to_string(),
                            "completed record has no response data".to_string(),
                        )
                    })?;
                    if let Some(cache) = &self.cache {
                        cache.set(existing);
                    }
                    return Ok(Claim::Replayed(data));
                }
                RecordStatus::Expired => {
                    // Functionally absent; physical deletion is left to the
                    // store's TTL mechanism.
                    saw_live_in_progress = false;
                }
                RecordStatus::InProgress => {
                    if existing.is_in_progress_expired(now) {
                        tracing::debug!(key = %key, "Reclaiming orphaned in-progress record");
                        saw_live_in_progress = false;
                    } else {
                        check_payload_hash(&existing, payload_hash.as_deref())?;
                        saw_live_in_progress = true;
                    }
                }
            }
        }

        if saw_live_in_progress {
            Err(IdempotencyError::AlreadyInProgress(key.to_string()))
        } else {
            Err(IdempotencyError::InconsistentState(
                key.to_string(),
                format!("claim retry budget of {} attempts exhausted", attempts),
            ))
        }
    }

    async fn run_handler<T, E, F, Fut>(
        &self,
        mut record: IdempotencyRecord,
        ctx: &InvocationContext,
        handler: F,
    ) -> std::result::Result<T, ExecutionError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.metrics.record_execution();
        let started = Instant::now();

        match handler().await {
            Ok(response) => {
                get_metrics().record_handler_latency(started.elapsed().as_secs_f64() * 1000.0);

                let data =
                    serde_json::to_value(&response).map_err(IdempotencyError::Serialization)?;
                let now = Utc::now();
                record.complete(data, self.config.expiry_timestamp(now));

                self.store.update_record(&record).await?;
                if let Some(cache) = &self.cache {
                    cache.set(record.clone());
                }
                self.metrics.record_completion();
                get_metrics().record_record_completed();
                tracing::debug!(
                    key = %record.idempotency_key,
                    invocation_id = %ctx.invocation_id,
                    "Stored completed idempotency record"
                );
                Ok(response)
            }
            Err(err) => {
                self.metrics.record_failure();

                // Unblock future retries; the caller sees the original error.
                if let Err(delete_err) = self.store.delete_record(&record.idempotency_key).await {
                    tracing::error!(
                        key = %record.idempotency_key,
                        error = %delete_err,
                        "Failed to delete idempotency record after handler failure"
                    );
                }
                if let Some(cache) = &self.cache {
                    cache.delete(&record.idempotency_key);
                }
                get_metrics().record_record_deleted();
                Err(ExecutionError::Handler(err))
            }
        }
    }
}

/// Payload-hash validation: when both the request and the stored record carry
/// a hash, a mismatch means the key was reused for different content, which
/// is a caller error, never a cache hit.
fn check_payload_hash(record: &IdempotencyRecord, request_hash: Option<&str>) -> Result<()> {
    match (request_hash, record.payload_hash.as_deref()) {
        (Some(request), Some(stored)) if request != stored => {
            Err(IdempotencyError::Validation(format!(
                "idempotency key '{}' reused with a different payload",
                record.idempotency_key
            )))
        }
        _ => Ok(()),
    }
}

fn deserialize_response<T: DeserializeOwned>(
    key: &str,
    data: Option<Value>,
) -> Result<T> {
    let data = data.ok_or_else(|| {
        IdempotencyError::InconsistentState(
            key.to_string(),
            "completed record has no response data".to_string(),
        )
    })?;
    serde_json::from_value(data).map_err(IdempotencyError::Serialization)
}
