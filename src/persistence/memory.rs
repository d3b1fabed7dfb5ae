use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{IdempotencyError, Result};
use crate::persistence::PersistenceStore;
use crate::record::{IdempotencyRecord, RecordStatus};

/// Per-operation call counters, readable from tests.
#[derive(Debug, Default)]
pub struct StoreCallCounts {
    pub gets: AtomicU64,
    pub puts: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
}

impl StoreCallCounts {
    pub fn total(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
            + self.puts.load(Ordering::Relaxed)
            + self.updates.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
    }
}

/// In-process store honoring the same conditional-claim semantics as the
/// remote adapters. Intended for tests and single-process deployments; it is
/// not visible across workers.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    calls: StoreCallCounts,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &StoreCallCounts {
        &self.calls
    }

    /// Drops all records. Test isolation helper.
    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        self.calls.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.lock().unwrap().get(key).cloned())
    }

    async fn put_record(&self, record: &IdempotencyRecord, now: DateTime<Utc>) -> Result<()> {
        self.calls.puts.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();

        if let Some(existing) = records.get(&record.idempotency_key) {
            let reclaimable = existing.is_expired(now) || existing.is_in_progress_expired(now);
            if !reclaimable {
                return Err(IdempotencyError::KeyAlreadyExists(
                    record.idempotency_key.clone(),
                ));
            }
        }

        records.insert(record.idempotency_key.clone(), record.clone());
        Ok(())
    }

    async fn update_record(&self, record: &IdempotencyRecord) -> Result<()> {
        self.calls.updates.fetch_add(1, Ordering::Relaxed);
        let mut records = self.records.lock().unwrap();

        match records.get(&record.idempotency_key) {
            Some(existing) if existing.status == RecordStatus::InProgress => {
                records.insert(record.idempotency_key.clone(), record.clone());
                Ok(())
            }
            Some(_) => Err(IdempotencyError::InconsistentState(
                record.idempotency_key.clone(),
                "record is no longer in progress".to_string(),
            )),
            None => Err(IdempotencyError::InconsistentState(
                record.idempotency_key.clone(),
                "record was removed before update".to_string(),
            )),
        }
    }

    async fn delete_record(&self, key: &str) -> Result<()> {
        self.calls.deletes.fetch_add(1, Ordering::Relaxed);
        self.records.lock().unwrap().remove(key);
        Ok(())
    }
}
