use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use otr_core::{EntityKey, EntityKind, ExternalId, FetchStatus};

use super::{released_status, CompletionOutcome, FetchRecord, FetchStatusStore, STALE_FETCH_ERROR};
use crate::error::StoreError;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process store with one lock per record.
///
/// The map lock is only held to find or insert a record; transitions lock
/// the single record they touch, so unrelated entities never contend.
#[derive(Debug, Default)]
pub struct MemoryFetchStatusStore {
    records: Mutex<HashMap<EntityKey, Arc<Mutex<FetchRecord>>>>,
    next_internal_id: AtomicI64,
}

impl MemoryFetchStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, key: EntityKey) -> Arc<Mutex<FetchRecord>> {
        let mut records = lock(&self.records);
        records
            .entry(key)
            .or_insert_with(|| {
                let internal_id = self.next_internal_id.fetch_add(1, Ordering::Relaxed) + 1;
                Arc::new(Mutex::new(FetchRecord {
                    kind: key.kind,
                    external_id: key.external_id,
                    internal_id,
                    status: FetchStatus::NotFetched,
                    last_attempted_at: None,
                    attempt_count: 0,
                    last_error: None,
                }))
            })
            .clone()
    }

    fn existing(&self, key: EntityKey) -> Result<Arc<Mutex<FetchRecord>>, StoreError> {
        lock(&self.records)
            .get(&key)
            .cloned()
            .ok_or(StoreError::MissingRecord(key))
    }

    /// Number of records created so far.
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FetchStatusStore for MemoryFetchStatusStore {
    async fn get_status(&self, kind: EntityKind, external_id: ExternalId) -> Result<FetchStatus, StoreError> {
        let record = self.record(EntityKey::new(kind, external_id));
        let status = lock(&record).status;
        Ok(status)
    }

    async fn get_record(&self, kind: EntityKind, external_id: ExternalId) -> Result<FetchRecord, StoreError> {
        let record = self.record(EntityKey::new(kind, external_id));
        let snapshot = lock(&record).clone();
        Ok(snapshot)
    }

    async fn try_begin_fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        force: bool,
    ) -> Result<bool, StoreError> {
        let record = self.record(EntityKey::new(kind, external_id));
        let mut record = lock(&record);
        if !record.status.admits_fetch(force) {
            return Ok(false);
        }
        record.status = FetchStatus::Fetching;
        record.last_attempted_at = Some(Utc::now());
        Ok(true)
    }

    async fn complete_fetch(
        &self,
        kind: EntityKind,
        external_id: ExternalId,
        outcome: CompletionOutcome,
    ) -> Result<FetchRecord, StoreError> {
        let key = EntityKey::new(kind, external_id);
        let record = self.existing(key)?;
        let mut record = lock(&record);
        if record.status != FetchStatus::Fetching {
            return Err(StoreError::InvalidTransition {
                key,
                from: record.status,
                to: outcome.status(),
            });
        }
        record.status = outcome.status();
        record.attempt_count += 1;
        record.last_error = outcome.error().map(str::to_string);
        Ok(record.clone())
    }

    async fn release_fetch(&self, kind: EntityKind, external_id: ExternalId) -> Result<FetchRecord, StoreError> {
        let key = EntityKey::new(kind, external_id);
        let record = self.existing(key)?;
        let mut record = lock(&record);
        let to = released_status(record.attempt_count);
        if record.status != FetchStatus::Fetching {
            return Err(StoreError::InvalidTransition {
                key,
                from: record.status,
                to,
            });
        }
        record.status = to;
        Ok(record.clone())
    }

    async fn reset_stale(&self, older_than: Duration) -> Result<Vec<EntityKey>, StoreError> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return Ok(Vec::new());
        };
        let records: Vec<_> = lock(&self.records).values().cloned().collect();

        let mut reset = Vec::new();
        for record in records {
            let mut record = lock(&record);
            let stale = record.status == FetchStatus::Fetching
                && record.last_attempted_at.map_or(true, |at| at <= cutoff);
            if stale {
                record.status = FetchStatus::Error;
                record.attempt_count += 1;
                record.last_error = Some(STALE_FETCH_ERROR.to_string());
                debug!(key = %record.key(), "reset stale fetch");
                reset.push(record.key());
            }
        }
        Ok(reset)
    }
}
