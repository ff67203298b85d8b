//! In-memory stand-ins for the durable stores and sinks. They record what they were asked to do
//! and can be switched into failing, so tests can exercise outage paths without Postgres or
//! Redis.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::cursor::{CursorCache, CursorCacheError, CursorPosition, CursorStore, CursorStoreError};
use crate::dlq::{
    DeadLetterEntry, DeadLetterError, DeadLetterStore, FailureClass, ListOptions, ListOrder,
    NewDeadLetter,
};
use crate::sink::{
    CacheInvalidator, GraphSink, IndexChange, RecordSink, SearchSink, SinkError, StorageSink,
};
use crate::transform::CanonicalRecord;
use crate::types::RecordRef;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemoryCursorStore {
    rows: Mutex<HashMap<String, CursorPosition>>,
    writes: AtomicUsize,
    fail: AtomicBool,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Successful upserts so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn sequence(&self, service_name: &str) -> Option<i64> {
        lock(&self.rows).get(service_name).map(|p| p.sequence)
    }

    pub fn set(&self, service_name: &str, sequence: i64) {
        lock(&self.rows).insert(
            service_name.to_owned(),
            CursorPosition {
                sequence,
                last_updated: Utc::now(),
            },
        );
    }

    fn check(&self) -> Result<(), CursorStoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CursorStoreError::Unavailable("memory store switched off".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, service_name: &str) -> Result<Option<CursorPosition>, CursorStoreError> {
        self.check()?;
        Ok(lock(&self.rows).get(service_name).cloned())
    }

    async fn upsert(
        &self,
        service_name: &str,
        sequence: i64,
    ) -> Result<CursorPosition, CursorStoreError> {
        self.check()?;
        let position = CursorPosition {
            sequence,
            last_updated: Utc::now(),
        };
        lock(&self.rows).insert(service_name.to_owned(), position.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(position)
    }
}

#[derive(Default)]
pub struct MemoryCursorCache {
    entries: Mutex<HashMap<String, (i64, Duration)>>,
    fail: AtomicBool,
}

impl MemoryCursorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<(i64, Duration)> {
        lock(&self.entries).get(key).copied()
    }
}

#[async_trait]
impl CursorCache for MemoryCursorCache {
    async fn mirror(
        &self,
        key: &str,
        sequence: i64,
        ttl: Duration,
    ) -> Result<(), CursorCacheError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CursorCacheError::Unavailable("memory cache switched off".to_owned()));
        }
        lock(&self.entries).insert(key.to_owned(), (sequence, ttl));
        Ok(())
    }
}

/// Keeps entries in insertion order, which stands in for `created_at` ordering.
#[derive(Default)]
pub struct MemoryDeadLetterStore {
    entries: Mutex<Vec<DeadLetterEntry>>,
    fail: AtomicBool,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        lock(&self.entries).clone()
    }

    fn check(&self) -> Result<(), DeadLetterError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Unavailable("memory store switched off".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn insert(&self, entry: NewDeadLetter) -> Result<(), DeadLetterError> {
        self.check()?;
        lock(&self.entries).push(DeadLetterEntry {
            id: entry.id,
            seq: entry.seq,
            repo: entry.repo,
            collection: entry.collection,
            payload: entry.payload,
            error_message: entry.error_message,
            error_type: entry.error_type.to_string(),
            retry_count: entry.retry_count,
            created_at: entry.created_at,
            last_retry_at: None,
        });
        Ok(())
    }

    async fn list(&self, options: &ListOptions) -> Result<Vec<DeadLetterEntry>, DeadLetterError> {
        self.check()?;
        let entries = lock(&self.entries);

        let matching = entries.iter().filter(|entry| {
            options
                .collection
                .as_ref()
                .map_or(true, |collection| &entry.collection == collection)
                && options
                    .max_retry_count
                    .map_or(true, |max| entry.retry_count < max)
        });

        let ordered: Vec<&DeadLetterEntry> = match options.order {
            ListOrder::OldestFirst => matching.collect(),
            ListOrder::NewestFirst => matching.rev().collect(),
        };

        Ok(ordered
            .into_iter()
            .skip(options.offset.max(0) as usize)
            .take(options.limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn mark_retried(
        &self,
        id: Uuid,
        error_message: &str,
        error_type: FailureClass,
    ) -> Result<(), DeadLetterError> {
        self.check()?;
        let mut entries = lock(&self.entries);
        let entry = entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or(DeadLetterError::NotFound(id))?;

        entry.retry_count += 1;
        entry.last_retry_at = Some(Utc::now());
        entry.error_message = error_message.to_owned();
        entry.error_type = error_type.to_string();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<(), DeadLetterError> {
        self.check()?;
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        if entries.len() == before {
            return Err(DeadLetterError::NotFound(id));
        }
        Ok(())
    }

    async fn count(&self) -> Result<i64, DeadLetterError> {
        self.check()?;
        Ok(lock(&self.entries).len() as i64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Apply(IndexChange),
    StorageUpsert(String),
    StorageDelete(String),
    SearchIndex(String),
    SearchDelete(String),
    UpsertNode(String),
    DeleteNode(String),
    UpsertEdge { from: String, to: String, uri: String },
    DeleteEdge(String),
    Invalidate(Vec<String>),
}

/// Implements every sink contract and records each call, failed or not, in order.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    fail_next: AtomicUsize,
    fail_always: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        lock(&self.calls).clone()
    }

    /// Fail the next `count` calls, then recover.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn fail_always(&self, fail: bool) {
        self.fail_always.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: SinkCall) -> Result<(), SinkError> {
        lock(&self.calls).push(call);

        let fail_once = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if fail_once || self.fail_always.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable {
                sink: "recording",
                message: "failure injected".to_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn apply(&self, change: &IndexChange) -> Result<(), SinkError> {
        self.record(SinkCall::Apply(change.clone()))
    }
}

#[async_trait]
impl StorageSink for RecordingSink {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), SinkError> {
        self.record(SinkCall::StorageUpsert(record.uri.clone()))
    }

    async fn delete(&self, target: &RecordRef) -> Result<(), SinkError> {
        self.record(SinkCall::StorageDelete(target.uri()))
    }
}

#[async_trait]
impl SearchSink for RecordingSink {
    async fn index(&self, record: &CanonicalRecord) -> Result<(), SinkError> {
        self.record(SinkCall::SearchIndex(record.uri.clone()))
    }

    async fn delete(&self, uri: &str) -> Result<(), SinkError> {
        self.record(SinkCall::SearchDelete(uri.to_owned()))
    }
}

#[async_trait]
impl GraphSink for RecordingSink {
    async fn upsert_node(&self, repo: &str, _: &CanonicalRecord) -> Result<(), SinkError> {
        self.record(SinkCall::UpsertNode(repo.to_owned()))
    }

    async fn delete_node(&self, repo: &str) -> Result<(), SinkError> {
        self.record(SinkCall::DeleteNode(repo.to_owned()))
    }

    async fn upsert_edge(&self, from: &str, to: &str, uri: &str) -> Result<(), SinkError> {
        self.record(SinkCall::UpsertEdge {
            from: from.to_owned(),
            to: to.to_owned(),
            uri: uri.to_owned(),
        })
    }

    async fn delete_edge(&self, uri: &str) -> Result<(), SinkError> {
        self.record(SinkCall::DeleteEdge(uri.to_owned()))
    }
}

#[async_trait]
impl CacheInvalidator for RecordingSink {
    async fn invalidate(&self, keys: &[String]) -> Result<(), SinkError> {
        self.record(SinkCall::Invalidate(keys.to_vec()))
    }
}
