//! Shared operations behind every typed cache.
//!
//! [`CacheContext`] owns the backend, key factory and default TTL. Its
//! methods take a resolved [`RecordRef`] and fold backend errors into the
//! total results the typed caches promise, logging each failure once.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::backend::{Expiry, HashBackend, Namespace, RecordRef, SCAN_BATCH, TTL_MISSING};
use crate::codec::{RawRecord, Record, decode_record, decode_value, encode_record, encode_value};
use crate::error::{StoreError, StoreResult};
use crate::keys::KeyFactory;

pub(crate) struct CacheContext {
    pub(crate) backend: Arc<dyn HashBackend>,
    pub(crate) keys: KeyFactory,
    pub(crate) default_ttl: Option<u64>,
}

impl CacheContext {
    pub(crate) fn new(
        backend: Arc<dyn HashBackend>,
        keys: KeyFactory,
        default_ttl: Option<u64>,
    ) -> Self {
        Self {
            backend,
            keys,
            default_ttl: default_ttl.filter(|t| *t > 0),
        }
    }

    /// Expiry for writes that fall back to the default TTL.
    fn write_expiry(&self, ttl: Option<u64>) -> Expiry {
        match ttl.filter(|t| *t > 0).or(self.default_ttl) {
            Some(secs) => Expiry::Seconds(secs),
            None => Expiry::Keep,
        }
    }

    fn settle<T>(&self, op: &'static str, record: &RecordRef, result: StoreResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(StoreError::NonNumeric { field }) => {
                warn!(
                    backend = self.backend.name(),
                    key = %record.key,
                    field = %field,
                    "{op} rejected: field is not an integer"
                );
                None
            }
            Err(e) => {
                error!(
                    backend = self.backend.name(),
                    key = %record.key,
                    error = %e,
                    "{op} failed"
                );
                None
            }
        }
    }

    // ── single record ────────────────────────────────────────────────

    pub(crate) async fn get(&self, record: &RecordRef) -> Option<Record> {
        let result = self.backend.get_record(record).await;
        self.settle("get", record, result).flatten().map(decode_record)
    }

    /// Merge `data` into the record. An empty `data` deletes the record.
    pub(crate) async fn upsert(&self, record: &RecordRef, data: Record, ttl: Option<u64>) -> bool {
        if data.is_empty() {
            let result = self.backend.delete(record).await;
            return self.settle("upsert", record, result).is_some();
        }
        let result = self
            .backend
            .write_fields(record, encode_record(&data), self.write_expiry(ttl))
            .await;
        let ok = self.settle("upsert", record, result).is_some();
        if ok {
            debug!(key = %record.key, fields = data.len(), "record upserted");
        }
        ok
    }

    pub(crate) async fn get_field(&self, record: &RecordRef, field: &str) -> Option<Value> {
        let result = self.backend.get_field(record, field).await;
        self.settle("get_field", record, result)
            .flatten()
            .map(|raw| decode_value(&raw))
    }

    pub(crate) async fn update_field(
        &self,
        record: &RecordRef,
        field: &str,
        value: Value,
        ttl: Option<u64>,
    ) -> bool {
        let mut fields = RawRecord::new();
        fields.insert(field.to_owned(), encode_value(&value));
        let result = self
            .backend
            .write_fields(record, fields, self.write_expiry(ttl))
            .await;
        self.settle("update_field", record, result).is_some()
    }

    pub(crate) async fn increment_field(
        &self,
        record: &RecordRef,
        field: &str,
        by: i64,
        ttl: Option<u64>,
    ) -> Option<i64> {
        let result = self
            .backend
            .increment_field(record, field, by, self.write_expiry(ttl))
            .await;
        self.settle("increment_field", record, result)
    }

    pub(crate) async fn append_to_list(
        &self,
        record: &RecordRef,
        field: &str,
        value: Value,
        ttl: Option<u64>,
    ) -> bool {
        let result = self
            .backend
            .append_to_list(record, field, value, self.write_expiry(ttl))
            .await;
        self.settle("append_to_list", record, result).is_some()
    }

    pub(crate) async fn delete_field(&self, record: &RecordRef, field: &str) -> bool {
        let result = self.backend.delete_field(record, field).await;
        self.settle("delete_field", record, result).unwrap_or(false)
    }

    pub(crate) async fn exists(&self, record: &RecordRef) -> bool {
        let result = self.backend.exists(record).await;
        self.settle("exists", record, result).unwrap_or(false)
    }

    pub(crate) async fn delete(&self, record: &RecordRef) -> u64 {
        let result = self.backend.delete(record).await;
        self.settle("delete", record, result).unwrap_or(0)
    }

    pub(crate) async fn get_ttl(&self, record: &RecordRef) -> i64 {
        let result = self.backend.ttl(record).await;
        self.settle("get_ttl", record, result).unwrap_or(TTL_MISSING)
    }

    pub(crate) async fn renew_ttl(&self, record: &RecordRef, ttl: u64) -> bool {
        if ttl == 0 {
            warn!(key = %record.key, "renew_ttl needs a positive ttl");
            return false;
        }
        let result = self.backend.expire(record, ttl).await;
        self.settle("renew_ttl", record, result).unwrap_or(false)
    }

    // ── pattern scans ────────────────────────────────────────────────

    /// Every distinct ref matching `pattern`.
    pub(crate) async fn scan_all(
        &self,
        namespace: Namespace,
        pattern: &str,
    ) -> StoreResult<Vec<RecordRef>> {
        let mut refs = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            let page = self
                .backend
                .scan(namespace, pattern, cursor, SCAN_BATCH)
                .await?;
            refs.extend(page.refs.into_iter().filter(|r| seen.insert(r.key.clone())));
            if page.cursor == 0 {
                return Ok(refs);
            }
            cursor = page.cursor;
        }
    }

    /// First record under `pattern` whose `field` equals `value`.
    pub(crate) async fn find_by_field(
        &self,
        namespace: Namespace,
        pattern: &str,
        field: &str,
        value: &Value,
    ) -> Option<Record> {
        match self.find_first(namespace, pattern, field, value).await {
            Ok(found) => found,
            Err(e) => {
                error!(backend = self.backend.name(), pattern, error = %e, "find_by_field failed");
                None
            }
        }
    }

    /// Stops at the first match, so later pages are never fetched.
    async fn find_first(
        &self,
        namespace: Namespace,
        pattern: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Option<Record>> {
        let mut seen = HashSet::new();
        let mut cursor = 0;
        loop {
            let page = self
                .backend
                .scan(namespace, pattern, cursor, SCAN_BATCH)
                .await?;
            for record in page.refs {
                if !seen.insert(record.key.clone()) {
                    continue;
                }
                let Some(raw) = self.backend.get_field(&record, field).await? else {
                    continue;
                };
                if decode_value(&raw) != *value {
                    continue;
                }
                if let Some(found) = self.backend.get_record(&record).await? {
                    return Ok(Some(decode_record(found)));
                }
            }
            if page.cursor == 0 {
                return Ok(None);
            }
            cursor = page.cursor;
        }
    }

    /// Every record under `pattern`.
    pub(crate) async fn get_all(&self, namespace: Namespace, pattern: &str) -> Vec<Record> {
        let refs = match self.scan_all(namespace, pattern).await {
            Ok(refs) => refs,
            Err(e) => {
                error!(backend = self.backend.name(), pattern, error = %e, "get_all failed");
                return Vec::new();
            }
        };
        let mut records = Vec::with_capacity(refs.len());
        for record in &refs {
            if let Some(found) = self.get(record).await {
                records.push(found);
            }
        }
        records
    }

    /// Delete every key under `pattern`. Returns how many were removed.
    pub(crate) async fn delete_matching(&self, namespace: Namespace, pattern: &str) -> u64 {
        let refs = match self.scan_all(namespace, pattern).await {
            Ok(refs) => refs,
            Err(e) => {
                error!(backend = self.backend.name(), pattern, error = %e, "bulk delete failed");
                return 0;
            }
        };
        let mut removed = 0;
        for record in &refs {
            removed += self.delete(record).await;
        }
        debug!(pattern, removed, "bulk delete finished");
        removed
    }
}
