//! Storage engines behind the typed caches.
//!
//! [`HashBackend`] is the key-level contract: hash records with a
//! whole-record expiry, field access, atomic increments, cursor scans and
//! single-value markers. The typed caches in [`crate::cache`] are written
//! against this trait only, so swapping engines changes nothing a caller
//! can observe.

pub mod file;
pub mod memory;
pub mod remote;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::codec::RawRecord;
use crate::error::StoreResult;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use remote::RedisBackend;

/// `ttl` result for a record that exists without an expiry.
pub const TTL_PERSISTENT: i64 = -1;

/// `ttl` result for a record that does not exist.
pub const TTL_MISSING: i64 = -2;

/// Keys returned per scan page.
pub const SCAN_BATCH: usize = 100;

// ── namespaces ───────────────────────────────────────────────────────

/// Cache domains. Each one is an isolated keyspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Users,
    States,
    Tables,
    Expiry,
    AiState,
}

impl Namespace {
    pub const ALL: [Namespace; 5] = [
        Namespace::Users,
        Namespace::States,
        Namespace::Tables,
        Namespace::Expiry,
        Namespace::AiState,
    ];

    /// Redis logical database holding this domain.
    pub fn db(self) -> u8 {
        match self {
            Namespace::Users => 0,
            Namespace::States => 1,
            Namespace::Tables => 2,
            Namespace::Expiry => 3,
            Namespace::AiState => 4,
        }
    }

    /// Directory name used by the file backend.
    pub fn dir(self) -> &'static str {
        match self {
            Namespace::Users => "users",
            Namespace::States => "states",
            Namespace::Tables => "tables",
            Namespace::Expiry => "expiry",
            Namespace::AiState => "ai_states",
        }
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.db())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

// ── addressing ───────────────────────────────────────────────────────

/// Location of one record.
///
/// `key` is the canonical key from [`crate::keys::KeyFactory`]. `partition`
/// groups records for the memory and file engines and is ignored by Redis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    pub namespace: Namespace,
    pub partition: String,
    pub key: String,
}

impl RecordRef {
    pub fn new(namespace: Namespace, partition: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace,
            partition: partition.into(),
            key: key.into(),
        }
    }
}

/// What a write does to the record's expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Leave the current expiry alone. New records get none.
    Keep,
    /// Expire the whole record this many seconds from now.
    Seconds(u64),
}

/// One page of a cursor scan. A returned cursor of `0` ends the scan.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub cursor: u64,
    pub refs: Vec<RecordRef>,
}

/// A key removed because its expiry passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredKey {
    pub namespace: Namespace,
    pub key: String,
}

// ── health ───────────────────────────────────────────────────────────

/// Result of probing one namespace.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub namespace: Namespace,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Per-namespace health of an engine.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub backend: &'static str,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// A report where every namespace is healthy, for engines without I/O
    /// that can fail independently per namespace.
    pub fn all_ok(backend: &'static str) -> Self {
        Self {
            backend,
            checks: Namespace::ALL
                .iter()
                .map(|&namespace| HealthCheck {
                    namespace,
                    latency_ms: 0,
                    error: None,
                })
                .collect(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.checks.iter().all(|c| c.error.is_none())
    }
}

// ── contract ─────────────────────────────────────────────────────────

/// Key-level operations every storage engine provides.
///
/// Expired records must never be returned by any method, whether or not a
/// background sweep has removed them yet.
#[async_trait]
pub trait HashBackend: Send + Sync {
    /// Short engine name for logs.
    fn name(&self) -> &'static str;

    /// Full record, or `None` if it does not exist.
    async fn get_record(&self, record: &RecordRef) -> StoreResult<Option<RawRecord>>;

    async fn get_field(&self, record: &RecordRef, field: &str) -> StoreResult<Option<String>>;

    /// Merge `fields` into the record, creating it if needed, then apply
    /// `expiry`. Fields not named in `fields` are left untouched.
    async fn write_fields(
        &self,
        record: &RecordRef,
        fields: RawRecord,
        expiry: Expiry,
    ) -> StoreResult<()>;

    /// Atomically add `by` to an integer field and apply `expiry`.
    ///
    /// Fails with [`crate::StoreError::NonNumeric`] and leaves the record
    /// unchanged if the field holds anything but an integer.
    async fn increment_field(
        &self,
        record: &RecordRef,
        field: &str,
        by: i64,
        expiry: Expiry,
    ) -> StoreResult<i64>;

    /// Append `item` to the list in `field`, creating it if absent.
    async fn append_to_list(
        &self,
        record: &RecordRef,
        field: &str,
        item: Value,
        expiry: Expiry,
    ) -> StoreResult<()>;

    /// Remove one field. Returns whether it existed.
    async fn delete_field(&self, record: &RecordRef, field: &str) -> StoreResult<bool>;

    async fn exists(&self, record: &RecordRef) -> StoreResult<bool>;

    /// Remove the record. Returns the number of records removed.
    async fn delete(&self, record: &RecordRef) -> StoreResult<u64>;

    /// Remaining seconds, [`TTL_PERSISTENT`] or [`TTL_MISSING`].
    async fn ttl(&self, record: &RecordRef) -> StoreResult<i64>;

    /// Set a new expiry. Returns `false` if the record does not exist.
    async fn expire(&self, record: &RecordRef, seconds: u64) -> StoreResult<bool>;

    /// One page of keys in `namespace` matching a glob `pattern`.
    async fn scan(
        &self,
        namespace: Namespace,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<ScanPage>;

    /// Create a single-value key that expires after `seconds`.
    async fn set_marker(&self, record: &RecordRef, value: &str, seconds: u64) -> StoreResult<()>;
}

/// Cut one page out of a fully sorted match list using an offset cursor.
pub(crate) fn page_of(mut refs: Vec<RecordRef>, cursor: u64, count: usize) -> ScanPage {
    let start = usize::try_from(cursor).unwrap_or(usize::MAX);
    if start >= refs.len() {
        return ScanPage::default();
    }
    let end = start.saturating_add(count.max(1)).min(refs.len());
    let next = if end < refs.len() { end as u64 } else { 0 };
    let refs = refs.drain(start..end).collect();
    ScanPage { cursor: next, refs }
}
