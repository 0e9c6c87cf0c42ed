//! JSON file engine.
//!
//! One document per partition, one directory per namespace:
//!
//! ```text
//! <root>/users/{tenant}_{user}.json
//! <root>/states/{tenant}_{user}.json
//! <root>/ai_states/{tenant}_{user}.json
//! <root>/tables/{tenant}_tables.json
//! <root>/expiry/{tenant}_triggers.json
//! ```
//!
//! Each document is an envelope `{metadata, data}` where `data` maps keys
//! to records carrying their own expiry. The document-level `expires_at` is
//! the latest record expiry (or `null` while any record is persistent), so
//! a whole file whose time has passed is deleted on first read.
//!
//! Writes go to a temporary file in the same directory and are renamed over
//! the target. A per-path async mutex serializes writers to one document;
//! different documents proceed independently. The lock table is shared by
//! every [`FileStore`] in the process and keyed by canonical path, so two
//! stores opened on the same root never interleave read-modify-writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    Expiry, HashBackend, Namespace, RecordRef, ScanPage, TTL_MISSING, TTL_PERSISTENT, page_of,
};
use crate::codec::{RawRecord, append_encoded, increment_encoded};
use crate::error::StoreResult;
use crate::pattern::GlobPattern;

/// File whose presence marks the application root during discovery.
pub const ROOT_MARKER: &str = "courier.toml";

/// Cache directory name under the discovered root.
pub const CACHE_DIR: &str = "cache";

const DOCUMENT_VERSION: &str = "2";
const MARKER_FIELD: &str = "value";

/// Per-document locks for the whole process, keyed by canonical path.
static LOCKS: LazyLock<DashMap<PathBuf, Arc<Mutex<()>>>> = LazyLock::new(DashMap::new);

// ── documents ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    fields: RawRecord,
}

impl StoredRecord {
    fn new() -> Self {
        Self {
            expires_at: None,
            fields: RawRecord::new(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn apply(&mut self, expiry: Expiry, now: DateTime<Utc>) {
        if let Expiry::Seconds(secs) = expiry {
            let delta = i64::try_from(secs).ok().and_then(ChronoDuration::try_seconds);
            self.expires_at = delta.and_then(|d| now.checked_add_signed(d));
        }
    }

    fn ttl(&self, now: DateTime<Utc>) -> i64 {
        match self.expires_at {
            None => TTL_PERSISTENT,
            Some(at) => ((at - now).num_milliseconds().max(0) + 500) / 1000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    metadata: Metadata,
    data: BTreeMap<String, StoredRecord>,
}

impl Document {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            metadata: Metadata {
                created_at: now,
                expires_at: None,
                version: DOCUMENT_VERSION.to_owned(),
            },
            data: BTreeMap::new(),
        }
    }

    /// Latest record expiry, or `None` if any record never expires.
    fn latest_expiry(&self) -> Option<DateTime<Utc>> {
        let mut latest: Option<DateTime<Utc>> = None;
        for record in self.data.values() {
            let at = record.expires_at?;
            latest = Some(latest.map_or(at, |l| l.max(at)));
        }
        latest
    }
}

// ── store ────────────────────────────────────────────────────────────

/// File-persisted store rooted at one cache directory.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<FileInner>,
}

struct FileInner {
    root: PathBuf,
}

impl FileStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// The root is canonicalized so every path handed to the lock table
    /// has symlinks and `..` resolved.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        debug!(root = %root.display(), "file store opened");
        Ok(Self {
            inner: Arc::new(FileInner { root }),
        })
    }

    /// Open a store at the discovered cache root, see [`discover_root`].
    pub fn discover() -> StoreResult<Self> {
        Self::new(discover_root())
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Path of the document holding `partition` in `namespace`.
    pub fn document_path(&self, namespace: Namespace, partition: &str) -> PathBuf {
        self.inner
            .root
            .join(namespace.dir())
            .join(format!("{}.json", file_stem(partition)))
    }

    async fn lock(path: &Path) -> OwnedMutexGuard<()> {
        let lock = LOCKS
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entry for `path` once nobody holds or awaits it.
    fn release(path: &Path) {
        LOCKS.remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Run `f` against the document at `path` under its lock.
    ///
    /// `f` returns its result plus whether it changed the document. Expired
    /// records are purged before `f` runs, and the purge is persisted too.
    async fn transact<T, F>(&self, path: &Path, f: F) -> StoreResult<T>
    where
        T: Send,
        F: FnOnce(&mut Document, DateTime<Utc>) -> StoreResult<(T, bool)> + Send,
    {
        let guard = Self::lock(path).await;
        let result = Self::apply_locked(path, f).await;
        drop(guard);
        Self::release(path);
        result
    }

    async fn apply_locked<T, F>(path: &Path, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Document, DateTime<Utc>) -> StoreResult<(T, bool)>,
    {
        let now = Utc::now();
        let mut doc = load(path, now).await?;

        let before = doc.data.len();
        doc.data.retain(|_, record| !record.is_expired(now));
        let purged = doc.data.len() != before;

        let (value, changed) = f(&mut doc, now)?;
        if changed || purged {
            persist(path, &mut doc).await?;
        }
        Ok(value)
    }

    async fn with_record<T, F>(&self, record: &RecordRef, f: F) -> StoreResult<T>
    where
        T: Send,
        F: FnOnce(&mut Document, DateTime<Utc>) -> StoreResult<(T, bool)> + Send,
    {
        let path = self.document_path(record.namespace, &record.partition);
        self.transact(&path, f).await
    }

    /// Partitions that currently have a document in `namespace`, sorted.
    async fn partitions(&self, namespace: Namespace) -> StoreResult<Vec<String>> {
        let dir = self.inner.root.join(namespace.dir());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut partitions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                partitions.push(stem.to_owned());
            }
        }
        partitions.sort();
        Ok(partitions)
    }
}

async fn load(path: &Path, now: DateTime<Utc>) -> StoreResult<Document> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Document::empty(now)),
        Err(e) => return Err(e.into()),
    };

    let doc: Document = serde_json::from_str(&text)?;
    if doc.metadata.expires_at.is_some_and(|at| at <= now) {
        debug!(path = %path.display(), "document expired, removing");
        remove_if_present(path).await?;
        return Ok(Document::empty(now));
    }
    Ok(doc)
}

async fn persist(path: &Path, doc: &mut Document) -> StoreResult<()> {
    if doc.data.is_empty() {
        return remove_if_present(path).await;
    }

    doc.metadata.expires_at = doc.latest_expiry();
    doc.metadata.version = DOCUMENT_VERSION.to_owned();

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let body = serde_json::to_vec_pretty(doc)?;
    let tmp = path.with_extension(format!("json.{}.tmp", Uuid::now_v7()));
    if let Err(e) = tokio::fs::write(&tmp, &body).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        warn!(path = %path.display(), error = %e, "atomic rename failed");
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> StoreResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Map a partition name onto a safe file stem.
fn file_stem(partition: &str) -> String {
    if partition.is_empty() {
        return "_".to_owned();
    }
    partition
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ── root discovery ───────────────────────────────────────────────────

/// Cache root for the current working directory.
///
/// Walks upward looking for [`ROOT_MARKER`] and uses `<dir>/cache` next to
/// it; falls back to `./cache`.
pub fn discover_root() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    discover_root_from(&cwd)
}

pub fn discover_root_from(start: &Path) -> PathBuf {
    start
        .ancestors()
        .find(|dir| dir.join(ROOT_MARKER).is_file())
        .unwrap_or(start)
        .join(CACHE_DIR)
}

// ── contract ─────────────────────────────────────────────────────────

#[async_trait]
impl HashBackend for FileStore {
    fn name(&self) -> &'static str {
        "json"
    }

    async fn get_record(&self, record: &RecordRef) -> StoreResult<Option<RawRecord>> {
        self.with_record(record, |doc, _| {
            let fields = doc
                .data
                .get(&record.key)
                .map(|r| r.fields.clone())
                .filter(|f| !f.is_empty());
            Ok((fields, false))
        })
        .await
    }

    async fn get_field(&self, record: &RecordRef, field: &str) -> StoreResult<Option<String>> {
        self.with_record(record, |doc, _| {
            let value = doc
                .data
                .get(&record.key)
                .and_then(|r| r.fields.get(field).cloned());
            Ok((value, false))
        })
        .await
    }

    #[instrument(skip(self, fields), fields(key = %record.key))]
    async fn write_fields(
        &self,
        record: &RecordRef,
        fields: RawRecord,
        expiry: Expiry,
    ) -> StoreResult<()> {
        self.with_record(record, |doc, now| {
            if fields.is_empty() {
                let Some(stored) = doc.data.get_mut(&record.key) else {
                    return Ok(((), false));
                };
                stored.apply(expiry, now);
                return Ok(((), true));
            }
            let stored = doc
                .data
                .entry(record.key.clone())
                .or_insert_with(StoredRecord::new);
            stored.fields.extend(fields);
            stored.apply(expiry, now);
            Ok(((), true))
        })
        .await
    }

    async fn increment_field(
        &self,
        record: &RecordRef,
        field: &str,
        by: i64,
        expiry: Expiry,
    ) -> StoreResult<i64> {
        self.with_record(record, |doc, now| {
            let current = doc
                .data
                .get(&record.key)
                .and_then(|r| r.fields.get(field))
                .map(String::as_str);
            let value = increment_encoded(field, current, by)?;
            let stored = doc
                .data
                .entry(record.key.clone())
                .or_insert_with(StoredRecord::new);
            stored.fields.insert(field.to_owned(), value.to_string());
            stored.apply(expiry, now);
            Ok((value, true))
        })
        .await
    }

    async fn append_to_list(
        &self,
        record: &RecordRef,
        field: &str,
        item: Value,
        expiry: Expiry,
    ) -> StoreResult<()> {
        self.with_record(record, |doc, now| {
            let stored = doc
                .data
                .entry(record.key.clone())
                .or_insert_with(StoredRecord::new);
            let updated = append_encoded(field, stored.fields.get(field).map(String::as_str), item);
            stored.fields.insert(field.to_owned(), updated);
            stored.apply(expiry, now);
            Ok(((), true))
        })
        .await
    }

    async fn delete_field(&self, record: &RecordRef, field: &str) -> StoreResult<bool> {
        self.with_record(record, |doc, _| {
            let Some(stored) = doc.data.get_mut(&record.key) else {
                return Ok((false, false));
            };
            let removed = stored.fields.remove(field).is_some();
            if stored.fields.is_empty() {
                doc.data.remove(&record.key);
            }
            Ok((removed, removed))
        })
        .await
    }

    async fn exists(&self, record: &RecordRef) -> StoreResult<bool> {
        self.with_record(record, |doc, _| Ok((doc.data.contains_key(&record.key), false)))
            .await
    }

    async fn delete(&self, record: &RecordRef) -> StoreResult<u64> {
        self.with_record(record, |doc, _| {
            let removed = doc.data.remove(&record.key).is_some();
            Ok((u64::from(removed), removed))
        })
        .await
    }

    async fn ttl(&self, record: &RecordRef) -> StoreResult<i64> {
        self.with_record(record, |doc, now| {
            let ttl = doc
                .data
                .get(&record.key)
                .map_or(TTL_MISSING, |r| r.ttl(now));
            Ok((ttl, false))
        })
        .await
    }

    async fn expire(&self, record: &RecordRef, seconds: u64) -> StoreResult<bool> {
        self.with_record(record, |doc, now| match doc.data.get_mut(&record.key) {
            Some(stored) => {
                stored.apply(Expiry::Seconds(seconds), now);
                Ok((true, true))
            }
            None => Ok((false, false)),
        })
        .await
    }

    async fn scan(
        &self,
        namespace: Namespace,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<ScanPage> {
        let glob = GlobPattern::new(pattern)?;
        let mut matches = Vec::new();
        for partition in self.partitions(namespace).await? {
            let path = self.document_path(namespace, &partition);
            let keys: Vec<String> = self
                .transact(&path, |doc, _| {
                    let keys = doc
                        .data
                        .keys()
                        .filter(|key| glob.matches(key))
                        .cloned()
                        .collect();
                    Ok((keys, false))
                })
                .await?;
            matches.extend(
                keys.into_iter()
                    .map(|key| RecordRef::new(namespace, partition.clone(), key)),
            );
        }
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(page_of(matches, cursor, count))
    }

    async fn set_marker(&self, record: &RecordRef, value: &str, seconds: u64) -> StoreResult<()> {
        self.with_record(record, |doc, now| {
            let mut stored = StoredRecord::new();
            stored.fields.insert(MARKER_FIELD.to_owned(), value.to_owned());
            stored.apply(Expiry::Seconds(seconds), now);
            doc.data.insert(record.key.clone(), stored);
            Ok(((), true))
        })
        .await
    }
}
