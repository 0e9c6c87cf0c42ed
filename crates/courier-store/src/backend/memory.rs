//! In-process memory engine.
//!
//! Layout is `namespace → partition → key → entry`, where an entry holds the
//! encoded fields and an optional expiry instant. Each namespace is its own
//! [`DashMap`], so unrelated domains never contend, and every read-modify-
//! write runs while holding the partition's shard lock.
//!
//! Expiry is enforced twice: every access drops an expired entry before
//! looking at it, and a background sweep (see [`MemoryStore::start`])
//! removes whatever nobody touched and prunes empty partitions. Whichever
//! path removes an entry announces it once on the expiration channel.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::{
    ExpiredKey, Expiry, HashBackend, Namespace, RecordRef, ScanPage, TTL_MISSING, TTL_PERSISTENT,
    page_of,
};
use crate::codec::{RawRecord, append_encoded, increment_encoded};
use crate::error::StoreResult;
use crate::pattern::GlobPattern;

/// Field name holding the value of a marker key.
const MARKER_FIELD: &str = "value";

const EXPIRED_CHANNEL_CAPACITY: usize = 1024;

// ── entries ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    fields: RawRecord,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new() -> Self {
        Self {
            fields: RawRecord::new(),
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn apply(&mut self, expiry: Expiry, now: Instant) {
        if let Expiry::Seconds(secs) = expiry {
            self.expires_at = Some(now + Duration::from_secs(secs));
        }
    }

    fn ttl(&self, now: Instant) -> i64 {
        match self.expires_at {
            None => TTL_PERSISTENT,
            Some(at) => {
                let millis = at.saturating_duration_since(now).as_millis();
                i64::try_from((millis + 500) / 1000).unwrap_or(i64::MAX)
            }
        }
    }
}

type Partition = HashMap<String, Entry>;

// ── store ────────────────────────────────────────────────────────────

/// Shared in-process store. Cheap to clone; all clones see the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    namespaces: [DashMap<String, Partition>; 5],
    expired: broadcast::Sender<ExpiredKey>,
    shutdown: watch::Sender<bool>,
    sweep_interval: Duration,
}

impl MemoryStore {
    /// Create an empty store. The sweep does not run until [`start`].
    ///
    /// [`start`]: MemoryStore::start
    #[must_use]
    pub fn new(sweep_interval: Duration) -> Self {
        let (expired, _) = broadcast::channel(EXPIRED_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(MemoryInner {
                namespaces: std::array::from_fn(|_| DashMap::new()),
                expired,
                shutdown,
                sweep_interval: sweep_interval.max(Duration::from_millis(1)),
            }),
        }
    }

    /// Spawn the background sweep onto the tokio runtime.
    ///
    /// The task exits after [`stop`] or once every handle to the store is
    /// dropped.
    ///
    /// [`stop`]: MemoryStore::stop
    pub fn start(&self) -> JoinHandle<()> {
        self.inner.shutdown.send_replace(false);
        let mut shutdown = self.inner.shutdown.subscribe();
        let weak: Weak<MemoryInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.sweep_interval;

        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "memory sweep worker started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let purged = inner.sweep();
                        if purged > 0 {
                            debug!(purged, "expired entries swept");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("memory sweep worker stopped");
        })
    }

    /// Signal the sweep task to exit.
    pub fn stop(&self) {
        info!("memory sweep shutdown requested");
        self.inner.shutdown.send_replace(true);
    }

    /// Run one sweep pass now. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Receive every key removed because it expired.
    pub fn subscribe_expired(&self) -> broadcast::Receiver<ExpiredKey> {
        self.inner.expired.subscribe()
    }

    /// Number of live keys in one namespace.
    pub fn key_count(&self, namespace: Namespace) -> usize {
        let now = Instant::now();
        self.inner
            .map(namespace)
            .iter()
            .map(|p| p.values().filter(|e| !e.is_expired(now)).count())
            .sum()
    }

    /// Number of partitions currently held in one namespace.
    pub fn partition_count(&self, namespace: Namespace) -> usize {
        self.inner.map(namespace).len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        for map in &self.inner.namespaces {
            map.clear();
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MemoryInner {
    fn map(&self, namespace: Namespace) -> &DashMap<String, Partition> {
        &self.namespaces[namespace.index()]
    }

    fn announce(&self, namespace: Namespace, key: &str) {
        // No receivers is fine: nobody is listening for expirations.
        let _ = self.expired.send(ExpiredKey {
            namespace,
            key: key.to_owned(),
        });
    }

    /// Drop `key` from `partition` if its expiry has passed.
    fn purge_if_expired(&self, namespace: Namespace, partition: &mut Partition, key: &str, now: Instant) {
        if partition.get(key).is_some_and(|e| e.is_expired(now)) {
            partition.remove(key);
            self.announce(namespace, key);
        }
    }

    /// Run `f` on the live entry for `record`, if there is one.
    fn read<T>(&self, record: &RecordRef, f: impl FnOnce(&Entry) -> T) -> Option<T> {
        let now = Instant::now();
        let value = {
            let mut partition = self.map(record.namespace).get_mut(&record.partition)?;
            self.purge_if_expired(record.namespace, &mut *partition, &record.key, now);
            partition.get(&record.key).map(f)
        };
        self.prune(record);
        value
    }

    /// Run `f` on the partition holding `record`, creating it if needed.
    fn write<T>(&self, record: &RecordRef, f: impl FnOnce(&mut Partition, Instant) -> T) -> T {
        let now = Instant::now();
        let value = {
            let mut partition = self
                .map(record.namespace)
                .entry(record.partition.clone())
                .or_default();
            self.purge_if_expired(record.namespace, &mut *partition, &record.key, now);
            f(&mut *partition, now)
        };
        self.prune(record);
        value
    }

    /// Run `f` on the existing partition holding `record`. Never creates one.
    fn modify<T>(
        &self,
        record: &RecordRef,
        f: impl FnOnce(&mut Partition, Instant) -> T,
    ) -> Option<T> {
        let now = Instant::now();
        let value = {
            let mut partition = self.map(record.namespace).get_mut(&record.partition)?;
            self.purge_if_expired(record.namespace, &mut *partition, &record.key, now);
            f(&mut *partition, now)
        };
        self.prune(record);
        Some(value)
    }

    /// Drop the partition holding `record` if nothing is left in it.
    fn prune(&self, record: &RecordRef) {
        self.map(record.namespace)
            .remove_if(&record.partition, |_, partition| partition.is_empty());
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for namespace in Namespace::ALL {
            self.map(namespace).retain(|_, partition| {
                partition.retain(|key, entry| {
                    if entry.is_expired(now) {
                        self.announce(namespace, key);
                        purged += 1;
                        false
                    } else {
                        true
                    }
                });
                !partition.is_empty()
            });
        }
        purged
    }
}

#[async_trait]
impl HashBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_record(&self, record: &RecordRef) -> StoreResult<Option<RawRecord>> {
        Ok(self
            .inner
            .read(record, |e| e.fields.clone())
            .filter(|fields| !fields.is_empty()))
    }

    async fn get_field(&self, record: &RecordRef, field: &str) -> StoreResult<Option<String>> {
        Ok(self
            .inner
            .read(record, |e| e.fields.get(field).cloned())
            .flatten())
    }

    async fn write_fields(
        &self,
        record: &RecordRef,
        fields: RawRecord,
        expiry: Expiry,
    ) -> StoreResult<()> {
        if fields.is_empty() {
            self.inner.modify(record, |partition, now| {
                if let Some(entry) = partition.get_mut(&record.key) {
                    entry.apply(expiry, now);
                }
            });
            return Ok(());
        }
        self.inner.write(record, |partition, now| {
            let entry = partition.entry(record.key.clone()).or_insert_with(Entry::new);
            entry.fields.extend(fields);
            entry.apply(expiry, now);
        });
        Ok(())
    }

    async fn increment_field(
        &self,
        record: &RecordRef,
        field: &str,
        by: i64,
        expiry: Expiry,
    ) -> StoreResult<i64> {
        self.inner.write(record, |partition, now| {
            let current = partition
                .get(&record.key)
                .and_then(|e| e.fields.get(field))
                .map(String::as_str);
            let value = increment_encoded(field, current, by)?;
            let entry = partition.entry(record.key.clone()).or_insert_with(Entry::new);
            entry.fields.insert(field.to_owned(), value.to_string());
            entry.apply(expiry, now);
            Ok(value)
        })
    }

    async fn append_to_list(
        &self,
        record: &RecordRef,
        field: &str,
        item: Value,
        expiry: Expiry,
    ) -> StoreResult<()> {
        self.inner.write(record, |partition, now| {
            let entry = partition.entry(record.key.clone()).or_insert_with(Entry::new);
            let updated = append_encoded(field, entry.fields.get(field).map(String::as_str), item);
            entry.fields.insert(field.to_owned(), updated);
            entry.apply(expiry, now);
        });
        Ok(())
    }

    async fn delete_field(&self, record: &RecordRef, field: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .modify(record, |partition, _| {
                let Some(entry) = partition.get_mut(&record.key) else {
                    return false;
                };
                let removed = entry.fields.remove(field).is_some();
                if entry.fields.is_empty() {
                    partition.remove(&record.key);
                }
                removed
            })
            .unwrap_or(false))
    }

    async fn exists(&self, record: &RecordRef) -> StoreResult<bool> {
        Ok(self.inner.read(record, |_| ()).is_some())
    }

    async fn delete(&self, record: &RecordRef) -> StoreResult<u64> {
        Ok(self
            .inner
            .modify(record, |partition, _| u64::from(partition.remove(&record.key).is_some()))
            .unwrap_or(0))
    }

    async fn ttl(&self, record: &RecordRef) -> StoreResult<i64> {
        let now = Instant::now();
        Ok(self
            .inner
            .read(record, |e| e.ttl(now))
            .unwrap_or(TTL_MISSING))
    }

    async fn expire(&self, record: &RecordRef, seconds: u64) -> StoreResult<bool> {
        Ok(self
            .inner
            .modify(record, |partition, now| match partition.get_mut(&record.key) {
                Some(entry) => {
                    entry.apply(Expiry::Seconds(seconds), now);
                    true
                }
                None => false,
            })
            .unwrap_or(false))
    }

    async fn scan(
        &self,
        namespace: Namespace,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<ScanPage> {
        let glob = GlobPattern::new(pattern)?;
        let now = Instant::now();
        let mut matches: Vec<RecordRef> = Vec::new();
        for partition in self.inner.map(namespace).iter() {
            for (key, entry) in partition.value() {
                if !entry.is_expired(now) && glob.matches(key) {
                    matches.push(RecordRef::new(namespace, partition.key().clone(), key.clone()));
                }
            }
        }
        matches.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(page_of(matches, cursor, count))
    }

    async fn set_marker(&self, record: &RecordRef, value: &str, seconds: u64) -> StoreResult<()> {
        self.inner.write(record, |partition, now| {
            let mut entry = Entry::new();
            entry.fields.insert(MARKER_FIELD.to_owned(), value.to_owned());
            entry.apply(Expiry::Seconds(seconds), now);
            partition.insert(record.key.clone(), entry);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn rec(key: &str) -> RecordRef {
        RecordRef::new(Namespace::States, "acme_5511", key)
    }

    fn fields(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[tokio::test]
    async fn write_merges_fields() {
        let store = MemoryStore::default();
        let r = rec("k");
        store.write_fields(&r, fields(&[("a", "1"), ("b", "2")]), Expiry::Keep).await.unwrap();
        store.write_fields(&r, fields(&[("b", "3")]), Expiry::Keep).await.unwrap();

        let record = store.get_record(&r).await.unwrap().unwrap();
        assert_eq!(record, fields(&[("a", "1"), ("b", "3")]));
    }

    #[tokio::test]
    async fn ttl_three_states() {
        let store = MemoryStore::default();
        let r = rec("k");
        assert_eq!(store.ttl(&r).await.unwrap(), TTL_MISSING);

        store.write_fields(&r, fields(&[("a", "1")]), Expiry::Keep).await.unwrap();
        assert_eq!(store.ttl(&r).await.unwrap(), TTL_PERSISTENT);

        assert!(store.expire(&r, 60).await.unwrap());
        assert_eq!(store.ttl(&r).await.unwrap(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_never_returned() {
        let store = MemoryStore::default();
        let mut expired = store.subscribe_expired();
        let r = rec("k");
        store.write_fields(&r, fields(&[("a", "1")]), Expiry::Seconds(2)).await.unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(store.get_record(&r).await.unwrap().is_none());
        assert!(!store.exists(&r).await.unwrap());
        assert_eq!(store.ttl(&r).await.unwrap(), TTL_MISSING);

        let event = expired.try_recv().unwrap();
        assert_eq!(event.key, "k");
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_entries_and_empty_partitions() {
        let store = MemoryStore::default();
        let mut expired = store.subscribe_expired();
        store.write_fields(&rec("a"), fields(&[("f", "1")]), Expiry::Seconds(1)).await.unwrap();
        store.write_fields(&rec("b"), fields(&[("f", "1")]), Expiry::Keep).await.unwrap();
        store
            .write_fields(
                &RecordRef::new(Namespace::Users, "acme_1", "u"),
                fields(&[("f", "1")]),
                Expiry::Seconds(1),
            )
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.sweep(), 2);
        assert_eq!(store.partition_count(Namespace::Users), 0);
        assert_eq!(store.partition_count(Namespace::States), 1);
        assert_eq!(store.key_count(Namespace::States), 1);

        assert!(expired.try_recv().is_ok());
        assert!(expired.try_recv().is_ok());
        assert!(expired.try_recv().is_err());
    }

    #[tokio::test]
    async fn operations_on_missing_records_leave_no_partitions() {
        let store = MemoryStore::default();
        let r = rec("ghost");

        assert_eq!(store.delete(&r).await.unwrap(), 0);
        assert!(!store.expire(&r, 60).await.unwrap());
        assert!(!store.delete_field(&r, "f").await.unwrap());
        store.write_fields(&r, RawRecord::new(), Expiry::Seconds(60)).await.unwrap();
        assert_eq!(store.partition_count(Namespace::States), 0);

        store.write_fields(&r, fields(&[("f", "true")]), Expiry::Keep).await.unwrap();
        assert!(store.delete_field(&r, "f").await.unwrap());
        assert_eq!(store.partition_count(Namespace::States), 0);

        let fresh = RecordRef::new(Namespace::Users, "acme_9", "u");
        store.write_fields(&fresh, fields(&[("n", "\"x\"")]), Expiry::Keep).await.unwrap();
        assert_eq!(store.delete(&fresh).await.unwrap(), 1);
        assert_eq!(store.partition_count(Namespace::Users), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_runs_until_stopped() {
        let store = MemoryStore::new(Duration::from_millis(100));
        let handle = store.start();
        store.write_fields(&rec("a"), fields(&[("f", "1")]), Expiry::Seconds(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(store.partition_count(Namespace::States), 0);

        store.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn increment_rejects_non_numeric_without_mutation() {
        let store = MemoryStore::default();
        let r = rec("k");
        store.write_fields(&r, fields(&[("n", "\"abc\"")]), Expiry::Keep).await.unwrap();

        let err = store.increment_field(&r, "n", 1, Expiry::Seconds(10)).await.unwrap_err();
        assert!(matches!(err, StoreError::NonNumeric { .. }));
        assert_eq!(store.get_field(&r, "n").await.unwrap().as_deref(), Some("\"abc\""));
        assert_eq!(store.ttl(&r).await.unwrap(), TTL_PERSISTENT);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let store = MemoryStore::default();
        let r = rec("counter");
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            let r = r.clone();
            tasks.push(tokio::spawn(async move {
                store.increment_field(&r, "n", 1, Expiry::Keep).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(store.get_field(&r, "n").await.unwrap().as_deref(), Some("50"));
    }

    #[tokio::test]
    async fn deleting_last_field_removes_record() {
        let store = MemoryStore::default();
        let r = rec("k");
        store.write_fields(&r, fields(&[("a", "1")]), Expiry::Keep).await.unwrap();
        assert!(store.delete_field(&r, "a").await.unwrap());
        assert!(!store.exists(&r).await.unwrap());
        assert!(!store.delete_field(&r, "a").await.unwrap());
    }

    #[tokio::test]
    async fn scan_pages_in_key_order() {
        let store = MemoryStore::default();
        for i in 0..5 {
            let r = RecordRef::new(Namespace::Tables, "acme_tables", format!("acme:df:t:pkid:{i}"));
            store.write_fields(&r, fields(&[("i", "1")]), Expiry::Keep).await.unwrap();
        }
        let other = RecordRef::new(Namespace::Tables, "acme_tables", "acme:df:u:pkid:0");
        store.write_fields(&other, fields(&[("i", "1")]), Expiry::Keep).await.unwrap();

        let first = store.scan(Namespace::Tables, "acme:df:t:pkid:*", 0, 3).await.unwrap();
        assert_eq!(first.refs.len(), 3);
        assert_eq!(first.refs[0].key, "acme:df:t:pkid:0");
        let second = store
            .scan(Namespace::Tables, "acme:df:t:pkid:*", first.cursor, 3)
            .await
            .unwrap();
        assert_eq!(second.refs.len(), 2);
        assert_eq!(second.cursor, 0);
    }

    #[tokio::test]
    async fn marker_replaces_previous_value() {
        let store = MemoryStore::default();
        let r = RecordRef::new(Namespace::Expiry, "acme_triggers", "acme:EXPTRIGGER:a:1");
        store.set_marker(&r, "trigger:one", 30).await.unwrap();
        store.set_marker(&r, "trigger:two", 60).await.unwrap();
        assert_eq!(
            store.get_field(&r, MARKER_FIELD).await.unwrap().as_deref(),
            Some("trigger:two")
        );
        assert_eq!(store.ttl(&r).await.unwrap(), 60);
    }
}
