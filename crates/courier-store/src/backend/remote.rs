//! Redis engine.
//!
//! Each namespace lives in its own logical database (see
//! [`Namespace::db`]) so tooling can inspect one domain at a time. Records
//! are Redis hashes; expiry triggers are plain `SETEX` strings.
//!
//! Connections are [`ConnectionManager`]s created lazily, one per database,
//! and shared by every clone of the backend. The owning process id is
//! recorded with them: after a `fork()` the child sees a different id and
//! rebuilds its connections instead of reusing the parent's sockets.
//!
//! Partial failures:
//! - a whole-record write is `MULTI / HSET / EXPIRE / EXEC`. If `EXPIRE`
//!   reports failure the write is reported as failed even though the fields
//!   were stored.
//! - an increment whose expiry refresh fails is reported as failed even
//!   though the counter moved.
//! - an append is read in Rust and committed by a compare-and-set script,
//!   retried while another writer changes the field in between. If the
//!   expiry refresh fails the list was still extended.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::aio::ConnectionManager;
use redis::{ConnectionInfo, IntoConnectionInfo};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tracing::{debug, info, instrument, warn};

use super::{
    Expiry, HashBackend, HealthCheck, HealthReport, Namespace, RecordRef, ScanPage,
};
use crate::codec::{RawRecord, append_encoded};
use crate::error::{StoreError, StoreResult};

/// Increment a hash field and refresh the key's expiry in one step.
///
/// `ARGV[3]` is the expiry in seconds, `0` to leave it unchanged. Returns
/// `{new_value, expire_applied}`.
const INCREMENT_SCRIPT: &str = r"
local value = redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[2])
local applied = 1
local ttl = tonumber(ARGV[3])
if ttl > 0 then
    applied = redis.call('EXPIRE', KEYS[1], ttl)
end
return {value, applied}
";

static INCREMENT: LazyLock<redis::Script> = LazyLock::new(|| redis::Script::new(INCREMENT_SCRIPT));

/// Replace a hash field only if it still holds the value read before.
///
/// `ARGV[2]` is `1` when a value was read (given in `ARGV[3]`), `0` when the
/// field was absent. `ARGV[5]` is the expiry in seconds, `0` to leave it.
/// Returns `1` on success, `0` on conflict, `-1` if the expiry was not set.
const APPEND_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local expected = false
if ARGV[2] == '1' then
    expected = ARGV[3]
end
if current ~= expected then
    return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
local ttl = tonumber(ARGV[5])
if ttl > 0 and redis.call('EXPIRE', KEYS[1], ttl) == 0 then
    return -1
end
return 1
";

static APPEND: LazyLock<redis::Script> = LazyLock::new(|| redis::Script::new(APPEND_SCRIPT));

/// Compare-and-set rounds before an append gives up.
const APPEND_ATTEMPTS: usize = 64;

/// Default upper bound on concurrent in-flight commands.
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;

// ── backend ──────────────────────────────────────────────────────────

/// Redis-backed store. Cheap to clone; clones share connections.
#[derive(Clone)]
pub struct RedisBackend {
    inner: Arc<RedisInner>,
}

struct RedisInner {
    info: ConnectionInfo,
    pool: Mutex<Pool>,
    limiter: Semaphore,
}

struct Pool {
    pid: u32,
    managers: HashMap<u8, ConnectionManager>,
}

impl RedisBackend {
    /// Prepare a backend for `url`. No connection is made until first use.
    ///
    /// `max_connections` bounds the number of commands in flight at once.
    pub fn new(url: &str, max_connections: usize) -> StoreResult<Self> {
        let info = url.into_connection_info()?;
        Ok(Self {
            inner: Arc::new(RedisInner {
                info,
                pool: Mutex::new(Pool {
                    pid: std::process::id(),
                    managers: HashMap::new(),
                }),
                limiter: Semaphore::new(max_connections.max(1)),
            }),
        })
    }

    /// Client bound to the database of `namespace`.
    pub(crate) fn client(&self, namespace: Namespace) -> StoreResult<redis::Client> {
        let mut info = self.inner.info.clone();
        info.redis.db = i64::from(namespace.db());
        Ok(redis::Client::open(info)?)
    }

    /// Shared connection for `namespace`, created on first use.
    pub(crate) async fn connection(&self, namespace: Namespace) -> StoreResult<ConnectionManager> {
        let mut pool = self.inner.pool.lock().await;

        let pid = std::process::id();
        if pool.pid != pid {
            warn!(
                parent_pid = pool.pid,
                pid, "process id changed, discarding inherited redis connections"
            );
            pool.managers.clear();
            pool.pid = pid;
        }

        if let Some(manager) = pool.managers.get(&namespace.db()) {
            return Ok(manager.clone());
        }

        let manager = self.client(namespace)?.get_connection_manager().await?;
        debug!(db = namespace.db(), "redis connection manager created");
        pool.managers.insert(namespace.db(), manager.clone());
        Ok(manager)
    }

    async fn lease(
        &self,
        namespace: Namespace,
    ) -> StoreResult<(SemaphorePermit<'_>, ConnectionManager)> {
        let permit = self
            .inner
            .limiter
            .acquire()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let conn = self.connection(namespace).await?;
        Ok((permit, conn))
    }

    async fn ping(&self, namespace: Namespace) -> StoreResult<()> {
        let (_permit, mut conn) = self.lease(namespace).await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(StoreError::Backend(format!("unexpected PING reply `{reply}`")));
        }
        Ok(())
    }

    /// Open and verify a connection to every namespace database.
    pub async fn connect(&self) -> StoreResult<()> {
        for namespace in Namespace::ALL {
            self.ping(namespace).await?;
        }
        info!(databases = Namespace::ALL.len(), "redis connections verified");
        Ok(())
    }

    /// Probe every namespace database.
    pub async fn health(&self) -> HealthReport {
        let mut checks = Vec::with_capacity(Namespace::ALL.len());
        for namespace in Namespace::ALL {
            let started = Instant::now();
            let result = self.ping(namespace).await;
            checks.push(HealthCheck {
                namespace,
                latency_ms: started.elapsed().as_millis() as u64,
                error: result.err().map(|e| e.to_string()),
            });
        }
        HealthReport {
            backend: "redis",
            checks,
        }
    }

    /// Drop all pooled connections. They are recreated on next use.
    pub async fn close(&self) {
        let mut pool = self.inner.pool.lock().await;
        let count = pool.managers.len();
        pool.managers.clear();
        info!(count, "redis connections closed");
    }

    /// Turn on expired-key events so trigger firings can be observed.
    pub async fn enable_expiry_events(&self) -> StoreResult<()> {
        let (_permit, mut conn) = self.lease(Namespace::Expiry).await?;
        let () = redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("Ex")
            .query_async(&mut conn)
            .await?;
        info!("redis expired-key notifications enabled");
        Ok(())
    }

    /// Stream of keys expiring in the trigger database.
    pub async fn expired_keys(&self) -> StoreResult<BoxStream<'static, String>> {
        let channel = format!("__keyevent@{}__:expired", Namespace::Expiry.db());
        let mut pubsub = self.client(Namespace::Expiry)?.get_async_pubsub().await?;
        pubsub.psubscribe(&channel).await?;
        info!(channel = %channel, "listening for expired keys");

        Ok(pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(key) => Some(key),
                    Err(e) => {
                        warn!(error = %e, "unreadable expiration event");
                        None
                    }
                }
            })
            .boxed())
    }
}

/// `HSET` the fields, then `EXPIRE` if asked, as one transaction.
async fn hset(
    conn: &mut ConnectionManager,
    key: &str,
    fields: &RawRecord,
    expiry: Expiry,
) -> StoreResult<()> {
    if fields.is_empty() {
        if let Expiry::Seconds(secs) = expiry {
            let _: i64 = redis::cmd("EXPIRE").arg(key).arg(secs).query_async(conn).await?;
        }
        return Ok(());
    }

    match expiry {
        Expiry::Keep => {
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            let _: i64 = cmd.query_async(conn).await?;
        }
        Expiry::Seconds(secs) => {
            let mut pipe = redis::pipe();
            pipe.atomic();
            let write = pipe.cmd("HSET").arg(key);
            for (field, value) in fields {
                write.arg(field).arg(value);
            }
            pipe.ignore();
            pipe.cmd("EXPIRE").arg(key).arg(secs);

            let (applied,): (i64,) = pipe.query_async(conn).await?;
            if applied != 1 {
                return Err(StoreError::Backend(format!(
                    "fields stored but expiry not applied to `{key}`"
                )));
            }
        }
    }
    Ok(())
}

fn is_not_integer(err: &redis::RedisError) -> bool {
    err.to_string().contains("not an integer")
}

#[async_trait]
impl HashBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get_record(&self, record: &RecordRef) -> StoreResult<Option<RawRecord>> {
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        let fields: RawRecord = redis::cmd("HGETALL")
            .arg(&record.key)
            .query_async(&mut conn)
            .await?;
        Ok((!fields.is_empty()).then_some(fields))
    }

    async fn get_field(&self, record: &RecordRef, field: &str) -> StoreResult<Option<String>> {
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        let value: Option<String> = redis::cmd("HGET")
            .arg(&record.key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    #[instrument(skip(self, fields), fields(key = %record.key))]
    async fn write_fields(
        &self,
        record: &RecordRef,
        fields: RawRecord,
        expiry: Expiry,
    ) -> StoreResult<()> {
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        hset(&mut conn, &record.key, &fields, expiry).await
    }

    async fn increment_field(
        &self,
        record: &RecordRef,
        field: &str,
        by: i64,
        expiry: Expiry,
    ) -> StoreResult<i64> {
        let ttl = match expiry {
            Expiry::Keep => 0,
            Expiry::Seconds(secs) => secs,
        };
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        let result: Result<(i64, i64), redis::RedisError> = INCREMENT
            .key(&record.key)
            .arg(field)
            .arg(by)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok((value, 1)) => Ok(value),
            Ok((value, _)) => Err(StoreError::Backend(format!(
                "`{}` incremented to {value} but expiry not applied",
                record.key
            ))),
            Err(e) if is_not_integer(&e) => Err(StoreError::NonNumeric {
                field: field.to_owned(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_to_list(
        &self,
        record: &RecordRef,
        field: &str,
        item: Value,
        expiry: Expiry,
    ) -> StoreResult<()> {
        let ttl = match expiry {
            Expiry::Keep => 0,
            Expiry::Seconds(secs) => secs,
        };
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        for attempt in 1..=APPEND_ATTEMPTS {
            let current: Option<String> = redis::cmd("HGET")
                .arg(&record.key)
                .arg(field)
                .query_async(&mut conn)
                .await?;
            let updated = append_encoded(field, current.as_deref(), item.clone());

            let status: i64 = APPEND
                .key(&record.key)
                .arg(field)
                .arg(u8::from(current.is_some()))
                .arg(current.as_deref().unwrap_or_default())
                .arg(updated)
                .arg(ttl)
                .invoke_async(&mut conn)
                .await?;
            match status {
                1 => return Ok(()),
                -1 => {
                    return Err(StoreError::Backend(format!(
                        "`{}` appended but expiry not applied",
                        record.key
                    )));
                }
                _ => debug!(key = %record.key, attempt, "append lost a race, retrying"),
            }
        }
        Err(StoreError::Backend(format!(
            "`{}` append kept conflicting with other writers",
            record.key
        )))
    }

    async fn delete_field(&self, record: &RecordRef, field: &str) -> StoreResult<bool> {
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        let removed: i64 = redis::cmd("HDEL")
            .arg(&record.key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, record: &RecordRef) -> StoreResult<bool> {
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        let count: i64 = redis::cmd("EXISTS")
            .arg(&record.key)
            .query_async(&mut conn)
            .await?;
        Ok(count > 0)
    }

    async fn delete(&self, record: &RecordRef) -> StoreResult<u64> {
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        let removed: u64 = redis::cmd("DEL")
            .arg(&record.key)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn ttl(&self, record: &RecordRef) -> StoreResult<i64> {
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        let ttl: i64 = redis::cmd("TTL")
            .arg(&record.key)
            .query_async(&mut conn)
            .await?;
        Ok(ttl)
    }

    async fn expire(&self, record: &RecordRef, seconds: u64) -> StoreResult<bool> {
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        let applied: i64 = redis::cmd("EXPIRE")
            .arg(&record.key)
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn scan(
        &self,
        namespace: Namespace,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<ScanPage> {
        let (_permit, mut conn) = self.lease(namespace).await?;
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(ScanPage {
            cursor: next,
            refs: keys
                .into_iter()
                .map(|key| RecordRef::new(namespace, String::new(), key))
                .collect(),
        })
    }

    async fn set_marker(&self, record: &RecordRef, value: &str, seconds: u64) -> StoreResult<()> {
        let (_permit, mut conn) = self.lease(record.namespace).await?;
        let () = redis::cmd("SETEX")
            .arg(&record.key)
            .arg(seconds)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{TTL_MISSING, TTL_PERSISTENT};

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
    }

    fn fields(pairs: &[(&str, &str)]) -> RawRecord {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(RedisBackend::new("not a url", 4).is_err());
    }

    #[test]
    fn client_selects_namespace_database() {
        let backend = RedisBackend::new("redis://127.0.0.1:6379/9", 4).unwrap();
        let client = backend.client(Namespace::Tables).unwrap();
        assert_eq!(client.get_connection_info().redis.db, 2);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server; run with --ignored"]
    async fn hash_roundtrip_and_ttl() {
        let backend = RedisBackend::new(&redis_url(), 8).unwrap();
        backend.connect().await.unwrap();
        let key = format!("test-{}:user:1", uuid::Uuid::now_v7());
        let r = RecordRef::new(Namespace::Users, "", key);

        backend.write_fields(&r, fields(&[("a", "1")]), Expiry::Keep).await.unwrap();
        assert_eq!(backend.ttl(&r).await.unwrap(), TTL_PERSISTENT);

        backend
            .write_fields(&r, fields(&[("b", "2")]), Expiry::Seconds(30))
            .await
            .unwrap();
        let record = backend.get_record(&r).await.unwrap().unwrap();
        assert_eq!(record, fields(&[("a", "1"), ("b", "2")]));
        assert!((29..=30).contains(&backend.ttl(&r).await.unwrap()));

        assert_eq!(backend.delete(&r).await.unwrap(), 1);
        assert_eq!(backend.ttl(&r).await.unwrap(), TTL_MISSING);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires a running Redis server; run with --ignored"]
    async fn concurrent_appends_keep_every_item() {
        let backend = RedisBackend::new(&redis_url(), 8).unwrap();
        let key = format!("test-{}:state:1", uuid::Uuid::now_v7());
        let r = RecordRef::new(Namespace::States, "", key);

        let mut tasks = Vec::new();
        for i in 0..24 {
            let backend = backend.clone();
            let r = r.clone();
            tasks.push(tokio::spawn(async move {
                backend
                    .append_to_list(&r, "log", Value::from(i), Expiry::Seconds(30))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let raw = backend.get_field(&r, "log").await.unwrap().unwrap();
        let items: Vec<i64> = serde_json::from_str(&raw).unwrap();
        assert_eq!(items.len(), 24);
        assert!((29..=30).contains(&backend.ttl(&r).await.unwrap()));
        backend.delete(&r).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server; run with --ignored"]
    async fn increment_maps_non_integer_error() {
        let backend = RedisBackend::new(&redis_url(), 8).unwrap();
        let key = format!("test-{}:user:1", uuid::Uuid::now_v7());
        let r = RecordRef::new(Namespace::Users, "", key);

        backend.write_fields(&r, fields(&[("n", "true")]), Expiry::Seconds(30)).await.unwrap();
        let err = backend.increment_field(&r, "n", 1, Expiry::Seconds(30)).await.unwrap_err();
        assert!(matches!(err, StoreError::NonNumeric { .. }));

        assert_eq!(backend.increment_field(&r, "m", 5, Expiry::Seconds(30)).await.unwrap(), 5);
        backend.delete(&r).await.unwrap();
    }
}
