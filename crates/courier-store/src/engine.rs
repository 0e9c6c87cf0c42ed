//! The long-lived store handle.
//!
//! A [`CacheEngine`] owns one backend for the life of the process, hands
//! out [`CacheFactory`]s bound to a (tenant, user) pair, and runs the
//! backend's background work between [`start`](CacheEngine::start) and
//! [`stop`](CacheEngine::stop).
//!
//! ```rust,no_run
//! use courier_store::{CacheEngine, CourierConfig};
//! use serde_json::json;
//!
//! # async fn example() -> courier_store::StoreResult<()> {
//! let engine = CacheEngine::from_config(&CourierConfig::default())?;
//! engine.start().await?;
//!
//! let caches = engine.factory("acme", "5511999887766")?;
//! let states = caches.create_state_cache();
//! let data = courier_store::to_record(&json!({"step": 1}))?;
//! states.upsert("checkout", data, Some(600)).await;
//!
//! engine.stop().await;
//! # Ok(()) }
//! ```

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backend::{
    ExpiredKey, FileStore, HashBackend, HealthReport, MemoryStore, Namespace, RedisBackend,
};
use crate::cache::{CacheContext, ExpiryCache, TableCache, TableHandler, TriggerStore};
use crate::config::{BackendKind, CourierConfig, DEFAULT_PLATFORM, DEFAULT_TTL_SECS};
use crate::error::{StoreError, StoreResult};
use crate::factory::{CacheFactory, require};
use crate::keys::{KeyFactory, KeyPrefixes};
use crate::pubsub::{LocalBus, PubSubTransport, Publisher, RedisTransport, Subscriber};

/// Settings shared by every backend.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub keys: KeyPrefixes,
    /// Applied to whole-record writes that pass no TTL. `None` disables it.
    pub default_ttl: Option<u64>,
    /// Stamped on published notifications.
    pub platform: String,
    /// Redis only: enable expired-key notifications on start.
    pub enable_expiry_events: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            keys: KeyPrefixes::default(),
            default_ttl: Some(DEFAULT_TTL_SECS),
            platform: DEFAULT_PLATFORM.to_owned(),
            enable_expiry_events: false,
        }
    }
}

impl From<&CourierConfig> for EngineOptions {
    fn from(config: &CourierConfig) -> Self {
        Self {
            keys: config.keys.clone(),
            default_ttl: config.default_ttl(),
            platform: config.pubsub.platform.clone(),
            enable_expiry_events: config.redis.enable_expiry_events,
        }
    }
}

#[derive(Clone)]
enum Store {
    Redis(RedisBackend),
    Memory(MemoryStore),
    File(FileStore),
}

impl Store {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Redis(_) => BackendKind::Redis,
            Self::Memory(_) => BackendKind::Memory,
            Self::File(_) => BackendKind::Json,
        }
    }

    fn as_backend(&self) -> Arc<dyn HashBackend> {
        match self {
            Self::Redis(backend) => Arc::new(backend.clone()),
            Self::Memory(store) => Arc::new(store.clone()),
            Self::File(store) => Arc::new(store.clone()),
        }
    }
}

/// Process-wide store handle. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct CacheEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    store: Store,
    ctx: Arc<CacheContext>,
    options: EngineOptions,
    transport: Arc<dyn PubSubTransport>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Build the backend named by `config`. No connection is made yet.
    pub fn from_config(config: &CourierConfig) -> StoreResult<Self> {
        let options = EngineOptions::from(config);
        let engine = match config.store.backend {
            BackendKind::Redis => Self::redis(
                RedisBackend::new(&config.redis.url, config.redis.max_connections)?,
                options,
            ),
            BackendKind::Memory => Self::memory(MemoryStore::new(config.sweep_interval()), options),
            BackendKind::Json => {
                let store = match &config.file.root {
                    Some(root) => FileStore::new(root)?,
                    None => FileStore::discover()?,
                };
                Self::file(store, options)
            }
        };
        Ok(engine)
    }

    #[must_use]
    pub fn redis(backend: RedisBackend, options: EngineOptions) -> Self {
        let transport = Arc::new(RedisTransport::new(backend.clone()));
        Self::build(Store::Redis(backend), options, transport)
    }

    #[must_use]
    pub fn memory(store: MemoryStore, options: EngineOptions) -> Self {
        Self::build(Store::Memory(store), options, Arc::new(LocalBus::default()))
    }

    #[must_use]
    pub fn file(store: FileStore, options: EngineOptions) -> Self {
        Self::build(Store::File(store), options, Arc::new(LocalBus::default()))
    }

    fn build(store: Store, options: EngineOptions, transport: Arc<dyn PubSubTransport>) -> Self {
        let ctx = Arc::new(CacheContext::new(
            store.as_backend(),
            KeyFactory::new(options.keys.clone()),
            options.default_ttl,
        ));
        Self {
            inner: Arc::new(EngineInner {
                store,
                ctx,
                options,
                transport,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.store.kind()
    }

    pub fn keys(&self) -> &KeyFactory {
        &self.inner.ctx.keys
    }

    pub fn default_ttl(&self) -> Option<u64> {
        self.inner.ctx.default_ttl
    }

    // ── lifecycle ────────────────────────────────────────────────────

    /// Start background work: the memory sweep, or Redis connection checks
    /// (plus expired-key notifications when configured).
    pub async fn start(&self) -> StoreResult<()> {
        match &self.inner.store {
            Store::Memory(store) => self.spawn_sweeper(store)?,
            Store::Redis(backend) => {
                backend.connect().await?;
                if self.inner.options.enable_expiry_events {
                    backend.enable_expiry_events().await?;
                }
            }
            Store::File(store) => {
                info!(root = %store.root().display(), "file store ready");
            }
        }
        info!(backend = %self.backend_kind(), "cache engine started");
        Ok(())
    }

    fn spawn_sweeper(&self, store: &MemoryStore) -> StoreResult<()> {
        let mut slot = self
            .inner
            .sweeper
            .lock()
            .map_err(|_| StoreError::Backend("sweeper slot poisoned".into()))?;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        *slot = Some(store.start());
        Ok(())
    }

    /// Stop background work and release connections.
    pub async fn stop(&self) {
        match &self.inner.store {
            Store::Memory(store) => {
                store.stop();
                let task = self.inner.sweeper.lock().ok().and_then(|mut slot| slot.take());
                if let Some(task) = task {
                    if let Err(e) = task.await {
                        warn!(error = %e, "memory sweep task failed");
                    }
                }
            }
            Store::Redis(backend) => backend.close().await,
            Store::File(_) => {}
        }
        info!(backend = %self.backend_kind(), "cache engine stopped");
    }

    pub async fn health(&self) -> HealthReport {
        match &self.inner.store {
            Store::Redis(backend) => backend.health().await,
            Store::Memory(_) => HealthReport::all_ok("memory"),
            Store::File(store) => {
                let mut report = HealthReport::all_ok("json");
                if let Err(e) = std::fs::create_dir_all(store.root()) {
                    for check in &mut report.checks {
                        check.error = Some(e.to_string());
                    }
                }
                report
            }
        }
    }

    // ── caches ───────────────────────────────────────────────────────

    /// Caches bound to one (tenant, user) pair.
    ///
    /// Fails with [`StoreError::Config`] if either id is blank.
    pub fn factory(&self, tenant: &str, user_id: &str) -> StoreResult<CacheFactory> {
        CacheFactory::new(self.inner.ctx.clone(), tenant, user_id)
    }

    /// Tenant tables without a user context.
    pub fn table_cache(&self, tenant: &str) -> StoreResult<Arc<dyn TableCache>> {
        require("tenant_id", tenant)?;
        Ok(Arc::new(TableHandler::new(self.inner.ctx.clone(), tenant)))
    }

    /// Tenant triggers without a user context.
    pub fn expiry_cache(&self, tenant: &str) -> StoreResult<Arc<dyn ExpiryCache>> {
        require("tenant_id", tenant)?;
        Ok(Arc::new(TriggerStore::new(self.inner.ctx.clone(), tenant)))
    }

    /// Keys expiring in the trigger namespace, as they expire.
    ///
    /// The file backend has no expiration events and returns
    /// [`StoreError::Config`].
    pub async fn expired_keys(&self) -> StoreResult<BoxStream<'static, String>> {
        match &self.inner.store {
            Store::Redis(backend) => backend.expired_keys().await,
            Store::Memory(store) => Ok(memory_expirations(store)),
            Store::File(_) => Err(StoreError::Config(
                "the json backend does not emit expiration events".into(),
            )),
        }
    }

    // ── pub/sub ──────────────────────────────────────────────────────

    /// Publisher for one (tenant, user) pair.
    pub fn publisher(&self, tenant: &str, user_id: &str) -> StoreResult<Publisher> {
        Publisher::new(
            self.inner.transport.clone(),
            self.keys().clone(),
            tenant,
            user_id,
            &self.inner.options.platform,
        )
    }

    pub fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.inner.transport.clone(), self.keys().clone())
    }
}

fn memory_expirations(store: &MemoryStore) -> BoxStream<'static, String> {
    futures::stream::unfold(store.subscribe_expired(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ExpiredKey {
                    namespace: Namespace::Expiry,
                    key,
                }) => return Some((key, rx)),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "expiration events dropped, listener too slow");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::codec::to_record;

    fn memory_engine() -> CacheEngine {
        CacheEngine::memory(MemoryStore::new(Duration::from_secs(1)), EngineOptions::default())
    }

    #[test]
    fn factory_rejects_missing_context() {
        let engine = memory_engine();
        assert!(matches!(engine.factory("", "1"), Err(StoreError::Config(_))));
        assert!(matches!(engine.factory("acme", ""), Err(StoreError::Config(_))));
        assert!(engine.factory("acme", "1").is_ok());
        assert!(engine.table_cache(" ").is_err());
    }

    #[tokio::test]
    async fn from_config_picks_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CourierConfig::default();
        config.store.backend = BackendKind::Json;
        config.file.root = Some(dir.path().to_path_buf());
        let engine = CacheEngine::from_config(&config).unwrap();
        assert_eq!(engine.backend_kind(), BackendKind::Json);
        assert!(engine.expired_keys().await.is_err());
        assert!(engine.health().await.is_healthy());
    }

    #[tokio::test]
    async fn default_ttl_flows_into_caches() {
        let engine = memory_engine();
        let users = engine.factory("acme", "1").unwrap().create_user_cache();
        users.upsert(to_record(&json!({"a": 1})).unwrap(), None).await;
        assert!(users.get_ttl().await > 86_000);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_engine_streams_trigger_expirations() {
        let engine = memory_engine();
        engine.start().await.unwrap();
        let mut expired = engine.expired_keys().await.unwrap();

        let caches = engine.factory("acme", "1").unwrap();
        caches
            .create_user_cache()
            .upsert(to_record(&json!({"a": 1})).unwrap(), Some(1))
            .await;
        caches.create_expiry_cache().set("reminder", "TXN_1", 1).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        let key = expired.next().await.unwrap();
        assert_eq!(key, "acme:EXPTRIGGER:reminder:TXN_1");
        engine.stop().await;
    }

    #[tokio::test]
    async fn start_and_stop_are_repeatable() {
        let engine = memory_engine();
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        engine.stop().await;
        engine.stop().await;
    }
}
