//! Expiry trigger dispatch.
//!
//! A trigger fires when its key expires. [`ExpiryListener`] consumes the
//! engine's stream of expired keys (see
//! [`CacheEngine::expired_keys`](crate::CacheEngine::expired_keys)), parses
//! each one back into a [`TriggerKey`] and runs the handler registered for
//! its action on a task of its own, so a slow handler never holds up the
//! next firing.
//!
//! ```rust,no_run
//! # use courier_store::{CacheEngine, ExpiryListener, TriggerRegistry, TriggerKey};
//! # async fn example(engine: CacheEngine) -> courier_store::StoreResult<()> {
//! let registry = TriggerRegistry::new();
//! registry.register("reminder", |trigger: TriggerKey| async move {
//!     println!("remind {} of {}", trigger.tenant, trigger.identifier);
//! });
//!
//! let listener = ExpiryListener::new(registry, engine.keys().clone());
//! let worker = listener.start(engine.expired_keys().await?);
//! # Ok(()) }
//! ```

use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::keys::{KeyFactory, TriggerKey};

// ── handler ──────────────────────────────────────────────────────────

/// Reaction to a fired trigger.
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn fire(&self, trigger: TriggerKey);
}

#[async_trait]
impl<F, Fut> TriggerHandler for F
where
    F: Fn(TriggerKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn fire(&self, trigger: TriggerKey) {
        (self)(trigger).await;
    }
}

// ── registry ─────────────────────────────────────────────────────────

/// Action name → handler. Cheap to clone; clones share the table.
#[derive(Clone, Default)]
pub struct TriggerRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    handlers: DashMap<String, Arc<dyn TriggerHandler>>,
    fallback: RwLock<Option<Arc<dyn TriggerHandler>>>,
}

impl TriggerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `action`, replacing any previous one.
    pub fn register(&self, action: impl Into<String>, handler: impl TriggerHandler + 'static) {
        let action = action.into();
        info!(action = %action, "trigger handler registered");
        self.inner.handlers.insert(action, Arc::new(handler));
    }

    /// Returns whether a handler was removed.
    pub fn unregister(&self, action: &str) -> bool {
        let removed = self.inner.handlers.remove(action).is_some();
        if removed {
            info!(action, "trigger handler unregistered");
        }
        removed
    }

    /// Handler for actions nobody registered.
    pub fn set_fallback(&self, handler: impl TriggerHandler + 'static) {
        if let Ok(mut slot) = self.inner.fallback.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    pub fn contains(&self, action: &str) -> bool {
        self.inner.handlers.contains_key(action)
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        let mut actions: Vec<String> = self
            .inner
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        actions.sort();
        actions
    }

    fn resolve(&self, action: &str) -> Option<Arc<dyn TriggerHandler>> {
        if let Some(handler) = self.inner.handlers.get(action) {
            return Some(handler.value().clone());
        }
        self.inner
            .fallback
            .read()
            .ok()
            .and_then(|slot| slot.clone())
    }
}

// ── listener ─────────────────────────────────────────────────────────

/// Turns expired keys into handler invocations.
pub struct ExpiryListener {
    registry: TriggerRegistry,
    keys: KeyFactory,
    shutdown: watch::Sender<bool>,
}

impl ExpiryListener {
    #[must_use]
    pub fn new(registry: TriggerRegistry, keys: KeyFactory) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            keys,
            shutdown,
        }
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    /// Spawn the dispatch loop over `events`.
    ///
    /// The task ends after [`stop`](Self::stop) or when the stream ends.
    pub fn start(&self, mut events: BoxStream<'static, String>) -> JoinHandle<()> {
        self.shutdown.send_replace(false);
        let mut shutdown = self.shutdown.subscribe();
        let registry = self.registry.clone();
        let keys = self.keys.clone();

        tokio::spawn(async move {
            info!("expiry listener started");
            loop {
                tokio::select! {
                    event = events.next() => {
                        let Some(key) = event else {
                            warn!("expiration stream ended");
                            break;
                        };
                        dispatch(&registry, &keys, &key);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("expiry listener stopped");
        })
    }

    pub fn stop(&self) {
        info!("expiry listener shutdown requested");
        self.shutdown.send_replace(true);
    }

    /// Dispatch one expired key. Returns the handler task, if any.
    pub fn dispatch(&self, key: &str) -> Option<JoinHandle<()>> {
        dispatch(&self.registry, &self.keys, key)
    }
}

fn dispatch(registry: &TriggerRegistry, keys: &KeyFactory, key: &str) -> Option<JoinHandle<()>> {
    let Some(trigger) = keys.parse_trigger(key) else {
        debug!(key, "expired key is not a trigger");
        return None;
    };
    let Some(handler) = registry.resolve(&trigger.action) else {
        warn!(
            action = %trigger.action,
            identifier = %trigger.identifier,
            "no handler for fired trigger"
        );
        return None;
    };

    info!(
        tenant = %trigger.tenant,
        action = %trigger.action,
        identifier = %trigger.identifier,
        "trigger fired"
    );
    Some(tokio::spawn(async move { handler.fire(trigger).await }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use super::*;

    fn listener() -> ExpiryListener {
        ExpiryListener::new(TriggerRegistry::new(), KeyFactory::default())
    }

    #[tokio::test]
    async fn dispatches_to_registered_action() {
        let listener = listener();
        let (tx, mut rx) = mpsc::unbounded_channel();
        listener.registry().register("reminder", move |trigger: TriggerKey| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(trigger);
            }
        });

        let task = listener.dispatch("acme:EXPTRIGGER:reminder:TXN_1").unwrap();
        task.await.unwrap();
        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.tenant, "acme");
        assert_eq!(fired.identifier, "TXN_1");
    }

    #[tokio::test]
    async fn ignores_non_trigger_and_unknown_actions() {
        let listener = listener();
        listener.registry().register("reminder", |_: TriggerKey| async {});
        assert!(listener.dispatch("acme:user:5511").is_none());
        assert!(listener.dispatch("acme:EXPTRIGGER:unknown:TXN_1").is_none());
    }

    #[tokio::test]
    async fn fallback_catches_unregistered_actions() {
        let listener = listener();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        listener.registry().set_fallback(move |_: TriggerKey| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        listener
            .dispatch("acme:EXPTRIGGER:whatever:X")
            .unwrap()
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_consumes_stream_until_it_ends() {
        let listener = listener();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        listener.registry().register("a", move |_: TriggerKey| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let events = futures::stream::iter(vec![
            "acme:EXPTRIGGER:a:1".to_owned(),
            "acme:EXPTRIGGER:a:2".to_owned(),
            "acme:state:x:1".to_owned(),
        ])
        .boxed();
        listener.start(events).await.unwrap();

        // handler tasks run detached; give them a moment
        for _ in 0..50 {
            if hits.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_ends_worker() {
        let listener = listener();
        let worker = listener.start(futures::stream::pending().boxed());
        listener.stop();
        worker.await.unwrap();
    }

    #[test]
    fn registry_bookkeeping() {
        let registry = TriggerRegistry::new();
        registry.register("b", |_: TriggerKey| async {});
        registry.register("a", |_: TriggerKey| async {});
        assert_eq!(registry.actions(), vec!["a", "b"]);
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert!(!registry.contains("a"));
    }
}
