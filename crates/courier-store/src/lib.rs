//! # courier-store
//!
//! Multi-tenant persistence for conversational bots: per-user profiles,
//! per-flow state, tenant tables, agent state and expiry triggers, behind
//! one set of typed cache interfaces and three interchangeable engines.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  CacheEngine ── CacheFactory(tenant, user)           │
//! │    UserCache · StateCache · TableCache               │
//! │    AiStateCache · ExpiryCache                        │
//! ├──────────────────────────────────────────────────────┤
//! │  KeyFactory (canonical keys)   codec (JSON values)   │
//! ├──────────────────────────────────────────────────────┤
//! │  HashBackend: Redis │ MemoryStore │ FileStore         │
//! ├──────────────────────────────────────────────────────┤
//! │  ExpiryListener (fired triggers)   Publisher/Sub     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Cache operations never fail from the caller's point of view: backend
//! errors are logged and reported as `false`, `None`, `0` or
//! [`TTL_MISSING`]. Only configuration and context validation return
//! [`StoreError`].

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod factory;
pub mod keys;
pub mod pattern;
pub mod pubsub;
pub mod trigger;

// ── re-exports ───────────────────────────────────────────────────────

pub use backend::{
    FileStore, HealthCheck, HealthReport, MemoryStore, Namespace, RedisBackend, TTL_MISSING,
    TTL_PERSISTENT,
};
pub use cache::{
    AiStateCache, AiStateCacheExt, ExpiryCache, StateCache, StateCacheExt, TableCache,
    TableCacheExt, UserCache, UserCacheExt,
};
pub use codec::{Reconstruct, Record, SerdeModel, to_record, to_value};
pub use config::{BackendKind, CourierConfig};
pub use engine::{CacheEngine, EngineOptions};
pub use error::{StoreError, StoreResult};
pub use factory::CacheFactory;
pub use keys::{KeyFactory, KeyPrefixes, TriggerKey};
pub use pubsub::{
    EventType, LocalBus, Notification, NotificationBuffer, NotificationStream, Publisher,
    PubSubTransport, RedisTransport, Subscriber,
};
pub use trigger::{ExpiryListener, TriggerHandler, TriggerRegistry};
