//! Typed cache interfaces.
//!
//! One trait per domain. Every method is total: backend failures come back
//! as `false`, `None`, `0` or [`TTL_MISSING`](crate::backend::TTL_MISSING)
//! and are logged, never raised.
//!
//! TTL arguments are seconds. `None` (or `0`) on any write applies the
//! engine's default TTL. Without a default the current expiry is kept.
//!
//! The `*Ext` traits add typed reads through a [`Reconstruct`] hook and are
//! implemented for every cache, trait objects included.

mod context;
mod expiry;
mod state;
mod table;
mod user;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::codec::{Reconstruct, Record};

pub(crate) use context::CacheContext;
pub(crate) use expiry::TriggerStore;
pub(crate) use state::{AgentDomain, HandlerDomain, NamedRecords};
pub(crate) use table::TableHandler;
pub(crate) use user::UserHandler;

// ── user ─────────────────────────────────────────────────────────────

/// The single profile record of the bound user.
#[async_trait]
pub trait UserCache: Send + Sync {
    async fn get(&self) -> Option<Record>;
    async fn upsert(&self, data: Record, ttl: Option<u64>) -> bool;
    async fn get_field(&self, field: &str) -> Option<Value>;
    async fn update_field(&self, field: &str, value: Value, ttl: Option<u64>) -> bool;
    async fn increment_field(&self, field: &str, by: i64, ttl: Option<u64>) -> Option<i64>;
    async fn append_to_list(&self, field: &str, value: Value, ttl: Option<u64>) -> bool;
    async fn delete_field(&self, field: &str) -> bool;
    async fn exists(&self) -> bool;
    async fn delete(&self) -> u64;
    async fn get_ttl(&self) -> i64;
    async fn renew_ttl(&self, ttl: u64) -> bool;

    /// First user of the tenant whose `field` equals `value`.
    async fn find_by_field(&self, field: &str, value: &Value) -> Option<Record>;
}

// ── handler state ────────────────────────────────────────────────────

/// Named state records of the bound user, one per conversation flow.
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, handler: &str) -> Option<Record>;
    async fn upsert(&self, handler: &str, data: Record, ttl: Option<u64>) -> bool;

    /// Upsert that also stamps `handler_type` and `updated_at`.
    async fn merge(&self, handler: &str, data: Record, ttl: Option<u64>) -> bool;

    async fn get_field(&self, handler: &str, field: &str) -> Option<Value>;
    async fn update_field(&self, handler: &str, field: &str, value: Value, ttl: Option<u64>)
    -> bool;
    async fn increment_field(
        &self,
        handler: &str,
        field: &str,
        by: i64,
        ttl: Option<u64>,
    ) -> Option<i64>;
    async fn append_to_list(
        &self,
        handler: &str,
        field: &str,
        value: Value,
        ttl: Option<u64>,
    ) -> bool;
    async fn delete_field(&self, handler: &str, field: &str) -> bool;
    async fn exists(&self, handler: &str) -> bool;
    async fn delete(&self, handler: &str) -> u64;
    async fn get_ttl(&self, handler: &str) -> i64;
    async fn renew_ttl(&self, handler: &str, ttl: u64) -> bool;
}

// ── agent state ──────────────────────────────────────────────────────

/// Named agent records of the bound user.
#[async_trait]
pub trait AiStateCache: Send + Sync {
    async fn get(&self, agent: &str) -> Option<Record>;
    async fn upsert(&self, agent: &str, data: Record, ttl: Option<u64>) -> bool;

    /// Upsert that also stamps `agent_type` and `updated_at`.
    async fn merge(&self, agent: &str, data: Record, ttl: Option<u64>) -> bool;

    async fn get_field(&self, agent: &str, field: &str) -> Option<Value>;
    async fn update_field(&self, agent: &str, field: &str, value: Value, ttl: Option<u64>) -> bool;
    async fn increment_field(
        &self,
        agent: &str,
        field: &str,
        by: i64,
        ttl: Option<u64>,
    ) -> Option<i64>;
    async fn append_to_list(&self, agent: &str, field: &str, value: Value, ttl: Option<u64>)
    -> bool;
    async fn delete_field(&self, agent: &str, field: &str) -> bool;
    async fn exists(&self, agent: &str) -> bool;
    async fn delete(&self, agent: &str) -> u64;
    async fn get_ttl(&self, agent: &str) -> i64;
    async fn renew_ttl(&self, agent: &str, ttl: u64) -> bool;
}

// ── tables ───────────────────────────────────────────────────────────

/// Tenant-wide rows addressed by table name and primary key.
#[async_trait]
pub trait TableCache: Send + Sync {
    async fn get(&self, table: &str, pkid: &str) -> Option<Record>;
    async fn upsert(&self, table: &str, pkid: &str, data: Record, ttl: Option<u64>) -> bool;
    async fn get_field(&self, table: &str, pkid: &str, field: &str) -> Option<Value>;
    async fn update_field(
        &self,
        table: &str,
        pkid: &str,
        field: &str,
        value: Value,
        ttl: Option<u64>,
    ) -> bool;
    async fn increment_field(
        &self,
        table: &str,
        pkid: &str,
        field: &str,
        by: i64,
        ttl: Option<u64>,
    ) -> Option<i64>;
    async fn append_to_list(
        &self,
        table: &str,
        pkid: &str,
        field: &str,
        value: Value,
        ttl: Option<u64>,
    ) -> bool;
    async fn delete_field(&self, table: &str, pkid: &str, field: &str) -> bool;
    async fn exists(&self, table: &str, pkid: &str) -> bool;
    async fn delete(&self, table: &str, pkid: &str) -> u64;
    async fn get_ttl(&self, table: &str, pkid: &str) -> i64;
    async fn renew_ttl(&self, table: &str, pkid: &str, ttl: u64) -> bool;

    /// First row of `table` whose `field` equals `value`.
    async fn find_by_field(&self, table: &str, field: &str, value: &Value) -> Option<Record>;

    /// Every row of `table`. Scans the whole table.
    async fn get_all(&self, table: &str) -> Vec<Record>;

    /// Delete the row with this primary key from every table.
    async fn delete_all_by_pkid(&self, pkid: &str) -> u64;
}

// ── expiry triggers ──────────────────────────────────────────────────

/// Valueless timers that fire when their TTL runs out.
#[async_trait]
pub trait ExpiryCache: Send + Sync {
    /// Arm (or re-arm) a trigger. `ttl_seconds` must be positive.
    async fn set(&self, action: &str, identifier: &str, ttl_seconds: u64) -> bool;
    async fn exists(&self, action: &str, identifier: &str) -> bool;

    /// Cancel one trigger. Returns `0` if it was not armed.
    async fn delete(&self, action: &str, identifier: &str) -> u64;

    /// Cancel the triggers of every action for `identifier`.
    async fn delete_all_by_identifier(&self, identifier: &str) -> u64;
    async fn get_ttl(&self, action: &str, identifier: &str) -> i64;
}

// ── typed reads ──────────────────────────────────────────────────────

fn rebuild<T, R>(record: Option<Record>, hook: &R) -> Option<T>
where
    R: Reconstruct<T> + ?Sized,
{
    match hook.reconstruct(record?) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "cached record does not fit the requested type");
            None
        }
    }
}

#[async_trait]
pub trait UserCacheExt: UserCache {
    async fn get_as<T, R>(&self, hook: &R) -> Option<T>
    where
        T: Send,
        R: Reconstruct<T> + Sync + ?Sized,
    {
        rebuild(self.get().await, hook)
    }
}

impl<C: UserCache + ?Sized> UserCacheExt for C {}

#[async_trait]
pub trait StateCacheExt: StateCache {
    async fn get_as<T, R>(&self, handler: &str, hook: &R) -> Option<T>
    where
        T: Send,
        R: Reconstruct<T> + Sync + ?Sized,
    {
        rebuild(self.get(handler).await, hook)
    }
}

impl<C: StateCache + ?Sized> StateCacheExt for C {}

#[async_trait]
pub trait AiStateCacheExt: AiStateCache {
    async fn get_as<T, R>(&self, agent: &str, hook: &R) -> Option<T>
    where
        T: Send,
        R: Reconstruct<T> + Sync + ?Sized,
    {
        rebuild(self.get(agent).await, hook)
    }
}

impl<C: AiStateCache + ?Sized> AiStateCacheExt for C {}

#[async_trait]
pub trait TableCacheExt: TableCache {
    async fn get_as<T, R>(&self, table: &str, pkid: &str, hook: &R) -> Option<T>
    where
        T: Send,
        R: Reconstruct<T> + Sync + ?Sized,
    {
        rebuild(self.get(table, pkid).await, hook)
    }

    async fn find_by_field_as<T, R>(
        &self,
        table: &str,
        field: &str,
        value: &Value,
        hook: &R,
    ) -> Option<T>
    where
        T: Send,
        R: Reconstruct<T> + Sync + ?Sized,
    {
        rebuild(self.find_by_field(table, field, value).await, hook)
    }

    /// Rows that fail to reconstruct are skipped.
    async fn get_all_as<T, R>(&self, table: &str, hook: &R) -> Vec<T>
    where
        T: Send,
        R: Reconstruct<T> + Sync + ?Sized,
    {
        self.get_all(table)
            .await
            .into_iter()
            .filter_map(|record| rebuild(Some(record), hook))
            .collect()
    }
}

impl<C: TableCache + ?Sized> TableCacheExt for C {}
