//! Expiry trigger storage.
//!
//! A trigger is a single-value key `trigger:{created_at}` stored with
//! `SETEX` semantics. Its expiration is the firing event; see
//! [`crate::trigger`] for the listener side.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, instrument, warn};

use super::{CacheContext, ExpiryCache};
use crate::backend::{Namespace, RecordRef};
use crate::keys::trigger_partition;

pub(crate) struct TriggerStore {
    ctx: Arc<CacheContext>,
    tenant: String,
    partition: String,
}

impl TriggerStore {
    pub(crate) fn new(ctx: Arc<CacheContext>, tenant: &str) -> Self {
        Self {
            ctx,
            tenant: tenant.to_owned(),
            partition: trigger_partition(tenant),
        }
    }

    fn record(&self, action: &str, identifier: &str) -> RecordRef {
        RecordRef::new(
            Namespace::Expiry,
            self.partition.clone(),
            self.ctx.keys.trigger(&self.tenant, action, identifier),
        )
    }
}

#[async_trait]
impl ExpiryCache for TriggerStore {
    #[instrument(skip(self), fields(tenant = %self.tenant))]
    async fn set(&self, action: &str, identifier: &str, ttl_seconds: u64) -> bool {
        if ttl_seconds == 0 {
            warn!(action, identifier, "trigger needs a positive ttl");
            return false;
        }
        let record = self.record(action, identifier);
        let marker = format!("trigger:{}", Utc::now().to_rfc3339());
        match self
            .ctx
            .backend
            .set_marker(&record, &marker, ttl_seconds)
            .await
        {
            Ok(()) => {
                info!(key = %record.key, ttl_seconds, "trigger armed");
                true
            }
            Err(e) => {
                tracing::error!(key = %record.key, error = %e, "failed to arm trigger");
                false
            }
        }
    }

    async fn exists(&self, action: &str, identifier: &str) -> bool {
        self.ctx.exists(&self.record(action, identifier)).await
    }

    #[instrument(skip(self), fields(tenant = %self.tenant))]
    async fn delete(&self, action: &str, identifier: &str) -> u64 {
        self.ctx.delete(&self.record(action, identifier)).await
    }

    #[instrument(skip(self), fields(tenant = %self.tenant))]
    async fn delete_all_by_identifier(&self, identifier: &str) -> u64 {
        let pattern = self.ctx.keys.trigger_pattern(&self.tenant, identifier);
        self.ctx.delete_matching(Namespace::Expiry, &pattern).await
    }

    async fn get_ttl(&self, action: &str, identifier: &str) -> i64 {
        self.ctx.get_ttl(&self.record(action, identifier)).await
    }
}
