//! User profile cache.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::instrument;

use super::{CacheContext, UserCache};
use crate::backend::{Namespace, RecordRef};
use crate::codec::Record;
use crate::keys::context_partition;

pub(crate) struct UserHandler {
    ctx: Arc<CacheContext>,
    tenant: String,
    user_id: String,
}

impl UserHandler {
    pub(crate) fn new(ctx: Arc<CacheContext>, tenant: &str, user_id: &str) -> Self {
        Self {
            ctx,
            tenant: tenant.to_owned(),
            user_id: user_id.to_owned(),
        }
    }

    fn record(&self) -> RecordRef {
        RecordRef::new(
            Namespace::Users,
            context_partition(&self.tenant, &self.user_id),
            self.ctx.keys.user(&self.tenant, &self.user_id),
        )
    }
}

#[async_trait]
impl UserCache for UserHandler {
    async fn get(&self) -> Option<Record> {
        self.ctx.get(&self.record()).await
    }

    #[instrument(skip(self, data), fields(tenant = %self.tenant, user = %self.user_id))]
    async fn upsert(&self, data: Record, ttl: Option<u64>) -> bool {
        self.ctx.upsert(&self.record(), data, ttl).await
    }

    async fn get_field(&self, field: &str) -> Option<Value> {
        self.ctx.get_field(&self.record(), field).await
    }

    async fn update_field(&self, field: &str, value: Value, ttl: Option<u64>) -> bool {
        self.ctx.update_field(&self.record(), field, value, ttl).await
    }

    async fn increment_field(&self, field: &str, by: i64, ttl: Option<u64>) -> Option<i64> {
        self.ctx.increment_field(&self.record(), field, by, ttl).await
    }

    async fn append_to_list(&self, field: &str, value: Value, ttl: Option<u64>) -> bool {
        self.ctx.append_to_list(&self.record(), field, value, ttl).await
    }

    async fn delete_field(&self, field: &str) -> bool {
        self.ctx.delete_field(&self.record(), field).await
    }

    async fn exists(&self) -> bool {
        self.ctx.exists(&self.record()).await
    }

    #[instrument(skip(self), fields(tenant = %self.tenant, user = %self.user_id))]
    async fn delete(&self) -> u64 {
        self.ctx.delete(&self.record()).await
    }

    async fn get_ttl(&self) -> i64 {
        self.ctx.get_ttl(&self.record()).await
    }

    async fn renew_ttl(&self, ttl: u64) -> bool {
        self.ctx.renew_ttl(&self.record(), ttl).await
    }

    #[instrument(skip(self, value), fields(tenant = %self.tenant))]
    async fn find_by_field(&self, field: &str, value: &Value) -> Option<Record> {
        let pattern = self.ctx.keys.user_pattern(&self.tenant);
        self.ctx
            .find_by_field(Namespace::Users, &pattern, field, value)
            .await
    }
}
