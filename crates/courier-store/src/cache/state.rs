//! Named per-user records: handler state and agent state.
//!
//! Both domains store one record per `(tenant, name, user)` and differ only
//! in namespace, key marker and the type field stamped by `merge`, so they
//! share [`NamedRecords`] and pick their flavour through [`NamedDomain`].

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::instrument;

use super::{AiStateCache, CacheContext, StateCache};
use crate::backend::{Namespace, RecordRef};
use crate::codec::Record;
use crate::keys::{KeyFactory, context_partition};

pub(crate) trait NamedDomain: Send + Sync + 'static {
    const NAMESPACE: Namespace;
    /// Field `merge` stamps with the record name.
    const TYPE_FIELD: &'static str;

    fn key(keys: &KeyFactory, tenant: &str, name: &str, user_id: &str) -> String;
}

pub(crate) struct HandlerDomain;

impl NamedDomain for HandlerDomain {
    const NAMESPACE: Namespace = Namespace::States;
    const TYPE_FIELD: &'static str = "handler_type";

    fn key(keys: &KeyFactory, tenant: &str, name: &str, user_id: &str) -> String {
        keys.handler(tenant, name, user_id)
    }
}

pub(crate) struct AgentDomain;

impl NamedDomain for AgentDomain {
    const NAMESPACE: Namespace = Namespace::AiState;
    const TYPE_FIELD: &'static str = "agent_type";

    fn key(keys: &KeyFactory, tenant: &str, name: &str, user_id: &str) -> String {
        keys.aistate(tenant, name, user_id)
    }
}

pub(crate) struct NamedRecords<D> {
    ctx: Arc<CacheContext>,
    tenant: String,
    user_id: String,
    partition: String,
    _domain: PhantomData<D>,
}

impl<D: NamedDomain> NamedRecords<D> {
    pub(crate) fn new(ctx: Arc<CacheContext>, tenant: &str, user_id: &str) -> Self {
        Self {
            ctx,
            tenant: tenant.to_owned(),
            user_id: user_id.to_owned(),
            partition: context_partition(tenant, user_id),
            _domain: PhantomData,
        }
    }

    fn record(&self, name: &str) -> RecordRef {
        RecordRef::new(
            D::NAMESPACE,
            self.partition.clone(),
            D::key(&self.ctx.keys, &self.tenant, name, &self.user_id),
        )
    }

    async fn merge_stamped(&self, name: &str, mut data: Record, ttl: Option<u64>) -> bool {
        data.insert(D::TYPE_FIELD.to_owned(), Value::String(name.to_owned()));
        data.insert("updated_at".to_owned(), Value::String(Utc::now().to_rfc3339()));
        self.ctx.upsert(&self.record(name), data, ttl).await
    }
}

/// Forward a named-record trait to the shared implementation.
macro_rules! forward_named_cache {
    ($cache:ident, $domain:ty) => {
        #[async_trait]
        impl $cache for NamedRecords<$domain> {
            async fn get(&self, name: &str) -> Option<Record> {
                self.ctx.get(&self.record(name)).await
            }

            #[instrument(skip(self, data), fields(tenant = %self.tenant, user = %self.user_id))]
            async fn upsert(&self, name: &str, data: Record, ttl: Option<u64>) -> bool {
                self.ctx.upsert(&self.record(name), data, ttl).await
            }

            #[instrument(skip(self, data), fields(tenant = %self.tenant, user = %self.user_id))]
            async fn merge(&self, name: &str, data: Record, ttl: Option<u64>) -> bool {
                self.merge_stamped(name, data, ttl).await
            }

            async fn get_field(&self, name: &str, field: &str) -> Option<Value> {
                self.ctx.get_field(&self.record(name), field).await
            }

            async fn update_field(
                &self,
                name: &str,
                field: &str,
                value: Value,
                ttl: Option<u64>,
            ) -> bool {
                self.ctx
                    .update_field(&self.record(name), field, value, ttl)
                    .await
            }

            async fn increment_field(
                &self,
                name: &str,
                field: &str,
                by: i64,
                ttl: Option<u64>,
            ) -> Option<i64> {
                self.ctx
                    .increment_field(&self.record(name), field, by, ttl)
                    .await
            }

            async fn append_to_list(
                &self,
                name: &str,
                field: &str,
                value: Value,
                ttl: Option<u64>,
            ) -> bool {
                self.ctx
                    .append_to_list(&self.record(name), field, value, ttl)
                    .await
            }

            async fn delete_field(&self, name: &str, field: &str) -> bool {
                self.ctx.delete_field(&self.record(name), field).await
            }

            async fn exists(&self, name: &str) -> bool {
                self.ctx.exists(&self.record(name)).await
            }

            #[instrument(skip(self), fields(tenant = %self.tenant, user = %self.user_id))]
            async fn delete(&self, name: &str) -> u64 {
                self.ctx.delete(&self.record(name)).await
            }

            async fn get_ttl(&self, name: &str) -> i64 {
                self.ctx.get_ttl(&self.record(name)).await
            }

            async fn renew_ttl(&self, name: &str, ttl: u64) -> bool {
                self.ctx.renew_ttl(&self.record(name), ttl).await
            }
        }
    };
}

forward_named_cache!(StateCache, HandlerDomain);
forward_named_cache!(AiStateCache, AgentDomain);
