//! Tenant-wide table rows.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{CacheContext, TableCache};
use crate::backend::{Namespace, RecordRef};
use crate::codec::Record;
use crate::keys::table_partition;

pub(crate) struct TableHandler {
    ctx: Arc<CacheContext>,
    tenant: String,
    partition: String,
}

impl TableHandler {
    pub(crate) fn new(ctx: Arc<CacheContext>, tenant: &str) -> Self {
        Self {
            ctx,
            tenant: tenant.to_owned(),
            partition: table_partition(tenant),
        }
    }

    fn record(&self, table: &str, pkid: &str) -> RecordRef {
        RecordRef::new(
            Namespace::Tables,
            self.partition.clone(),
            self.ctx.keys.table(&self.tenant, table, pkid),
        )
    }
}

#[async_trait]
impl TableCache for TableHandler {
    async fn get(&self, table: &str, pkid: &str) -> Option<Record> {
        self.ctx.get(&self.record(table, pkid)).await
    }

    #[instrument(skip(self, data), fields(tenant = %self.tenant))]
    async fn upsert(&self, table: &str, pkid: &str, data: Record, ttl: Option<u64>) -> bool {
        self.ctx.upsert(&self.record(table, pkid), data, ttl).await
    }

    async fn get_field(&self, table: &str, pkid: &str, field: &str) -> Option<Value> {
        self.ctx.get_field(&self.record(table, pkid), field).await
    }

    async fn update_field(
        &self,
        table: &str,
        pkid: &str,
        field: &str,
        value: Value,
        ttl: Option<u64>,
    ) -> bool {
        self.ctx
            .update_field(&self.record(table, pkid), field, value, ttl)
            .await
    }

    async fn increment_field(
        &self,
        table: &str,
        pkid: &str,
        field: &str,
        by: i64,
        ttl: Option<u64>,
    ) -> Option<i64> {
        self.ctx
            .increment_field(&self.record(table, pkid), field, by, ttl)
            .await
    }

    async fn append_to_list(
        &self,
        table: &str,
        pkid: &str,
        field: &str,
        value: Value,
        ttl: Option<u64>,
    ) -> bool {
        self.ctx
            .append_to_list(&self.record(table, pkid), field, value, ttl)
            .await
    }

    async fn delete_field(&self, table: &str, pkid: &str, field: &str) -> bool {
        self.ctx.delete_field(&self.record(table, pkid), field).await
    }

    async fn exists(&self, table: &str, pkid: &str) -> bool {
        self.ctx.exists(&self.record(table, pkid)).await
    }

    #[instrument(skip(self), fields(tenant = %self.tenant))]
    async fn delete(&self, table: &str, pkid: &str) -> u64 {
        self.ctx.delete(&self.record(table, pkid)).await
    }

    async fn get_ttl(&self, table: &str, pkid: &str) -> i64 {
        self.ctx.get_ttl(&self.record(table, pkid)).await
    }

    async fn renew_ttl(&self, table: &str, pkid: &str, ttl: u64) -> bool {
        self.ctx.renew_ttl(&self.record(table, pkid), ttl).await
    }

    #[instrument(skip(self, value), fields(tenant = %self.tenant))]
    async fn find_by_field(&self, table: &str, field: &str, value: &Value) -> Option<Record> {
        let pattern = self.ctx.keys.table_pattern(&self.tenant, table);
        self.ctx
            .find_by_field(Namespace::Tables, &pattern, field, value)
            .await
    }

    async fn get_all(&self, table: &str) -> Vec<Record> {
        let pattern = self.ctx.keys.table_pattern(&self.tenant, table);
        let rows = self.ctx.get_all(Namespace::Tables, &pattern).await;
        debug!(tenant = %self.tenant, table, rows = rows.len(), "table scanned");
        rows
    }

    #[instrument(skip(self), fields(tenant = %self.tenant))]
    async fn delete_all_by_pkid(&self, pkid: &str) -> u64 {
        let pattern = self.ctx.keys.pkid_pattern(&self.tenant, pkid);
        self.ctx.delete_matching(Namespace::Tables, &pattern).await
    }
}
