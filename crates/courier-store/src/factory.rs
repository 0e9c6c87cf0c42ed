//! Context-bound cache construction.

use std::sync::Arc;

use crate::cache::{
    AgentDomain, AiStateCache, CacheContext, ExpiryCache, HandlerDomain, NamedRecords, StateCache,
    TableCache, TableHandler, TriggerStore, UserCache, UserHandler,
};
use crate::error::{StoreError, StoreResult};

/// Builds typed caches for one (tenant, user) pair.
///
/// Obtained from [`CacheEngine::factory`](crate::CacheEngine::factory).
/// Construction does no I/O; the caches talk to the engine's backend when
/// they are used.
#[derive(Clone)]
pub struct CacheFactory {
    ctx: Arc<CacheContext>,
    tenant: String,
    user_id: String,
}

impl std::fmt::Debug for CacheFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheFactory")
            .field("backend", &self.ctx.backend.name())
            .field("tenant", &self.tenant)
            .field("user_id", &self.user_id)
            .finish()
    }
}

impl CacheFactory {
    /// Fails with [`StoreError::Config`] if either id is blank.
    pub(crate) fn new(ctx: Arc<CacheContext>, tenant: &str, user_id: &str) -> StoreResult<Self> {
        require("tenant_id", tenant)?;
        require("user_id", user_id)?;
        Ok(Self {
            ctx,
            tenant: tenant.to_owned(),
            user_id: user_id.to_owned(),
        })
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn create_user_cache(&self) -> Arc<dyn UserCache> {
        Arc::new(UserHandler::new(self.ctx.clone(), &self.tenant, &self.user_id))
    }

    pub fn create_state_cache(&self) -> Arc<dyn StateCache> {
        Arc::new(NamedRecords::<HandlerDomain>::new(
            self.ctx.clone(),
            &self.tenant,
            &self.user_id,
        ))
    }

    /// Tables are shared by the whole tenant; the user id is not used.
    pub fn create_table_cache(&self) -> Arc<dyn TableCache> {
        Arc::new(TableHandler::new(self.ctx.clone(), &self.tenant))
    }

    pub fn create_expiry_cache(&self) -> Arc<dyn ExpiryCache> {
        Arc::new(TriggerStore::new(self.ctx.clone(), &self.tenant))
    }

    pub fn create_ai_state_cache(&self) -> Arc<dyn AiStateCache> {
        Arc::new(NamedRecords::<AgentDomain>::new(
            self.ctx.clone(),
            &self.tenant,
            &self.user_id,
        ))
    }
}

pub(crate) fn require(name: &str, value: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::Config(format!("{name} must not be empty")));
    }
    Ok(())
}
