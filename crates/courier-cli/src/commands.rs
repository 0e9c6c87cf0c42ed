//! Subcommand implementations.

use anyhow::{Context, Result, bail};
use courier_store::{
    CacheEngine, CacheFactory, EventType, ExpiryListener, Record, TriggerKey, TriggerRegistry,
};
use futures::StreamExt;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::cli::{Scope, Target, TriggerAction};
use crate::helpers::{parse_record, print_json};

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn health(engine: &CacheEngine) -> Result<()> {
    let report = engine.health().await;
    let checks: Vec<Value> = report
        .checks
        .iter()
        .map(|check| {
            json!({
                "namespace": check.namespace.to_string(),
                "latency_ms": check.latency_ms,
                "error": check.error,
            })
        })
        .collect();

    print_json(&json!({
        "backend": report.backend,
        "healthy": report.is_healthy(),
        "checks": checks,
    }))?;

    if !report.is_healthy() {
        bail!("{} backend is unhealthy", report.backend);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

fn factory(engine: &CacheEngine, scope: &Scope) -> Result<CacheFactory> {
    let user = scope
        .user
        .as_deref()
        .context("--user is required for this target")?;
    Ok(engine.factory(&scope.tenant, user)?)
}

pub async fn get(engine: &CacheEngine, scope: &Scope, target: &Target) -> Result<()> {
    let record = match target {
        Target::User => factory(engine, scope)?.create_user_cache().get().await,
        Target::State { handler } => {
            factory(engine, scope)?
                .create_state_cache()
                .get(handler)
                .await
        }
        Target::Agent { agent } => {
            factory(engine, scope)?
                .create_ai_state_cache()
                .get(agent)
                .await
        }
        Target::Table { table, pkid } => {
            engine
                .table_cache(&scope.tenant)?
                .get(table, pkid)
                .await
        }
    };

    match record {
        Some(record) => print_json(&Value::Object(record)),
        None => bail!("record not found"),
    }
}

pub async fn put(
    engine: &CacheEngine,
    scope: &Scope,
    target: &Target,
    data: &str,
    ttl: Option<u64>,
) -> Result<()> {
    let record: Record = parse_record(data)?;
    let stored = match target {
        Target::User => {
            factory(engine, scope)?
                .create_user_cache()
                .upsert(record, ttl)
                .await
        }
        Target::State { handler } => {
            factory(engine, scope)?
                .create_state_cache()
                .upsert(handler, record, ttl)
                .await
        }
        Target::Agent { agent } => {
            factory(engine, scope)?
                .create_ai_state_cache()
                .upsert(agent, record, ttl)
                .await
        }
        Target::Table { table, pkid } => {
            engine
                .table_cache(&scope.tenant)?
                .upsert(table, pkid, record, ttl)
                .await
        }
    };

    if !stored {
        bail!("write was not applied, see the log for details");
    }
    info!(tenant = %scope.tenant, "record stored");
    Ok(())
}

pub async fn delete(engine: &CacheEngine, scope: &Scope, target: &Target) -> Result<()> {
    let removed = match target {
        Target::User => factory(engine, scope)?.create_user_cache().delete().await,
        Target::State { handler } => {
            factory(engine, scope)?
                .create_state_cache()
                .delete(handler)
                .await
        }
        Target::Agent { agent } => {
            factory(engine, scope)?
                .create_ai_state_cache()
                .delete(agent)
                .await
        }
        Target::Table { table, pkid } => {
            engine
                .table_cache(&scope.tenant)?
                .delete(table, pkid)
                .await
        }
    };
    print_json(&json!({ "deleted": removed }))
}

pub async fn ttl(engine: &CacheEngine, scope: &Scope, target: &Target) -> Result<()> {
    let ttl = match target {
        Target::User => factory(engine, scope)?.create_user_cache().get_ttl().await,
        Target::State { handler } => {
            factory(engine, scope)?
                .create_state_cache()
                .get_ttl(handler)
                .await
        }
        Target::Agent { agent } => {
            factory(engine, scope)?
                .create_ai_state_cache()
                .get_ttl(agent)
                .await
        }
        Target::Table { table, pkid } => {
            engine
                .table_cache(&scope.tenant)?
                .get_ttl(table, pkid)
                .await
        }
    };
    print_json(&json!({ "ttl": ttl }))
}

pub async fn rows(engine: &CacheEngine, tenant: &str, table: &str) -> Result<()> {
    let rows = engine.table_cache(tenant)?.get_all(table).await;
    info!(tenant, table, count = rows.len(), "table scanned");
    print_json(&Value::Array(rows.into_iter().map(Value::Object).collect()))
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

pub async fn trigger(engine: &CacheEngine, tenant: &str, action: &TriggerAction) -> Result<()> {
    let triggers = engine.expiry_cache(tenant)?;
    match action {
        TriggerAction::Set {
            action,
            identifier,
            ttl,
        } => {
            if !triggers.set(action, identifier, *ttl).await {
                bail!("trigger was not scheduled");
            }
            print_json(&json!({ "scheduled": true, "fires_in": ttl }))
        }
        TriggerAction::Cancel { action, identifier } => {
            let removed = triggers.delete(action, identifier).await;
            print_json(&json!({ "cancelled": removed }))
        }
        TriggerAction::CancelAll { identifier } => {
            let removed = triggers.delete_all_by_identifier(identifier).await;
            print_json(&json!({ "cancelled": removed }))
        }
        TriggerAction::Ttl { action, identifier } => {
            let ttl = triggers.get_ttl(action, identifier).await;
            print_json(&json!({ "ttl": ttl }))
        }
    }
}

/// Run the expiry listener and print every trigger that fires.
pub async fn listen(engine: &CacheEngine) -> Result<()> {
    engine.start().await?;

    let registry = TriggerRegistry::new();
    registry.set_fallback(|trigger: TriggerKey| async move {
        println!(
            "{}",
            json!({
                "tenant": trigger.tenant,
                "action": trigger.action,
                "identifier": trigger.identifier,
            })
        );
    });

    let listener = ExpiryListener::new(registry, engine.keys().clone());
    let events = engine
        .expired_keys()
        .await
        .context("backend cannot report expirations")?;
    let worker = listener.start(events);

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for ctrl-c")?;

    listener.stop();
    if let Err(e) = worker.await {
        warn!(error = %e, "expiry listener ended abnormally");
    }
    engine.stop().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

pub async fn publish(
    engine: &CacheEngine,
    tenant: &str,
    user: &str,
    event: &str,
    data: &str,
) -> Result<()> {
    let data: Value = serde_json::from_str(data).context("--data is not valid JSON")?;
    let publisher = engine.publisher(tenant, user)?;
    let event = EventType::from(event);
    let receivers = publisher.publish(&event, data).await;
    print_json(&json!({
        "channel": publisher.channel(&event),
        "receivers": receivers,
    }))
}

pub async fn subscribe(
    engine: &CacheEngine,
    tenant: &str,
    user: Option<&str>,
    event: Option<&str>,
) -> Result<()> {
    let event = event.map(EventType::from);
    let mut stream = engine
        .subscriber()
        .subscribe_tenant(tenant, user, event.as_ref())
        .await?;
    info!(tenant, "listening for notifications, ctrl-c to stop");

    loop {
        tokio::select! {
            next = stream.next() => match next {
                Some(notification) => {
                    println!("{}", serde_json::to_string(&notification)?);
                }
                None => {
                    warn!("notification stream closed");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
