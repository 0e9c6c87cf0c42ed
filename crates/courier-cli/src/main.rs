//! CLI entry point for Courier.
//!
//! The `courier` command inspects and edits cached records, manages expiry
//! triggers and bridges notifications for whichever backend the config
//! selects.

mod cli;
mod commands;
mod helpers;

use anyhow::{Context, Result};
use clap::Parser;
use courier_store::CacheEngine;
use tracing::debug;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    helpers::init_tracing(&cli.log_level, cli.json_logs);

    let config = helpers::load_config(&cli.config, cli.backend.as_deref())?;
    let engine = CacheEngine::from_config(&config).context("failed to build cache engine")?;
    debug!(backend = %engine.backend_kind(), "engine ready");

    match &cli.command {
        Commands::Health => commands::health(&engine).await,
        Commands::Get { scope, target } => commands::get(&engine, scope, target).await,
        Commands::Put {
            scope,
            data,
            ttl,
            target,
        } => commands::put(&engine, scope, target, data, *ttl).await,
        Commands::Delete { scope, target } => commands::delete(&engine, scope, target).await,
        Commands::Ttl { scope, target } => commands::ttl(&engine, scope, target).await,
        Commands::Rows { tenant, table } => commands::rows(&engine, tenant, table).await,
        Commands::Trigger { tenant, action } => commands::trigger(&engine, tenant, action).await,
        Commands::Publish {
            tenant,
            user,
            event,
            data,
        } => commands::publish(&engine, tenant, user, event, data).await,
        Commands::Subscribe {
            tenant,
            user,
            event,
        } => commands::subscribe(&engine, tenant, user.as_deref(), event.as_deref()).await,
        Commands::Listen => commands::listen(&engine).await,
    }
}
