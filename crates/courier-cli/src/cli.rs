//! CLI argument definitions for the `courier` binary.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Courier -- inspect and operate the multi-tenant cache engine.
#[derive(Parser)]
#[command(
    name = "courier",
    version,
    about = "Courier -- multi-tenant cache engine",
    long_about = "Inspect cached user, state, table and agent records, manage expiry \
                  triggers and exchange notifications through the configured backend."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = "courier.toml")]
    pub config: PathBuf,

    /// Override the configured backend (redis, memory, json).
    #[arg(long, global = true)]
    pub backend: Option<String>,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ping every namespace of the configured backend.
    Health,

    /// Print a record as JSON.
    Get {
        #[command(flatten)]
        scope: Scope,
        #[command(subcommand)]
        target: Target,
    },

    /// Merge a JSON object into a record. An empty object deletes it.
    Put {
        #[command(flatten)]
        scope: Scope,
        /// Fields to write, as a JSON object.
        #[arg(long)]
        data: String,
        /// TTL in seconds. Falls back to the configured default.
        #[arg(long)]
        ttl: Option<u64>,
        #[command(subcommand)]
        target: Target,
    },

    /// Delete a record.
    Delete {
        #[command(flatten)]
        scope: Scope,
        #[command(subcommand)]
        target: Target,
    },

    /// Print the remaining TTL of a record (-1 persistent, -2 missing).
    Ttl {
        #[command(flatten)]
        scope: Scope,
        #[command(subcommand)]
        target: Target,
    },

    /// Print every row of a tenant table.
    Rows {
        #[arg(long)]
        tenant: String,
        table: String,
    },

    /// Manage expiry triggers.
    Trigger {
        #[arg(long)]
        tenant: String,
        #[command(subcommand)]
        action: TriggerAction,
    },

    /// Publish a notification.
    Publish {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        user: String,
        /// Event type, e.g. incoming_message or bot_reply.
        event: String,
        /// Event payload as JSON.
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Print notifications for a tenant until interrupted.
    Subscribe {
        #[arg(long)]
        tenant: String,
        /// Only this user's notifications.
        #[arg(long)]
        user: Option<String>,
        /// Only this event type.
        #[arg(long)]
        event: Option<String>,
    },

    /// Print expiry triggers as they fire until interrupted.
    Listen,
}

/// The tenant and user a record belongs to.
#[derive(Args)]
pub struct Scope {
    #[arg(long)]
    pub tenant: String,
    /// Required for every target except tables.
    #[arg(long)]
    pub user: Option<String>,
}

#[derive(Subcommand, Clone)]
pub enum Target {
    /// The user's profile record.
    User,
    /// A flow handler's state record.
    State { handler: String },
    /// An agent's state record.
    Agent { agent: String },
    /// A tenant table row.
    Table { table: String, pkid: String },
}

#[derive(Subcommand)]
pub enum TriggerAction {
    /// Schedule `action` for `identifier` in `ttl` seconds.
    Set {
        action: String,
        identifier: String,
        ttl: u64,
    },
    /// Cancel one trigger.
    Cancel { action: String, identifier: String },
    /// Cancel every trigger for `identifier`.
    CancelAll { identifier: String },
    /// Seconds until a trigger fires.
    Ttl { action: String, identifier: String },
}
