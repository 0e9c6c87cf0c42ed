//! Shared helper functions used across CLI subcommands.

use std::path::Path;

use anyhow::{Context, Result, bail};
use courier_store::{BackendKind, CourierConfig, Record};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Load `.env`, the config file and environment overrides, then apply the
/// `--backend` flag on top.
pub fn load_config(path: &Path, backend: Option<&str>) -> Result<CourierConfig> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let mut config = CourierConfig::load_with_env(path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    if let Some(name) = backend {
        config.store.backend = name
            .parse::<BackendKind>()
            .with_context(|| format!("invalid --backend {name:?}"))?;
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

pub fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render output")?
    );
    Ok(())
}

/// Parse a `--data` argument that must be a JSON object.
pub fn parse_record(raw: &str) -> Result<Record> {
    match serde_json::from_str::<Value>(raw).context("--data is not valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("--data must be a JSON object, got {other}"),
    }
}
