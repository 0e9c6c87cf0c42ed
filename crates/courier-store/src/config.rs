//! Engine configuration.
//!
//! Loaded from a TOML file (`courier.toml` by default) and then overridden
//! by environment variables. Every section and field is optional.
//!
//! ```toml
//! [store]
//! backend = "redis"
//! default_ttl_secs = 3600
//!
//! [redis]
//! url = "redis://localhost:6379"
//! max_connections = 50
//! enable_expiry_events = true
//!
//! [memory]
//! sweep_interval_secs = 300
//!
//! [file]
//! root = "/var/lib/courier/cache"
//!
//! [keys]
//! table = "df"
//!
//! [pubsub]
//! platform = "whatsapp"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::backend::remote::DEFAULT_MAX_CONNECTIONS;
use crate::error::{StoreError, StoreResult};
use crate::keys::KeyPrefixes;

/// Default TTL applied to whole-record writes that pass none.
pub const DEFAULT_TTL_SECS: u64 = 86_400;

/// Default interval between memory sweeps.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

pub const DEFAULT_PLATFORM: &str = "whatsapp";

/// Which engine stores the records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    #[default]
    Memory,
    #[serde(alias = "file")]
    Json,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Memory => "memory",
            Self::Json => "json",
        }
    }
}

impl FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            "json" | "file" => Ok(Self::Json),
            other => Err(StoreError::Config(format!(
                "unknown backend `{other}` (expected redis, memory or json)"
            ))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── sections ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: BackendKind,
    /// `0` disables the default TTL.
    pub default_ttl_secs: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            default_ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSection {
    pub url: String,
    pub max_connections: usize,
    /// Run `CONFIG SET notify-keyspace-events Ex` on start.
    pub enable_expiry_events: bool,
}

impl Default for RedisSection {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_owned(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            enable_expiry_events: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub sweep_interval_secs: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileSection {
    /// Cache root. Discovered from the working directory when unset.
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PubSubSection {
    pub platform: String,
}

impl Default for PubSubSection {
    fn default() -> Self {
        Self {
            platform: DEFAULT_PLATFORM.to_owned(),
        }
    }
}

// ── config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub store: StoreSection,
    pub redis: RedisSection,
    pub memory: MemorySection,
    pub file: FileSection,
    pub keys: KeyPrefixes,
    pub pubsub: PubSubSection,
}

impl CourierConfig {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> StoreResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&content)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), backend = %config.store.backend, "configuration loaded");
        Ok(config)
    }

    /// Load `path` and apply the process environment on top.
    pub fn load_with_env(path: impl AsRef<Path>) -> StoreResult<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, usually the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> StoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(backend) = var("COURIER_BACKEND") {
            self.store.backend = backend.parse()?;
        }
        if let Some(url) = var("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(max) = var("REDIS_MAX_CONNECTIONS") {
            self.redis.max_connections = parse_number("REDIS_MAX_CONNECTIONS", &max)?;
        }
        if let Some(ttl) = var("COURIER_DEFAULT_TTL") {
            self.store.default_ttl_secs = parse_number("COURIER_DEFAULT_TTL", &ttl)?;
        }
        if let Some(dir) = var("COURIER_CACHE_DIR") {
            self.file.root = Some(PathBuf::from(dir));
        }
        if let Some(secs) = var("COURIER_SWEEP_INTERVAL") {
            self.memory.sweep_interval_secs = parse_number("COURIER_SWEEP_INTERVAL", &secs)?;
        }
        Ok(())
    }

    /// `None` when default TTLs are disabled.
    pub fn default_ttl(&self) -> Option<u64> {
        Some(self.store.default_ttl_secs).filter(|secs| *secs > 0)
    }

    pub fn sweep_interval(&self) -> Duration {
        if self.memory.sweep_interval_secs == 0 {
            warn!("sweep interval of 0 is not allowed, using the default");
            return Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS);
        }
        Duration::from_secs(self.memory.sweep_interval_secs)
    }
}

fn parse_number<T: FromStr>(name: &str, raw: &str) -> StoreResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| StoreError::Config(format!("{name} must be a non-negative integer, got `{raw}`")))
}
