//! Error types for the courier-store crate.
//!
//! Backends return [`StoreError`] via [`StoreResult`]. The typed cache
//! handlers fold these into plain `bool` / `Option` / sentinel results, so
//! only construction and configuration errors ever reach application code.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the cache engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Missing tenant/user context or an invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Redis command or connection failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem operation failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A key or glob pattern could not be interpreted.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// An increment targeted a field that does not hold an integer.
    #[error("field `{field}` does not hold an integer")]
    NonNumeric { field: String },

    /// A record could not be turned into the requested structured type.
    #[error("reconstruct failed: {0}")]
    Reconstruct(String),

    /// The backend reported a failure that has no more specific variant.
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}
