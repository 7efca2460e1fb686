use std::env;

use crate::{BlobError, BlobResult};

/// Largest blob content accepted by default (100 MiB).
pub const SIZE_MAXIMUM: u64 = 104_857_600;

/// Content fetches kept in flight by `get_many`.
pub const GET_MANY_CONCURRENCY: usize = 4;

/// Configuration for blob orchestration
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Absolute max size allowed for a single blob's content
    pub size_maximum: u64,

    /// Upper bound on concurrent content fetches when reading many blobs
    pub get_many_concurrency: usize,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            size_maximum: SIZE_MAXIMUM,
            get_many_concurrency: GET_MANY_CONCURRENCY,
        }
    }
}

impl BlobConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set max content size
    pub fn with_size_maximum(mut self, bytes: u64) -> Self {
        self.size_maximum = bytes;
        self
    }

    /// Set the `get_many` concurrency bound (at least 1)
    pub fn with_get_many_concurrency(mut self, concurrency: usize) -> Self {
        self.get_many_concurrency = concurrency.max(1);
        self
    }

    /// Defaults overridden by `DOG_BLOB_SIZE_MAXIMUM` when set.
    pub fn from_env() -> BlobResult<Self> {
        let mut config = Self::default();
        if let Some(size_maximum) = env_parse::<u64>("DOG_BLOB_SIZE_MAXIMUM")? {
            config = config.with_size_maximum(size_maximum);
        }
        Ok(config)
    }
}

/// Read an optional environment variable.
pub(crate) fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Read a required environment variable.
pub(crate) fn env_required(key: &str) -> BlobResult<String> {
    env_optional(key)
        .ok_or_else(|| BlobError::invalid(format!("{} environment variable required", key)))
}

/// Parse an optional environment variable.
pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> BlobResult<Option<T>> {
    env_optional(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| BlobError::invalid(format!("{} has an invalid value '{}'", key, raw)))
        })
        .transpose()
}
