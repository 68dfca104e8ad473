use serde::Deserialize;

use crate::error::ConfigError;

/// Sizing of an [`AsyncMruCache`](crate::AsyncMruCache).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries kept in memory.
    ///
    /// Entries for computations that are still in flight count towards this limit.
    ///
    /// Defaults to `100`.
    pub max_cache_size: usize,

    /// Maximum number of computations running at the same time, across all keys.
    ///
    /// Further computations are queued and admitted in submission order.
    ///
    /// Defaults to `5`.
    pub max_concurrent_fetches: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: 100,
            max_concurrent_fetches: 5,
        }
    }
}

impl CacheConfig {
    /// Checks that the configured limits can be satisfied.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_cache_size == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}
