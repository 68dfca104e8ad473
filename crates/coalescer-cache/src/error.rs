use thiserror::Error;

/// An error that happens while computing a cached value.
///
/// This error is stored in [`Broadcast`](crate::Broadcast) channels and replayed to every
/// subscriber of a failed computation, which is why it is cheaply [`Clone`]able.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The computation itself failed.
    ///
    /// The attached string contains the rendered error of the computation.
    #[error("computation failed: {0}")]
    Computation(String),
    /// The computation finished without ever producing a value.
    #[error("computation completed without a value")]
    Empty,
    /// The computation went away without resolving its result.
    ///
    /// This happens when the computation task panicked, or the runtime it was spawned on was
    /// shut down before it finished.
    #[error("computation channel dropped")]
    Cancelled,
}

impl CacheError {
    /// Creates a [`Computation`](Self::Computation) error out of any error type.
    ///
    /// The full error chain is logged before it is flattened into a string.
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "Computation failed");
        Self::Computation(e.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

/// The outcome of a cached computation, either `Ok(T)` or the reason it failed.
pub type CacheEntry<T> = Result<T, CacheError>;

/// An invalid cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The cache would not be able to hold a single entry.
    #[error("`max_cache_size` must be greater than zero")]
    ZeroCacheSize,
    /// No computation would ever be admitted.
    #[error("`max_concurrent_fetches` must be at least one")]
    ZeroConcurrency,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such key");
        let err = CacheError::from(err);

        assert_eq!(err, CacheError::Computation("no such key".into()));
        assert_eq!(err.to_string(), "computation failed: no such key");
    }
}
