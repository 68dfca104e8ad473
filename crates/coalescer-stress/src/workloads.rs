use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use coalescer_cache::{AsyncMruCache, CacheEntry, CacheError, Fetcher};
use futures::stream::{self, BoxStream, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Workload {
    /// The number of requests in flight at the same time.
    pub concurrency: usize,
    /// Requests are spread uniformly across this many distinct keys.
    pub keys: u64,
    /// How long a single computation takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The share of computations that fail, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
    /// Invalidate keys whose computation failed, so the next request computes them again.
    #[serde(default)]
    pub retry_failures: bool,
}

impl WorkloadsConfig {
    pub fn get(path: &Path) -> Result<Self> {
        let file = fs::File::open(path).context("failed to open workloads file")?;
        Self::from_reader(file)
    }

    fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        let config: Self =
            serde_yaml::from_reader(reader).context("failed to parse workloads YAML")?;
        for (i, workload) in config.workloads.iter().enumerate() {
            workload
                .validate()
                .with_context(|| format!("invalid workload {i}"))?;
        }
        Ok(config)
    }
}

impl Workload {
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.concurrency > 0, "`concurrency` must be at least one");
        anyhow::ensure!(self.keys > 0, "`keys` must be at least one");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.failure_rate),
            "`failure_rate` must be between 0 and 1"
        );
        Ok(())
    }
}

/// Counters shared between a [`SimulatedFetcher`] and the report.
#[derive(Debug, Default)]
pub struct FetchStats {
    pub fetches: AtomicUsize,
    pub failures: AtomicUsize,
}

/// A computation that takes a fixed time and fails at random.
#[derive(Debug)]
pub struct SimulatedFetcher {
    latency: Duration,
    failure_rate: f64,
    stats: Arc<FetchStats>,
}

impl SimulatedFetcher {
    pub fn new(workload: &Workload, stats: Arc<FetchStats>) -> Self {
        Self {
            latency: workload.latency,
            failure_rate: workload.failure_rate,
            stats,
        }
    }
}

impl Fetcher for SimulatedFetcher {
    type Key = u64;
    type Value = u64;

    fn fetch(&self, key: u64) -> BoxStream<'static, CacheEntry<u64>> {
        self.stats.fetches.fetch_add(1, Ordering::Relaxed);
        let fails = rand::rng().random_bool(self.failure_rate);
        let latency = self.latency;
        let stats = Arc::clone(&self.stats);

        stream::once(async move {
            tokio::time::sleep(latency).await;
            if fails {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                return Err(CacheError::Computation(format!("simulated failure of {key}")));
            }
            Ok(key.wrapping_mul(0x9e37_79b9_7f4a_7c15))
        })
        .boxed()
    }
}

/// Requests a random key of the workload from `cache`.
pub async fn process_request(
    cache: &AsyncMruCache<SimulatedFetcher>,
    workload: &Workload,
) -> CacheEntry<u64> {
    let key = rand::rng().random_range(0..workload.keys);
    let result = cache.async_get(key).await;
    if result.is_err() && workload.retry_failures {
        cache.invalidate(&key);
    }
    result
}
