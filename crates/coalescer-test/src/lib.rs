//! Helpers for testing the caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Count invocations of a computation with a [`HitCounter`] that is moved into the
//!    computation, and assert on it after all results have been awaited.
//!
//!  - Wrap the body of a computation in [`ConcurrencyProbe::enter`] to find out how many of
//!    them ran at the same time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `coalescer_cache` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalescer_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts how often a computation was invoked, per key.
///
/// Clones share the same counts.
#[derive(Clone, Debug, Default)]
pub struct HitCounter {
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one invocation for `key`.
    pub fn hit(&self, key: impl ToString) {
        let mut hits = self.hits.lock().unwrap();
        *hits.entry(key.to_string()).or_default() += 1;
    }

    /// The number of invocations recorded for `key`.
    pub fn get(&self, key: impl ToString) -> usize {
        let hits = self.hits.lock().unwrap();
        hits.get(&key.to_string()).copied().unwrap_or_default()
    }

    /// The number of invocations recorded across all keys.
    pub fn total(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    /// Returns all recorded hits and resets the counter.
    pub fn accesses(&self) -> BTreeMap<String, usize> {
        std::mem::take(&mut *self.hits.lock().unwrap())
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

/// Tracks how many sections of code run at the same time.
///
/// Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyProbe {
    state: Arc<ProbeState>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the start of a section, which ends when the returned guard is dropped.
    pub fn enter(&self) -> ProbeGuard {
        let current = self.state.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(current, Ordering::SeqCst);
        self.state.total.fetch_add(1, Ordering::SeqCst);
        ProbeGuard {
            state: Arc::clone(&self.state),
        }
    }

    /// The number of sections running right now.
    pub fn current(&self) -> usize {
        self.state.current.load(Ordering::SeqCst)
    }

    /// The highest number of sections that ever ran at the same time.
    pub fn peak(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }

    /// The number of sections that were entered so far.
    pub fn total(&self) -> usize {
        self.state.total.load(Ordering::SeqCst)
    }
}

/// Leaves a section of a [`ConcurrencyProbe`] on drop.
#[derive(Debug)]
#[must_use = "the section ends when the guard is dropped"]
pub struct ProbeGuard {
    state: Arc<ProbeState>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.state.current.fetch_sub(1, Ordering::SeqCst);
    }
}
