//! Caching primitives with request coalescing and bounded concurrency.
//!
//! The primitives are layered on top of each other:
//!
//! - [`MruCache`] is a synchronous, capacity-bounded memoization table with least-recently-used
//!   eviction and an optional release callback.
//! - [`AdmissionQueue`] grants a bounded number of execution slots to tickets in submission order.
//! - [`Broadcast`] holds the single outcome of a computation and replays it to every subscriber.
//! - [`AsyncMruCache`] composes all of the above: concurrent requests for the same key share one
//!   computation, and computations for distinct keys are throttled by one admission queue.

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

pub mod admission;
pub mod broadcast;
pub mod computation;
pub mod config;
pub mod error;
pub mod mru;

pub use admission::{AdmissionQueue, Permit, Ticket};
pub use broadcast::{Broadcast, BroadcastSender};
pub use computation::{AsyncMruCache, FetchFn, Fetcher};
pub use config::CacheConfig;
pub use error::{CacheEntry, CacheError, ConfigError};
pub use mru::MruCache;
