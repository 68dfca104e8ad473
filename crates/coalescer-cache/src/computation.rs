//! Memoized asynchronous computations with request coalescing.
//!
//! An [`AsyncMruCache`] stores one [`Broadcast`] channel per key in an [`MruCache`]. The channel
//! is inserted before the computation producing its outcome has even started, so every request
//! arriving in the meantime subscribes to the very same computation instead of starting its own.
//!
//! Computations are spawned on a tokio runtime and have to pass through a shared
//! [`AdmissionQueue`] first, which bounds how many of them run at the same time:
//!
//! ```text
//!   async_get(key) ─► MruCache (locked) ── hit ──────────────────────────► subscribe
//!                                        └─ miss ─► insert channel ─► submit ticket ─► spawn
//!
//!   task: ticket granted ─► fetch(key) ─► last value ─► resolve channel ─► release permit
//! ```

use std::borrow::Borrow;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::runtime::Handle;

use crate::admission::{AdmissionQueue, Ticket};
use crate::broadcast::{Broadcast, BroadcastSender};
use crate::config::CacheConfig;
use crate::error::{CacheEntry, CacheError, ConfigError};
use crate::mru::MruCache;

/// Produces the values memoized by an [`AsyncMruCache`].
pub trait Fetcher: Send + Sync + 'static {
    /// The key identifying a computation.
    type Key: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static;
    /// The value produced by a computation.
    type Value: Clone + Send + Sync + 'static;

    /// Starts the computation for `key`.
    ///
    /// The stream may yield any number of values. The outcome of the computation is the last
    /// value yielded before the stream completes. The first error ends the computation and
    /// becomes its outcome, and a stream that completes without any value fails with
    /// [`CacheError::Empty`].
    fn fetch(&self, key: Self::Key) -> BoxStream<'static, CacheEntry<Self::Value>>;
}

/// A [`Fetcher`] backed by an async function yielding a single outcome.
pub struct FetchFn<K, V, F> {
    f: F,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V, F> FetchFn<K, V, F> {
    /// Wraps `f`, which is called once per computation.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<K, V, F> fmt::Debug for FetchFn<K, V, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchFn").finish_non_exhaustive()
    }
}

impl<K, V, F, Fut> Fetcher for FetchFn<K, V, F>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheEntry<V>> + Send + 'static,
{
    type Key = K;
    type Value = V;

    fn fetch(&self, key: K) -> BoxStream<'static, CacheEntry<V>> {
        stream::once((self.f)(key)).boxed()
    }
}

type Channels<F> = MruCache<<F as Fetcher>::Key, Broadcast<<F as Fetcher>::Value>>;
type OnRelease<V> = Arc<dyn Fn(V) + Send + Sync>;

/// A capacity-bounded cache of asynchronous computations.
///
/// Concurrent requests for the same key share a single computation, and its outcome is
/// remembered until the key is evicted or invalidated. Failed computations are remembered as
/// well: their error is replayed to every later request until the key is invalidated.
///
/// Cloning the cache yields another handle to the same entries.
pub struct AsyncMruCache<F: Fetcher> {
    name: Arc<str>,
    channels: Arc<Mutex<Channels<F>>>,
    admission: AdmissionQueue,
    runtime: Handle,
}

impl<F: Fetcher> Clone for AsyncMruCache<F> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            channels: Arc::clone(&self.channels),
            admission: self.admission.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

impl<F: Fetcher> fmt::Debug for AsyncMruCache<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMruCache")
            .field("name", &self.name)
            .field("channels", &self.channels.lock().unwrap())
            .field("admission", &self.admission)
            .finish()
    }
}

impl<F: Fetcher> AsyncMruCache<F> {
    /// Creates a new cache whose computations are performed by `fetcher`.
    ///
    /// Computations are spawned on `runtime`. The `name` is attached to all logs and metrics
    /// emitted by this cache.
    pub fn new(
        name: &str,
        fetcher: F,
        config: &CacheConfig,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let name: Arc<str> = Arc::from(name);
        let admission = AdmissionQueue::new(config.max_concurrent_fetches)?;

        let calc = {
            let fetcher = Arc::new(fetcher);
            let name = Arc::clone(&name);
            let admission = admission.clone();
            let runtime = runtime.clone();

            move |key: &F::Key, (): ()| {
                let (sender, channel) = Broadcast::channel();
                let ticket = admission.submit();

                let (queued, granted) = (admission.queued(), admission.granted());
                metric!(gauge("admission.queued") = queued as u64, "cache" => &name);
                metric!(gauge("admission.granted") = granted as u64, "cache" => &name);
                tracing::trace!(
                    cache = %name,
                    ?key,
                    sequence = ticket.sequence(),
                    "Spawning computation"
                );

                runtime.spawn(compute(
                    Arc::clone(&fetcher),
                    key.clone(),
                    ticket,
                    sender,
                    channel.clone(),
                    Arc::clone(&name),
                ));
                Ok::<_, Infallible>(channel)
            }
        };

        let channels = MruCache::new(config.max_cache_size, calc)?
            .with_release(release_fn::<F::Value>(
                Arc::clone(&name),
                runtime.clone(),
                None,
            ));

        Ok(Self {
            name,
            channels: Arc::new(Mutex::new(channels)),
            admission,
            runtime,
        })
    }

    /// Sets a callback that receives the values of evicted and invalidated entries.
    ///
    /// Only successfully computed values are released. An entry that is evicted while its
    /// computation is still running is released once the computation finishes.
    ///
    /// The callback runs while the cache is locked and must not access the cache itself.
    pub fn with_release<R>(self, on_release: R) -> Self
    where
        R: Fn(F::Value) + Send + Sync + 'static,
    {
        let release = release_fn::<F::Value>(
            Arc::clone(&self.name),
            self.runtime.clone(),
            Some(Arc::new(on_release)),
        );
        self.channels.lock().unwrap().set_release(release);
        self
    }

    /// The name of this cache.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The admission queue all computations of this cache pass through.
    pub fn admission(&self) -> &AdmissionQueue {
        &self.admission
    }

    /// Returns a future resolving to the outcome of the computation for `key`.
    ///
    /// This never blocks on the computation. If the key is neither cached nor being computed, a
    /// new computation is registered and spawned right away, even if the returned future is
    /// never polled. Dropping the future does not cancel the computation.
    pub fn async_get(&self, key: F::Key) -> BoxFuture<'static, CacheEntry<F::Value>> {
        let channel = {
            let mut channels = self.channels.lock().unwrap();
            let hit = channels.contains_key(&key);
            tracing::trace!(cache = %self.name, ?key, hit, "Cache lookup");

            metric!(counter("caches.access") += 1, "cache" => &self.name);
            if hit {
                metric!(counter("caches.memory.hit") += 1, "cache" => &self.name);
            } else {
                metric!(counter("caches.channel.miss") += 1, "cache" => &self.name);
            }

            let Ok(channel) = channels.get(key, ());
            channel
        };
        channel.subscribe()
    }

    /// Blocks the current thread until the computation for `key` has finished.
    ///
    /// This must not be called from within an async task, in particular not from a task running
    /// on the runtime this cache spawns its computations on.
    pub fn get(&self, key: F::Key) -> CacheEntry<F::Value> {
        futures::executor::block_on(self.async_get(key))
    }

    /// Returns the outcome for `key` if it is cached or being computed, without starting a new
    /// computation.
    pub fn try_get<Q>(&self, key: &Q) -> Option<BoxFuture<'static, CacheEntry<F::Value>>>
    where
        F::Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let channel = self.channels.lock().unwrap().try_get(key)?;
        Some(channel.subscribe())
    }

    /// Removes `key` from the cache.
    ///
    /// The next request for `key` starts a new computation. A computation that is still running
    /// is not cancelled, its current subscribers still receive its outcome.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        F::Key: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.channels.lock().unwrap().invalidate(key)
    }

    /// Removes all entries from the cache.
    pub fn invalidate_all(&self) {
        self.channels.lock().unwrap().invalidate_all()
    }

    /// A snapshot of the channels of all cached keys, most recently used first.
    pub fn cached_values(&self) -> Vec<Broadcast<F::Value>> {
        self.channels.lock().unwrap().cached_values()
    }

    /// The number of cached keys, including keys that are still being computed.
    pub fn len(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs a single computation once `ticket` has been granted and resolves `sender` with its
/// outcome.
///
/// The permit is held until the channel is resolved. Should this future be dropped early, the
/// sender is dropped with it and all subscribers observe [`CacheError::Cancelled`].
async fn compute<F: Fetcher>(
    fetcher: Arc<F>,
    key: F::Key,
    ticket: Ticket,
    sender: BroadcastSender<F::Value>,
    channel: Broadcast<F::Value>,
    name: Arc<str>,
) {
    let permit = match ticket.await {
        Ok(permit) => permit,
        Err(err) => {
            sender.send(Err(err));
            return;
        }
    };
    tracing::trace!(cache = %name, ?key, sequence = permit.sequence(), "Computation admitted");

    let start = Instant::now();
    let outcome = last_value(fetcher.fetch(key)).await;

    let status = if outcome.is_ok() { "ok" } else { "error" };
    metric!(timer("caches.computation.duration") = start.elapsed(), "cache" => &name);
    metric!(counter("caches.computation") += 1, "cache" => &name, "status" => status);

    sender.send(outcome);
    // Settle the channel so its outcome is visible to `Broadcast::peek`.
    let _ = channel.subscribe().await;

    permit.release();
}

/// Drains `stream`, returning the last value it yields.
async fn last_value<V>(mut stream: BoxStream<'static, CacheEntry<V>>) -> CacheEntry<V> {
    let mut last = None;
    while let Some(entry) = stream.next().await {
        last = Some(entry?);
    }
    last.ok_or(CacheError::Empty)
}

fn release_fn<V>(
    name: Arc<str>,
    runtime: Handle,
    on_release: Option<OnRelease<V>>,
) -> impl FnMut(Broadcast<V>) + Send + 'static
where
    V: Clone + Send + Sync + 'static,
{
    move |channel| {
        metric!(counter("caches.evicted") += 1, "cache" => &name);

        let Some(on_release) = on_release.clone() else {
            return;
        };
        match channel.peek() {
            Some(Ok(value)) => on_release(value),
            Some(Err(_)) => {}
            None => {
                tracing::debug!(cache = %name, "Evicted a pending computation");
                runtime.spawn(async move {
                    if let Ok(value) = channel.subscribe().await {
                        on_release(value);
                    }
                });
            }
        }
    }
}
