//! A single-outcome broadcast channel that replays its result to late subscribers.

use std::fmt;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};

use crate::error::{CacheEntry, CacheError};

/// The receiving side of a broadcast channel.
///
/// All clones observe the same outcome, no matter if they subscribe before or after it was
/// produced.
pub struct Broadcast<V> {
    inner: Shared<oneshot::Receiver<CacheEntry<V>>>,
}

/// The sending side of a broadcast channel.
///
/// Dropping the sender without sending resolves every subscriber with
/// [`CacheError::Cancelled`].
pub struct BroadcastSender<V> {
    sender: oneshot::Sender<CacheEntry<V>>,
}

impl<V> Clone for Broadcast<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: Clone> fmt::Debug for Broadcast<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcast")
            .field("resolved", &self.inner.peek().is_some())
            .finish()
    }
}

impl<V> fmt::Debug for BroadcastSender<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastSender")
            .field("canceled", &self.sender.is_canceled())
            .finish()
    }
}

impl<V: Clone> Broadcast<V> {
    /// Creates a new, unresolved channel.
    pub fn channel() -> (BroadcastSender<V>, Self) {
        let (sender, receiver) = oneshot::channel();
        let channel = Self {
            inner: receiver.shared(),
        };
        (BroadcastSender { sender }, channel)
    }

    /// Returns a future resolving to the outcome of this channel.
    ///
    /// Dropping the returned future has no effect on the computation producing the outcome.
    pub fn subscribe(&self) -> BoxFuture<'static, CacheEntry<V>>
    where
        V: Send + Sync + 'static,
    {
        self.inner
            .clone()
            .unwrap_or_else(|_canceled| Err(CacheError::Cancelled))
            .boxed()
    }

    /// Returns the outcome if it has already been observed by a subscriber.
    pub fn peek(&self) -> Option<CacheEntry<V>> {
        match self.inner.peek()? {
            Ok(entry) => Some(entry.clone()),
            Err(_canceled) => Some(Err(CacheError::Cancelled)),
        }
    }
}

impl<V> BroadcastSender<V> {
    /// Resolves the channel.
    ///
    /// Returns `false` if no receiver is left to observe the outcome.
    pub fn send(self, entry: CacheEntry<V>) -> bool {
        self.sender.send(entry).is_ok()
    }
}
