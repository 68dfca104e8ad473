//! A memoizing cache with least-recently-used eviction.
//!
//! Entries live in a `RecencyList`, a doubly linked list whose nodes are stored in a `Vec` and
//! linked by index. The most recently used entry is at the head, evictions happen at the tail.
//! Slots of removed nodes are reused, so a full cache does not allocate on every miss.
//!
//! ```text
//!   index: key ─► slot
//!
//!   head ─► [slot 2] ◄──► [slot 0] ◄──► [slot 1] ◄── tail
//!            (most recent)                (evicted next)
//! ```

use std::borrow::Borrow;
use std::convert::Infallible;
use std::fmt;
use std::hash::Hash;

use rustc_hash::FxHashMap;

use crate::error::ConfigError;

type Calc<K, V, C, E> = Box<dyn FnMut(&K, C) -> Result<V, E> + Send>;
type Release<V> = Box<dyn FnMut(V) + Send>;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly linked list of key/value pairs, ordered from most to least recently used.
struct RecencyList<K, V> {
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<K, V> RecencyList<K, V> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn node(&self, idx: usize) -> Option<&Node<K, V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K, V>> {
        self.slots.get_mut(idx).and_then(Option::as_mut)
    }

    fn value(&self, idx: usize) -> Option<&V> {
        self.node(idx).map(|node| &node.value)
    }

    /// Inserts a new node at the head and returns its slot.
    fn push_front(&mut self, key: K, value: V) -> usize {
        let node = Node {
            key,
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };
        self.len += 1;
        self.link_front(idx);
        idx
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    fn remove(&mut self, idx: usize) -> Option<(K, V)> {
        self.unlink(idx);
        let node = self.slots.get_mut(idx)?.take()?;
        self.free.push(idx);
        self.len -= 1;
        Some((node.key, node.value))
    }

    fn pop_back(&mut self) -> Option<(K, V)> {
        let idx = self.tail?;
        self.remove(idx)
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        let Some(node) = self.node_mut(idx) else {
            return;
        };
        node.prev = None;
        node.next = old_head;

        match old_head {
            Some(head) => {
                if let Some(head) = self.node_mut(head) {
                    head.prev = Some(idx);
                }
            }
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let Some(node) = self.node_mut(idx) else {
            return;
        };
        let prev = node.prev.take();
        let next = node.next.take();

        match prev {
            Some(prev) => {
                if let Some(prev) = self.node_mut(prev) {
                    prev.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next) => {
                if let Some(next) = self.node_mut(next) {
                    next.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.node(cursor?)?;
            cursor = node.next;
            Some((&node.key, &node.value))
        })
    }
}

/// A capacity-bounded memoization table with least-recently-used eviction.
///
/// Values are computed by the `calc` function given at construction, which receives the key and
/// a caller-supplied context. `calc` must be referentially transparent: its result is shared with
/// every later caller of the same key.
///
/// The cache is not internally synchronized. Owners that share it between threads wrap it in a
/// mutex, as [`AsyncMruCache`](crate::AsyncMruCache) does.
pub struct MruCache<K, V, C = (), E = Infallible> {
    max_cache_size: usize,
    index: FxHashMap<K, usize>,
    order: RecencyList<K, V>,
    calc: Calc<K, V, C, E>,
    on_release: Option<Release<V>>,
}

impl<K: fmt::Debug, V, C, E> fmt::Debug for MruCache<K, V, C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<_> = self.order.iter().map(|(key, _)| key).collect();
        f.debug_struct("MruCache")
            .field("max_cache_size", &self.max_cache_size)
            .field("keys", &keys)
            .field("on_release", &self.on_release.is_some())
            .finish()
    }
}

impl<K, V, C, E> MruCache<K, V, C, E> {
    /// The maximum number of entries this cache holds.
    pub fn capacity(&self) -> usize {
        self.max_cache_size
    }

    /// The number of entries currently cached.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of all cached values, most recently used first.
    ///
    /// This does not change the recency of any entry.
    pub fn cached_values(&self) -> Vec<V>
    where
        V: Clone,
    {
        self.order.iter().map(|(_, value)| value.clone()).collect()
    }

    /// A snapshot of all cached keys, most recently used first.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.order.iter().map(|(key, _)| key.clone()).collect()
    }

    fn release(&mut self, value: V) {
        if let Some(on_release) = self.on_release.as_mut() {
            on_release(value);
        }
    }
}

impl<K, V, C, E> MruCache<K, V, C, E>
where
    K: Eq + Hash + Clone,
{
    /// Creates a cache holding at most `max_cache_size` values computed by `calc`.
    pub fn new<F>(max_cache_size: usize, calc: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&K, C) -> Result<V, E> + Send + 'static,
    {
        if max_cache_size == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        Ok(Self {
            max_cache_size,
            index: FxHashMap::default(),
            order: RecencyList::new(),
            calc: Box::new(calc),
            on_release: None,
        })
    }

    /// Sets a callback that receives every value that is evicted or invalidated.
    pub fn with_release<R>(mut self, on_release: R) -> Self
    where
        R: FnMut(V) + Send + 'static,
    {
        self.set_release(on_release);
        self
    }

    /// Replaces the callback that receives evicted and invalidated values.
    pub fn set_release<R>(&mut self, on_release: R)
    where
        R: FnMut(V) + Send + 'static,
    {
        self.on_release = Some(Box::new(on_release));
    }

    /// Returns the cached value for `key`, computing it on a miss.
    ///
    /// A hit marks the entry as most recently used. A miss invokes `calc` and inserts its result,
    /// evicting the least recently used entries until the capacity is respected again.
    ///
    /// # Errors
    ///
    /// Errors of `calc` are returned as-is, and nothing is inserted into the cache.
    pub fn get(&mut self, key: K, context: C) -> Result<V, E>
    where
        V: Clone,
    {
        if let Some(value) = self.try_get(&key) {
            return Ok(value);
        }

        let value = (self.calc)(&key, context)?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Returns the cached value for `key` without computing anything.
    ///
    /// A hit marks the entry as most recently used.
    pub fn try_get<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let idx = *self.index.get(key)?;
        self.order.move_to_front(idx);
        self.order.value(idx).cloned()
    }

    /// Returns `true` if `key` is cached, without touching its recency.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Removes `key` from the cache, releasing its value.
    pub fn invalidate<Q>(&mut self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(idx) = self.index.remove(key) else {
            return;
        };
        if let Some((_, value)) = self.order.remove(idx) {
            self.release(value);
        }
        self.debug_validate();
    }

    /// Removes every entry from the cache, releasing all values.
    pub fn invalidate_all(&mut self) {
        self.index.clear();
        while let Some((_, value)) = self.order.pop_back() {
            self.release(value);
        }
        self.debug_validate();
    }

    fn insert(&mut self, key: K, value: V) {
        let idx = self.order.push_front(key.clone(), value);
        let previous = self.index.insert(key, idx);
        debug_assert!(previous.is_none());

        while self.order.len() > self.max_cache_size {
            let Some((key, value)) = self.order.pop_back() else {
                break;
            };
            self.index.remove(&key);
            self.release(value);
        }
        self.debug_validate();
    }

    fn debug_validate(&self) {
        debug_assert!(
            self.order.len() <= self.max_cache_size,
            "cache holds {} entries, exceeding its capacity of {}",
            self.order.len(),
            self.max_cache_size,
        );
        debug_assert_eq!(self.order.len(), self.index.len());
        #[cfg(debug_assertions)]
        for (key, &idx) in &self.index {
            debug_assert!(self.order.node(idx).is_some_and(|node| &node.key == key));
        }
    }
}
