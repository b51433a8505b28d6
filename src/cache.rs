//! Entity cache: fetch-on-miss keyed cache with in-flight de-duplication.
//!
//! DESIGN
//! ======
//! Each key owns a slot with its own lock; the key map's lock is held only to
//! find or insert a slot, so unrelated keys never contend. A slot is Empty,
//! Loading (holding the shared fetch future), or Ready.
//!
//! A miss spawns the fetch as its own task and parks a `Shared` future in the
//! slot. Every concurrent `get` for that key awaits the same future, so one
//! key has at most one fetch outstanding. The spawned task writes the result
//! back, which means a fetch whose callers all went away still lands.
//!
//! Each slot carries a generation counter. `update`, `invalidate`, and
//! `remove` bump it; a fetch that started under an older generation resolves
//! its waiters but leaves the entry alone.
//!
//! ERROR HANDLING
//! ==============
//! A failed fetch is reported to every waiter as `CacheFetchFailed` and the
//! slot returns to Empty in the same step, so the next `get` fetches again.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::model::{Conversation, User};

type FetchFuture<V> = BoxFuture<'static, Result<V, ClientError>>;
type Fetcher<K, V> = Arc<dyn Fn(K) -> FetchFuture<V> + Send + Sync>;
type Flight<V> = Shared<FetchFuture<V>>;

/// Observable state of one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Empty,
    Loading,
    Ready,
}

enum Entry<V> {
    Empty,
    Loading(Flight<V>),
    Ready(V),
}

struct SlotState<V> {
    entry: Entry<V>,
    generation: u64,
}

struct Slot<V> {
    state: Mutex<SlotState<V>>,
}

impl<V: Clone> Slot<V> {
    fn new() -> Self {
        Self { state: Mutex::new(SlotState { entry: Entry::Empty, generation: 0 }) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a fetch result if nothing replaced the entry since the fetch began.
    fn complete(&self, generation: u64, result: &Result<V, ClientError>) -> bool {
        let mut state = self.lock();
        if state.generation != generation || !matches!(state.entry, Entry::Loading(_)) {
            return false;
        }
        state.entry = match result {
            Ok(value) => Entry::Ready(value.clone()),
            Err(_) => Entry::Empty,
        };
        true
    }
}

// =============================================================================
// ENTITY CACHE
// =============================================================================

/// Keyed cache shared by every caller. Clone is cheap.
pub struct EntityCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

struct CacheInner<K, V> {
    name: String,
    slots: RwLock<HashMap<K, Arc<Slot<V>>>>,
    fetcher: Fetcher<K, V>,
    fetches: AtomicU64,
}

impl<K, V> Clone for EntityCache<K, V> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<K, V> EntityCache<K, V>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// `fetch` resolves a missing key, usually by executing a packet.
    pub fn new<F, Fut>(name: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, ClientError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                slots: RwLock::new(HashMap::new()),
                fetcher: Arc::new(move |key| fetch(key).boxed()),
                fetches: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Value for `key`, fetching it on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::CacheFetchFailed`] wrapping the fetch error.
    pub async fn get<Q>(&self, key: &Q) -> Result<V, ClientError>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let slot = self.slot(key);
        let flight = {
            let mut state = slot.lock();
            match &state.entry {
                Entry::Ready(value) => return Ok(value.clone()),
                Entry::Loading(flight) => flight.clone(),
                Entry::Empty => {
                    let flight = self.start_fetch(key.to_owned(), &slot, state.generation);
                    state.entry = Entry::Loading(flight.clone());
                    flight
                }
            }
        };

        flight.await.map_err(|e| ClientError::CacheFetchFailed {
            key: key.to_owned().to_string(),
            source: Box::new(e),
        })
    }

    /// Start fetching an Empty `key` in the background without waiting for it.
    /// Returns true when a fetch was started. Outside a tokio runtime this
    /// does nothing.
    pub fn prefetch<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if tokio::runtime::Handle::try_current().is_err() {
            return false;
        }
        let slot = self.slot(key);
        let mut state = slot.lock();
        if !matches!(state.entry, Entry::Empty) {
            return false;
        }
        let flight = self.start_fetch(key.to_owned(), &slot, state.generation);
        state.entry = Entry::Loading(flight);
        true
    }

    /// Set `key` to `value`, creating the entry if needed.
    pub fn update(&self, key: K, value: V) {
        let slot = self.slot(&key);
        let mut state = slot.lock();
        state.generation += 1;
        state.entry = Entry::Ready(value);
        debug!(cache = %self.inner.name, %key, "cache entry updated");
    }

    /// Replace a Ready value with `f(current)`. Returns the new value, or
    /// `None` when the key is not Ready.
    pub fn update_with<Q>(&self, key: &Q, f: impl FnOnce(&V) -> V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.existing(key)?;
        let mut state = slot.lock();
        let Entry::Ready(current) = &state.entry else {
            return None;
        };
        let next = f(current);
        state.generation += 1;
        state.entry = Entry::Ready(next.clone());
        Some(next)
    }

    /// Force `key` back to Empty. A fetch already running will not repopulate it.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(slot) = self.existing(key) {
            let mut state = slot.lock();
            state.generation += 1;
            state.entry = Entry::Empty;
            debug!(cache = %self.inner.name, "cache entry invalidated");
        }
    }

    /// Drop the slot for `key` entirely.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self
            .inner
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)?;
        let mut state = slot.lock();
        state.generation += 1;
        match std::mem::replace(&mut state.entry, Entry::Empty) {
            Entry::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// The Ready value for `key`, without fetching.
    #[must_use]
    pub fn peek<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.existing(key)?;
        let state = slot.lock();
        match &state.entry {
            Entry::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn state<Q>(&self, key: &Q) -> CacheState
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(slot) = self.existing(key) else {
            return CacheState::Empty;
        };
        let state = slot.lock();
        match state.entry {
            Entry::Empty => CacheState::Empty,
            Entry::Loading(_) => CacheState::Loading,
            Entry::Ready(_) => CacheState::Ready,
        }
    }

    /// Number of Ready entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ready values at this instant.
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.snapshot().into_iter().map(|(_, v)| v).collect()
    }

    /// Ready `(key, value)` pairs at this instant.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let slots: Vec<(K, Arc<Slot<V>>)> = self
            .inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();
        slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let state = slot.lock();
                match &state.entry {
                    Entry::Ready(value) => Some((key, value.clone())),
                    _ => None,
                }
            })
            .collect()
    }

    /// Fetches started so far.
    #[must_use]
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::Acquire)
    }

    fn existing<Q>(&self, key: &Q) -> Option<Arc<Slot<V>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn slot<Q>(&self, key: &Q) -> Arc<Slot<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if let Some(slot) = self.existing(key) {
            return slot;
        }
        let mut slots = self
            .inner
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.to_owned()).or_insert_with(|| Arc::new(Slot::new())))
    }

    fn start_fetch(&self, key: K, slot: &Arc<Slot<V>>, generation: u64) -> Flight<V> {
        self.inner.fetches.fetch_add(1, Ordering::AcqRel);
        debug!(cache = %self.inner.name, %key, "cache miss; fetching");

        let fetch = (self.inner.fetcher)(key.clone());
        let slot = Arc::clone(slot);
        let name = self.inner.name.clone();
        let task = tokio::spawn(async move {
            let result = AssertUnwindSafe(fetch)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ClientError::Internal(format!("{name} fetch for {key} panicked"))));
            let applied = slot.complete(generation, &result);
            match &result {
                Ok(_) => debug!(cache = %name, %key, applied, "cache fetch complete"),
                Err(e) => warn!(cache = %name, %key, error = %e, "cache fetch failed"),
            }
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(ClientError::Internal(format!("cache fetch task failed: {e}"))))
        }
        .boxed()
        .shared()
    }
}

impl<K, V> fmt::Debug for EntityCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("name", &self.inner.name)
            .field("fetches", &self.inner.fetches.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// CACHE MANAGER
// =============================================================================

/// The two caches business logic reads through.
#[derive(Clone, Debug)]
pub struct CacheManager {
    pub conversations: EntityCache<String, Arc<Conversation>>,
    pub users: EntityCache<String, Arc<User>>,
}

impl CacheManager {
    #[must_use]
    pub fn new(
        conversations: EntityCache<String, Arc<Conversation>>,
        users: EntityCache<String, Arc<User>>,
    ) -> Self {
        Self { conversations, users }
    }
}

#[cfg(test)]
#[path = "cache_test.rs"]
mod tests;
