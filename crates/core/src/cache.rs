//! Single-flight cache for asynchronous server queries.
//!
//! [`SingleFlightCache::get`] calls the producer at most once per key until
//! the key is invalidated. The producer's future is spawned on the runtime
//! and wrapped in a [`Shared`] future, so every caller for the key awaits the
//! same result and the fetch runs to completion even if all callers give up
//! on it.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::debug;

use crate::errors::FetchError;

/// A pending-or-settled result shared by every caller for one key.
pub type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, FetchError>>>;

pub struct SingleFlightCache<K, V> {
    name: &'static str,
    entries: Mutex<HashMap<K, SharedFetch<V>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Clone + Send + Sync + 'static,
{
    /// Create an empty cache. `name` only shows up in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, SharedFetch<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the shared result for `key`, calling `producer` only if there
    /// is no entry for it.
    ///
    /// Must be called from within a Tokio runtime. `producer` runs while the
    /// cache is locked, so it must not call back into this cache; only the
    /// future it returns may.
    pub fn get<F, Fut>(&self, key: K, producer: F) -> SharedFetch<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, FetchError>> + Send + 'static,
    {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(&key) {
            debug!(cache = self.name, ?key, "joining existing fetch");
            return existing.clone();
        }

        debug!(cache = self.name, ?key, "starting fetch");
        let task = tokio::spawn(producer());
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(FetchError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared();
        entries.insert(key, shared.clone());
        shared
    }

    /// The settled result for `key`, if a caller has already observed it.
    pub fn peek(&self, key: &K) -> Option<Result<V, FetchError>> {
        self.entries().get(key).and_then(|f| f.peek().cloned())
    }

    /// Drop the entry for `key` so the next [`get`](Self::get) fetches again.
    /// Callers already holding the old future still get its result.
    pub fn invalidate(&self, key: &K) -> bool {
        let removed = self.entries().remove(key).is_some();
        debug!(cache = self.name, ?key, removed, "invalidated entry");
        removed
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl<K, V> Debug for SingleFlightCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .entries
            .lock()
            .map(|e| e.len())
            .unwrap_or_default();
        f.debug_struct("SingleFlightCache")
            .field("name", &self.name)
            .field("entries", &len)
            .finish()
    }
}
