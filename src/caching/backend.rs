use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use super::CacheEntryAttributes;
use crate::utils::now_millis;

/// A key/value store holding cached objects and their attributes.
///
/// The loader only requires per-key atomic `get`/`put`; eviction, persistence
/// and layout are the backend's business. Implementations must call
/// [`CacheEntryAttributes::finalize_for_store`] when storing so every
/// persisted entry carries a creation stamp and a clamped expiry.
pub trait CacheBackend<K, V>: Send + Sync + 'static {
    /// Looks up the object and attributes stored under `key`.
    fn get(&self, key: &K) -> Option<(V, CacheEntryAttributes)>;

    /// Stores `value` with its attributes under `key`, replacing any previous
    /// entry.
    fn put(&self, key: K, value: V, attributes: CacheEntryAttributes);
}

/// A process-local [`CacheBackend`] keeping everything in a mutexed map.
///
/// Suitable for tests and for callers that layer their own persistence
/// underneath; there is no eviction.
#[derive(Debug, Default)]
pub struct InMemoryCache<K, V> {
    entries: Mutex<HashMap<K, (V, CacheEntryAttributes)>>,
}

impl<K, V> InMemoryCache<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        InMemoryCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<K, V> CacheBackend<K, V> for InMemoryCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, key: &K) -> Option<(V, CacheEntryAttributes)> {
        self.entries.lock().get(key).cloned()
    }

    fn put(&self, key: K, value: V, mut attributes: CacheEntryAttributes) {
        attributes.finalize_for_store(now_millis());
        self.entries.lock().insert(key, (value, attributes));
    }
}
