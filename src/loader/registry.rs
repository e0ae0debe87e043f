use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use super::LoadListener;

/// Listeners awaiting the outcome of the in-flight job for a URL.
///
/// All submissions for a URL funnel through one entry here; the first
/// registrant owns the network round trip, everyone else just waits for the
/// fan-out. Entries live from the first `register` to the owning job's
/// `drain`.
pub struct InProgressRegistry<V> {
    in_progress: Mutex<HashMap<String, Vec<Arc<dyn LoadListener<V>>>>>,
}

impl<V> Default for InProgressRegistry<V> {
    fn default() -> Self {
        InProgressRegistry {
            in_progress: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> InProgressRegistry<V> {
    /// Adds `listener` to the set for `key`. Returns `true` when the set was
    /// just created, i.e. the caller is the first submitter and must schedule
    /// the work.
    pub fn register(&self, key: &str, listener: Arc<dyn LoadListener<V>>) -> bool {
        let mut in_progress = self.in_progress.lock();
        match in_progress.get_mut(key) {
            Some(listeners) => {
                listeners.push(listener);
                false
            }
            None => {
                in_progress.insert(key.to_owned(), vec![listener]);
                true
            }
        }
    }

    /// Removes and returns the listener set for `key`.
    pub fn drain(&self, key: &str) -> Option<Vec<Arc<dyn LoadListener<V>>>> {
        self.in_progress.lock().remove(key)
    }
}

impl<V> std::fmt::Debug for InProgressRegistry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProgressRegistry")
            .field("urls", &self.in_progress.lock().len())
            .finish()
    }
}

/// Remembers which origins do not honor conditional requests.
///
/// Once an origin is observed returning a full response despite matching
/// validators it is switched to `HEAD` probing for the rest of the process
/// lifetime; the set only grows.
#[derive(Debug, Default)]
pub struct OriginProfile {
    head_only: Mutex<HashSet<String>>,
}

impl OriginProfile {
    /// Marks `host` as requiring HEAD probes. Returns `true` on the first
    /// observation.
    pub fn mark_head_only(&self, host: &str) -> bool {
        self.head_only.lock().insert(host.to_owned())
    }

    /// Whether cached entries from `host` must be verified with a HEAD probe
    /// instead of a conditional GET.
    pub fn needs_head_probe(&self, host: &str) -> bool {
        self.head_only.lock().contains(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::caching::CacheEntryAttributes;
    use crate::loader::LoadResult;

    struct NullListener;

    impl LoadListener<Vec<u8>> for NullListener {
        fn loading_finished(
            &self,
            _object: Option<&Vec<u8>>,
            _attributes: Option<&CacheEntryAttributes>,
            _result: LoadResult,
        ) {
        }
    }

    #[test]
    fn first_registration_creates_the_set() {
        let registry: InProgressRegistry<Vec<u8>> = InProgressRegistry::default();

        assert!(registry.register("http://example/a", Arc::new(NullListener)));
        assert!(!registry.register("http://example/a", Arc::new(NullListener)));
        assert!(registry.register("http://example/b", Arc::new(NullListener)));
    }

    #[test]
    fn drain_empties_the_set() {
        let registry: InProgressRegistry<Vec<u8>> = InProgressRegistry::default();
        registry.register("http://example/a", Arc::new(NullListener));
        registry.register("http://example/a", Arc::new(NullListener));

        assert_eq!(registry.drain("http://example/a").unwrap().len(), 2);
        assert!(registry.drain("http://example/a").is_none());

        // The key is free again for a new round of submissions.
        assert!(registry.register("http://example/a", Arc::new(NullListener)));
    }

    #[test]
    fn origin_marking_is_monotonic() {
        let origins = OriginProfile::default();

        assert!(!origins.needs_head_probe("tiles.example"));
        assert!(origins.mark_head_only("tiles.example"));
        assert!(!origins.mark_head_only("tiles.example"));
        assert!(origins.needs_head_probe("tiles.example"));
    }
}
