use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Lazily built, never evicted resources keyed by their construction
/// parameters.
///
/// A single lock covers the whole check-build-store sequence, so a build for
/// one key blocks lookups for every other key. All builds compete for the same
/// accelerator anyway, and holding the lock guarantees a key is built at most
/// once no matter how many callers race for it.
pub struct PipelineCache<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K, V> PipelineCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the stored value for `key`, running `build` only if nothing is
    /// stored yet. A failed build leaves the key absent so the next caller
    /// tries again.
    pub fn get_or_build<F, E>(&self, key: &K, build: F) -> Result<V, E>
    where
        F: FnOnce(&K) -> Result<V, E>,
    {
        let mut entries = self.lock();
        if let Some(value) = entries.get(key) {
            return Ok(value.clone());
        }
        let value = build(key)?;
        entries.insert(key.clone(), value.clone());
        Ok(value)
    }

    /// Snapshot of the keys built so far.
    pub fn keys(&self) -> Vec<K> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A builder that panicked never reached `insert`, so the map behind a
    // poisoned lock is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V> Default for PipelineCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
