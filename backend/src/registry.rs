use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

/// Locks `mutex`, taking over the guard if a previous holder panicked.
///
/// A panicking closure cannot leave a map entry half-written, so the contents
/// are still usable.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, label: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("{label} mutex poisoned; recovering");
            poisoned.into_inner()
        }
    }
}

/// Key-addressed store owned by one component.
///
/// Each component that tracks state per dataset path or layout URI holds its
/// own `Registry`, so the lifetime and locking of that state is visible in the
/// component's type instead of living in process-wide maps. Closures passed to
/// [`Registry::with`] run under the lock and must not await.
pub struct Registry<K, V> {
    label: &'static str,
    entries: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V> Registry<K, V> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, V>> {
        lock_or_recover(&self.entries, self.label)
    }

    /// Runs `f` with exclusive access to the whole map.
    pub fn with<R>(&self, f: impl FnOnce(&mut HashMap<K, V>) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.lock().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn drain(&self) -> Vec<(K, V)> {
        self.lock().drain().collect()
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Registry<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.lock().get(key).cloned()
    }
}

impl<K, V> std::fmt::Debug for Registry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("label", &self.label).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn with_gives_atomic_read_modify_write() {
        let registry: Registry<String, u32> = Registry::new("counters");
        for _ in 0..3 {
            registry.with(|map| *map.entry("a".to_string()).or_insert(0) += 1);
        }
        assert_eq!(registry.get(&"a".to_string()), Some(3));
        assert_eq!(registry.remove(&"a".to_string()), Some(3));
        assert!(registry.is_empty());
    }

    #[test]
    fn recovers_after_poisoning() {
        let registry: Arc<Registry<String, u32>> = Arc::new(Registry::new("poisoned"));
        registry.insert("kept".to_string(), 7);
        let clone = Arc::clone(&registry);
        let _ = std::thread::spawn(move || {
            clone.with(|map| -> usize {
                map.insert("written".to_string(), 0);
                panic!("boom")
            });
        })
        .join();
        assert_eq!(registry.get(&"kept".to_string()), Some(7));
        registry.insert("after".to_string(), 1);
        assert_eq!(registry.len(), 3);
    }
}
