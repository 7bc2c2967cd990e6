//! Pending-Connection Registry
//!
//! Maps one-time rendezvous keys to the activation that binds an inbound
//! transport to its waiting channel. An entry is consumed by one atomic
//! [`PendingConnections::take`]; later callers see nothing.

use ferry_core::{FerryError, Result};
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Callback run exactly once with the transport that arrived for a key
pub type Activation<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, ()> + Send>;

struct PendingEntry<T> {
    generation: u64,
    activation: Activation<T>,
}

/// Shared key → activation map
pub struct PendingConnections<T> {
    entries: Mutex<HashMap<String, PendingEntry<T>>>,
    next_generation: AtomicU64,
}

impl<T> fmt::Debug for PendingConnections<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConnections")
            .field("pending", &self.len())
            .finish()
    }
}

impl<T> Default for PendingConnections<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingConnections<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Register `activation` under `key`.
    ///
    /// Without `replace`, an existing entry is a `KeyInUse` error. With it,
    /// the old activation is dropped unrun. Returns the entry's generation,
    /// which [`take_if_current`](Self::take_if_current) uses to tell a stale
    /// timer from the current one.
    pub fn register(&self, key: &str, activation: Activation<T>, replace: bool) -> Result<u64> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();

        if !replace && entries.contains_key(key) {
            return Err(FerryError::key_in_use(key));
        }

        let previous = entries.insert(
            key.to_string(),
            PendingEntry {
                generation,
                activation,
            },
        );
        if previous.is_some() {
            tracing::debug!(key = %key, generation, "Replaced pending connection");
        }
        Ok(generation)
    }

    /// Remove and return the activation for `key`
    pub fn take(&self, key: &str) -> Option<Activation<T>> {
        self.entries.lock().remove(key).map(|entry| entry.activation)
    }

    /// Remove the entry only if it is still the one registered as `generation`
    pub fn take_if_current(&self, key: &str, generation: u64) -> Option<Activation<T>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.generation == generation => {
                entries.remove(key).map(|entry| entry.activation)
            }
            _ => None,
        }
    }

    /// Drop any entry for `key`; returns whether one existed
    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    /// Whether `key` is currently pending
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of pending entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures_util::FutureExt;
    use std::sync::Arc;

    fn recording(sink: Arc<Mutex<Vec<u32>>>) -> Activation<u32> {
        Box::new(move |transport| {
            async move {
                sink.lock().push(transport);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_take_runs_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = PendingConnections::new();
        registry.register("abc", recording(seen.clone()), false).unwrap();
        assert!(registry.contains("abc"));

        let activation = registry.take("abc").unwrap();
        assert!(registry.take("abc").is_none());
        activation(7).await;

        assert_eq!(*seen.lock(), vec![7]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_double_register_without_replace() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = PendingConnections::new();
        registry.register("abc", recording(seen.clone()), false).unwrap();

        assert_matches!(
            registry.register("abc", recording(seen), false),
            Err(FerryError::KeyInUse { key }) if key == "abc"
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_drops_old_activation() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let registry = PendingConnections::new();
        registry.register("abc", recording(first.clone()), false).unwrap();
        registry.register("abc", recording(second.clone()), true).unwrap();

        registry.take("abc").unwrap()(1).await;
        assert!(first.lock().is_empty());
        assert_eq!(*second.lock(), vec![1]);
    }

    #[test]
    fn test_stale_generation_cannot_take() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = PendingConnections::new();
        let old = registry.register("abc", recording(seen.clone()), false).unwrap();
        let current = registry.register("abc", recording(seen), true).unwrap();
        assert_ne!(old, current);

        assert!(registry.take_if_current("abc", old).is_none());
        assert!(registry.contains("abc"));
        assert!(registry.take_if_current("abc", current).is_some());
        assert!(!registry.contains("abc"));
    }

    #[test]
    fn test_remove() {
        let registry: PendingConnections<u32> = PendingConnections::new();
        assert!(!registry.remove("missing"));
        registry
            .register("abc", recording(Arc::new(Mutex::new(Vec::new()))), false)
            .unwrap();
        assert!(registry.remove("abc"));
        assert!(registry.take("abc").is_none());
    }
}
