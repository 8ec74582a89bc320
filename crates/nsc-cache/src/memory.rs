//! In-process backend for testing.
//!
//! Provides [`MemoryBackend`] for unit tests without a network store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{Backend, BackendError, CacheStats, Value};

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, (Value, u64)>,
    hits: u64,
    misses: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

/// In-memory [`Backend`] for tests.
///
/// Clones share the same storage, so a test can keep a handle to inspect the
/// physical keys written through a [`NamespacedCache`](crate::NamespacedCache).
/// Expiry is recorded but never enforced. Reads and writes can be made to
/// fail to exercise the fail-soft paths.
///
/// # Example
///
/// ```ignore
/// use nsc_cache::{Cache, MemoryBackend, NamespacedCache, Value};
///
/// let store = MemoryBackend::new();
/// let cache = NamespacedCache::new(Box::new(store.clone()));
/// cache.save("key", &Value::from(1), 0);
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// Create a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read operation fail (or succeed again).
    pub fn fail_reads(&self, fail: bool) {
        self.shared.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write operation fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Read a physical key directly, bypassing statistics and failure injection.
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<Value> {
        self.state().entries.get(key).map(|(value, _)| value.clone())
    }

    /// TTL a physical key was last written with.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<u64> {
        self.state().entries.get(key).map(|(_, ttl)| *ttl)
    }

    /// All physical keys currently stored, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of physical keys stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Whether the backend holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_read(&self) -> Result<(), BackendError> {
        if self.shared.fail_reads.load(Ordering::SeqCst) {
            return Err(BackendError::connection("injected read failure").with_backend("memory"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), BackendError> {
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::connection("injected write failure").with_backend("memory"));
        }
        Ok(())
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn fetch(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.check_read()?;
        let mut state = self.state();
        let value = state.entries.get(key).map(|(value, _)| value.clone());
        if value.is_some() {
            state.hits += 1;
        } else {
            state.misses += 1;
        }
        Ok(value)
    }

    fn fetch_multiple(&self, keys: &[String]) -> Result<HashMap<String, Value>, BackendError> {
        self.check_read()?;
        let state = self.state();
        Ok(keys
            .iter()
            .filter_map(|key| {
                state
                    .entries
                    .get(key)
                    .map(|(value, _)| (key.clone(), value.clone()))
            })
            .collect())
    }

    fn contains(&self, key: &str) -> Result<bool, BackendError> {
        self.check_read()?;
        Ok(self.state().entries.contains_key(key))
    }

    fn save(&self, key: &str, value: &Value, ttl_seconds: u64) -> Result<(), BackendError> {
        self.check_write()?;
        self.state()
            .entries
            .insert(key.to_owned(), (value.clone(), ttl_seconds));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        self.check_write()?;
        self.state().entries.remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<(), BackendError> {
        self.check_write()?;
        self.state().entries.clear();
        Ok(())
    }

    fn stats(&self) -> Result<CacheStats, BackendError> {
        self.check_read()?;
        let state = self.state();
        Ok(CacheStats {
            hits: state.hits,
            misses: state.misses,
            uptime_seconds: 0,
            memory_used_bytes: 0,
            memory_available_bytes: None,
        })
    }
}
