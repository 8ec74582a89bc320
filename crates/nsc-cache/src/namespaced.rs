//! Namespace-versioning decorator.
//!
//! [`NamespacedCache`] wraps a [`Backend`] and rewrites every logical key into
//!
//! ```text
//! {id_prefix}{namespace}[{key}][{version}]
//! ```
//!
//! The namespace version lives in the store under
//! `{id_prefix}NamespaceCacheKey[{namespace}]`. [`Cache::delete_all`] bumps it,
//! after which every previously written key of the namespace is unreachable.
//!
//! # Consistency model
//!
//! The version is read from the store at most once per namespace and then
//! cached in memory for the lifetime of the decorator. Another process that
//! already cached the old version keeps serving the old generation until it
//! calls [`Cache::set_namespace`] or restarts. Re-reading the version on
//! every operation would cost one extra round-trip per call.
//!
//! The bump is a plain read-increment-write. Two processes bumping at the same
//! time can both write the same new version (last writer wins).
//!
//! The version record expires after the cache-key lifetime. If it expires, the
//! version silently resets to [`DEFAULT_NAMESPACE_VERSION`], so the lifetime
//! must exceed the TTL of every entry written in the namespace.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{Backend, BackendError, Cache, CacheStats, Value};

/// Default TTL of the namespace version record (7 days).
pub const DEFAULT_CACHE_KEY_LIFETIME: u64 = 604_800;

/// Version assumed when the store holds no version record.
pub const DEFAULT_NAMESPACE_VERSION: u64 = 1;

const NAMESPACE_CACHE_KEY: &str = "NamespaceCacheKey";

#[derive(Debug)]
struct NamespaceState {
    namespace: String,
    /// Cached version, `None` until first read.
    version: Option<u64>,
    cache_key_lifetime: u64,
}

/// [`Cache`] implementation adding namespace-wide invalidation to a [`Backend`].
///
/// All operations take `&self`; share one instance across threads with `Arc`.
pub struct NamespacedCache {
    backend: Box<dyn Backend>,
    id_prefix: String,
    state: Mutex<NamespaceState>,
}

impl NamespacedCache {
    /// Wrap a backend, starting in the empty namespace.
    #[must_use]
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            id_prefix: String::new(),
            state: Mutex::new(NamespaceState {
                namespace: String::new(),
                version: None,
                cache_key_lifetime: DEFAULT_CACHE_KEY_LIFETIME,
            }),
        }
    }

    /// Prepend `prefix` to every key sent to the backend.
    #[must_use]
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = prefix.into();
        self
    }

    /// Set the TTL of the namespace version record.
    #[must_use]
    pub fn with_cache_key_lifetime(self, seconds: u64) -> Self {
        self.set_cache_key_lifetime(seconds);
        self
    }

    /// Start in the given namespace.
    #[must_use]
    pub fn with_namespace(self, namespace: &str) -> Self {
        self.set_namespace(namespace);
        self
    }

    /// Identifier of the wrapped backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Prefix prepended to every key.
    pub fn id_prefix(&self) -> &str {
        &self.id_prefix
    }

    /// TTL of the namespace version record.
    pub fn cache_key_lifetime(&self) -> u64 {
        self.lock().cache_key_lifetime
    }

    /// Namespace version cached by this instance, `None` before the first read.
    pub fn cached_version(&self) -> Option<u64> {
        self.lock().version
    }

    fn lock(&self) -> MutexGuard<'_, NamespaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn version_key(&self, namespace: &str) -> String {
        format!("{}{NAMESPACE_CACHE_KEY}[{namespace}]", self.id_prefix)
    }

    fn namespaced_key(&self, namespace: &str, key: &str, version: u64) -> String {
        format!("{}{namespace}[{key}][{version}]", self.id_prefix)
    }

    /// Return the cached version, reading it from the store on first use.
    fn load_version(&self, state: &mut NamespaceState) -> Result<u64, BackendError> {
        if let Some(version) = state.version {
            return Ok(version);
        }

        let key = self.version_key(&state.namespace);
        let version = self
            .backend
            .fetch(&key)?
            .as_ref()
            .and_then(Value::as_u64)
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_NAMESPACE_VERSION);

        tracing::debug!(namespace = %state.namespace, version, "loaded namespace version");
        state.version = Some(version);
        Ok(version)
    }

    /// Like [`Self::load_version`], falling back to the default without
    /// caching it when the store cannot be read.
    fn current_version(&self, state: &mut NamespaceState) -> u64 {
        self.load_version(state).unwrap_or_else(|e| {
            self.degraded("load namespace version", &state.namespace, &e);
            DEFAULT_NAMESPACE_VERSION
        })
    }

    fn key_for(&self, key: &str) -> String {
        let mut state = self.lock();
        let version = self.current_version(&mut state);
        self.namespaced_key(&state.namespace, key, version)
    }

    fn degraded(&self, operation: &'static str, key: &str, err: &BackendError) {
        tracing::warn!(
            backend = self.backend.name(),
            operation,
            key,
            "cache operation failed: {err}"
        );
    }
}

impl Cache for NamespacedCache {
    fn fetch(&self, key: &str) -> Option<Value> {
        let id = self.key_for(key);
        self.backend.fetch(&id).unwrap_or_else(|e| {
            self.degraded("fetch", &id, &e);
            None
        })
    }

    fn fetch_multiple(&self, keys: &[&str]) -> HashMap<String, Value> {
        if keys.is_empty() {
            return HashMap::new();
        }

        // Requested key -> namespaced key, in request order.
        let pairs: Vec<(&str, String)> = {
            let mut state = self.lock();
            let version = self.current_version(&mut state);
            keys.iter()
                .map(|key| (*key, self.namespaced_key(&state.namespace, key, version)))
                .collect()
        };
        let ids: Vec<String> = pairs.iter().map(|(_, id)| id.clone()).collect();

        let items = match self.backend.fetch_multiple(&ids) {
            Ok(items) => items,
            Err(e) => {
                self.degraded("fetch_multiple", &ids.join(","), &e);
                return HashMap::new();
            }
        };

        // Presence is decided by the map key, never by the value.
        pairs
            .into_iter()
            .filter_map(|(key, id)| items.get(&id).map(|value| (key.to_owned(), value.clone())))
            .collect()
    }

    fn contains(&self, key: &str) -> bool {
        let id = self.key_for(key);
        self.backend.contains(&id).unwrap_or_else(|e| {
            self.degraded("contains", &id, &e);
            false
        })
    }

    fn save(&self, key: &str, value: &Value, ttl_seconds: u64) -> bool {
        let id = self.key_for(key);
        match self.backend.save(&id, value, ttl_seconds) {
            Ok(()) => true,
            Err(e) => {
                self.degraded("save", &id, &e);
                false
            }
        }
    }

    fn delete(&self, key: &str) -> bool {
        let id = self.key_for(key);
        match self.backend.delete(&id) {
            Ok(()) => true,
            Err(e) => {
                self.degraded("delete", &id, &e);
                false
            }
        }
    }

    fn delete_all(&self) -> bool {
        let mut state = self.lock();

        // Bumping from a guessed version could move the counter backwards.
        let current = match self.load_version(&mut state) {
            Ok(version) => version,
            Err(e) => {
                self.degraded("delete_all", &state.namespace, &e);
                return false;
            }
        };

        let next = current + 1;
        let key = self.version_key(&state.namespace);
        match self
            .backend
            .save(&key, &Value::from(next), state.cache_key_lifetime)
        {
            Ok(()) => {
                tracing::debug!(namespace = %state.namespace, version = next, "bumped namespace version");
                state.version = Some(next);
                true
            }
            Err(e) => {
                self.degraded("delete_all", &key, &e);
                false
            }
        }
    }

    fn flush_all(&self) -> bool {
        match self.backend.flush() {
            Ok(()) => true,
            Err(e) => {
                self.degraded("flush_all", "*", &e);
                false
            }
        }
    }

    fn stats(&self) -> Option<CacheStats> {
        self.backend
            .stats()
            .map_err(|e| self.degraded("stats", "", &e))
            .ok()
    }

    fn set_namespace(&self, namespace: &str) {
        let mut state = self.lock();
        namespace.clone_into(&mut state.namespace);
        state.version = None;
    }

    fn namespace(&self) -> String {
        self.lock().namespace.clone()
    }

    fn set_cache_key_lifetime(&self, seconds: u64) {
        self.lock().cache_key_lifetime = seconds;
    }
}

impl std::fmt::Debug for NamespacedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("NamespacedCache")
            .field("backend", &self.backend.name())
            .field("id_prefix", &self.id_prefix)
            .field("namespace", &state.namespace)
            .field("version", &state.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::MemoryBackend;

    fn cache_with_store(namespace: &str) -> (NamespacedCache, MemoryBackend) {
        let store = MemoryBackend::new();
        let cache = NamespacedCache::new(Box::new(store.clone())).with_namespace(namespace);
        (cache, store)
    }

    /// Counts read calls reaching the wrapped backend.
    struct CountingBackend {
        inner: MemoryBackend,
        reads: Arc<AtomicUsize>,
    }

    impl Backend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn fetch(&self, key: &str) -> Result<Option<Value>, BackendError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(key)
        }

        fn fetch_multiple(&self, keys: &[String]) -> Result<HashMap<String, Value>, BackendError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_multiple(keys)
        }

        fn contains(&self, key: &str) -> Result<bool, BackendError> {
            self.inner.contains(key)
        }

        fn save(&self, key: &str, value: &Value, ttl: u64) -> Result<(), BackendError> {
            self.inner.save(key, value, ttl)
        }

        fn delete(&self, key: &str) -> Result<(), BackendError> {
            self.inner.delete(key)
        }

        fn flush(&self) -> Result<(), BackendError> {
            self.inner.flush()
        }

        fn stats(&self) -> Result<CacheStats, BackendError> {
            self.inner.stats()
        }
    }

    #[test]
    fn test_namespaced_key_format() {
        let (cache, store) = cache_with_store("users");

        assert!(cache.save("42", &json!("Ada"), 0));

        assert_eq!(store.keys(), vec!["users[42][1]".to_owned()]);
    }

    #[test]
    fn test_id_prefix_applies_to_every_key() {
        let store = MemoryBackend::new();
        let cache = NamespacedCache::new(Box::new(store.clone()))
            .with_id_prefix("app:")
            .with_namespace("users");

        assert!(cache.save("42", &json!("Ada"), 0));
        assert!(cache.delete_all());

        assert_eq!(
            store.keys(),
            vec![
                "app:NamespaceCacheKey[users]".to_owned(),
                "app:users[42][1]".to_owned(),
            ]
        );
    }

    #[test]
    fn test_fetch_after_save() {
        let (cache, _) = cache_with_store("pages");

        assert!(cache.save("home", &json!({"title": "Home"}), 60));

        assert_eq!(cache.fetch("home"), Some(json!({"title": "Home"})));
        assert!(cache.contains("home"));
        assert_eq!(cache.fetch("about"), None);
        assert!(!cache.contains("about"));
    }

    #[test]
    fn test_delete_all_hides_old_entries() {
        let (cache, store) = cache_with_store("pages");
        assert!(cache.save("home", &json!("v1"), 0));

        assert!(cache.delete_all());

        assert_eq!(cache.fetch("home"), None);
        assert!(!cache.contains("home"));
        // The old entry is still physically there until the store expires it.
        assert_eq!(store.raw("pages[home][1]"), Some(json!("v1")));
    }

    #[test]
    fn test_delete_all_is_monotonic() {
        let (cache, store) = cache_with_store("pages");
        assert!(cache.save("home", &json!("gen1"), 0));
        assert_eq!(cache.cached_version(), Some(1));

        for n in 1..=3 {
            assert!(cache.delete_all());
            assert_eq!(cache.cached_version(), Some(1 + n));
            assert!(cache.save("home", &json!(format!("gen{}", n + 1)), 0));
        }

        assert_eq!(store.raw("NamespaceCacheKey[pages]"), Some(json!(4)));
        assert_eq!(cache.fetch("home"), Some(json!("gen4")));
        for version in 1..=4 {
            assert_eq!(
                store.raw(&format!("pages[home][{version}]")),
                Some(json!(format!("gen{version}")))
            );
        }
    }

    #[test]
    fn test_delete_all_uses_cache_key_lifetime() {
        let (cache, store) = cache_with_store("pages");
        assert!(cache.delete_all());
        assert_eq!(
            store.ttl("NamespaceCacheKey[pages]"),
            Some(DEFAULT_CACHE_KEY_LIFETIME)
        );

        cache.set_cache_key_lifetime(30 * 86_400);
        assert!(cache.delete_all());
        assert_eq!(store.ttl("NamespaceCacheKey[pages]"), Some(30 * 86_400));
        assert_eq!(cache.cache_key_lifetime(), 30 * 86_400);
    }

    #[test]
    fn test_delete_all_failure_keeps_version() {
        let (cache, store) = cache_with_store("pages");
        assert!(cache.save("home", &json!("v1"), 0));

        store.fail_writes(true);
        assert!(!cache.delete_all());
        store.fail_writes(false);

        assert_eq!(cache.cached_version(), Some(1));
        assert_eq!(cache.fetch("home"), Some(json!("v1")));
    }

    #[test]
    fn test_delete_all_refuses_to_bump_unread_version() {
        let (cache, store) = cache_with_store("pages");
        store.save("NamespaceCacheKey[pages]", &json!(7), 0).unwrap();

        store.fail_reads(true);
        assert!(!cache.delete_all());
        store.fail_reads(false);

        assert_eq!(store.raw("NamespaceCacheKey[pages]"), Some(json!(7)));
        assert!(cache.delete_all());
        assert_eq!(store.raw("NamespaceCacheKey[pages]"), Some(json!(8)));
    }

    #[test]
    fn test_version_read_failure_is_not_cached() {
        let (cache, store) = cache_with_store("pages");
        store.save("NamespaceCacheKey[pages]", &json!(3), 0).unwrap();

        store.fail_reads(true);
        assert_eq!(cache.fetch("home"), None);
        assert_eq!(cache.cached_version(), None);
        store.fail_reads(false);

        assert!(cache.save("home", &json!("x"), 0));
        assert_eq!(cache.cached_version(), Some(3));
        assert_eq!(store.raw("pages[home][3]"), Some(json!("x")));
    }

    #[test]
    fn test_invalid_stored_version_defaults_to_one() {
        let (cache, store) = cache_with_store("pages");
        store
            .save("NamespaceCacheKey[pages]", &json!("garbage"), 0)
            .unwrap();

        cache.fetch("home");

        assert_eq!(cache.cached_version(), Some(DEFAULT_NAMESPACE_VERSION));
    }

    #[test]
    fn test_falsy_values_are_hits() {
        let (cache, _) = cache_with_store("flags");

        for (key, value) in [("f", json!(false)), ("z", json!(0)), ("e", json!(""))] {
            assert!(cache.save(key, &value, 0));
            assert_eq!(cache.fetch(key), Some(value.clone()));
            assert!(cache.contains(key));
        }

        let found = cache.fetch_multiple(&["f", "z", "e"]);
        assert_eq!(found.len(), 3);
        assert_eq!(found["f"], json!(false));
        assert_eq!(found["z"], json!(0));
    }

    #[test]
    fn test_fetch_multiple_returns_present_subset() {
        let (cache, _) = cache_with_store("pages");
        assert!(cache.save("a", &json!(1), 0));
        assert!(cache.save("b", &json!(false), 0));
        assert!(cache.save("c", &json!("gone"), 0));
        assert!(cache.delete("c"));

        let found = cache.fetch_multiple(&["a", "b", "c", "never"]);

        let expected: HashMap<String, Value> =
            [("a".to_owned(), json!(1)), ("b".to_owned(), json!(false))].into();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_fetch_multiple_duplicate_keys() {
        let (cache, _) = cache_with_store("pages");
        assert!(cache.save("a", &json!(1), 0));

        let found = cache.fetch_multiple(&["a", "a"]);

        assert_eq!(found.len(), 1);
        assert_eq!(found["a"], json!(1));
    }

    #[test]
    fn test_fetch_multiple_empty_skips_backend() {
        let reads = Arc::new(AtomicUsize::new(0));
        let cache = NamespacedCache::new(Box::new(CountingBackend {
            inner: MemoryBackend::new(),
            reads: Arc::clone(&reads),
        }));

        assert!(cache.fetch_multiple(&[]).is_empty());
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        cache.fetch_multiple(&["a"]);
        // One version read plus one batched fetch.
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_version_read_once_per_namespace() {
        let reads = Arc::new(AtomicUsize::new(0));
        let cache = NamespacedCache::new(Box::new(CountingBackend {
            inner: MemoryBackend::new(),
            reads: Arc::clone(&reads),
        }));

        cache.save("a", &json!(1), 0);
        cache.save("b", &json!(2), 0);
        cache.delete("a");
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        cache.set_namespace("other");
        cache.save("a", &json!(1), 0);
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (cache, _) = cache_with_store("pages");

        assert!(cache.delete("never-written"));
        assert!(cache.save("k", &json!(1), 0));
        assert!(cache.delete("k"));
        assert!(cache.delete("k"));
        assert_eq!(cache.fetch("k"), None);
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let store = MemoryBackend::new();
        let users = NamespacedCache::new(Box::new(store.clone())).with_namespace("users");
        let pages = NamespacedCache::new(Box::new(store.clone())).with_namespace("pages");

        assert!(users.save("1", &json!("user"), 0));
        assert!(pages.save("1", &json!("page"), 0));
        assert!(users.delete_all());

        assert_eq!(users.fetch("1"), None);
        assert_eq!(pages.fetch("1"), Some(json!("page")));
    }

    #[test]
    fn test_set_namespace_resets_version() {
        let (cache, _) = cache_with_store("pages");
        assert!(cache.delete_all());
        assert_eq!(cache.cached_version(), Some(2));

        cache.set_namespace("users");

        assert_eq!(cache.namespace(), "users");
        assert_eq!(cache.cached_version(), None);
        cache.fetch("x");
        assert_eq!(cache.cached_version(), Some(1));
    }

    #[test]
    fn test_other_instance_sees_bump_only_after_reset() {
        let store = MemoryBackend::new();
        let writer = NamespacedCache::new(Box::new(store.clone())).with_namespace("pages");
        let reader = NamespacedCache::new(Box::new(store.clone())).with_namespace("pages");

        assert!(writer.save("home", &json!("old"), 0));
        assert_eq!(reader.fetch("home"), Some(json!("old")));

        assert!(writer.delete_all());
        assert_eq!(writer.fetch("home"), None);
        // The reader still holds version 1 in memory.
        assert_eq!(reader.fetch("home"), Some(json!("old")));

        reader.set_namespace("pages");
        assert_eq!(reader.fetch("home"), None);
        assert_eq!(reader.cached_version(), Some(2));
    }

    #[test]
    fn test_backend_failures_degrade() {
        let (cache, store) = cache_with_store("pages");
        assert!(cache.save("home", &json!(1), 0));

        store.fail_reads(true);
        store.fail_writes(true);

        assert_eq!(cache.fetch("home"), None);
        assert!(cache.fetch_multiple(&["home"]).is_empty());
        assert!(!cache.contains("home"));
        assert!(!cache.save("home", &json!(2), 0));
        assert!(!cache.delete("home"));
        assert!(!cache.delete_all());
        assert!(!cache.flush_all());
        assert_eq!(cache.stats(), None);
    }

    #[test]
    fn test_flush_all_wipes_every_namespace() {
        let store = MemoryBackend::new();
        let users = NamespacedCache::new(Box::new(store.clone())).with_namespace("users");
        let pages = NamespacedCache::new(Box::new(store.clone())).with_namespace("pages");
        users.save("1", &json!(1), 0);
        pages.save("1", &json!(1), 0);

        assert!(users.flush_all());

        assert!(store.is_empty());
        assert_eq!(pages.fetch("1"), None);
    }

    #[test]
    fn test_stats_passthrough() {
        let (cache, _) = cache_with_store("pages");
        cache.save("k", &json!(1), 0);
        cache.fetch("k");

        let stats = cache.stats().unwrap();
        // Includes the namespace version lookup miss.
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_debug_output() {
        let (cache, _) = cache_with_store("pages");
        let debug = format!("{cache:?}");
        assert!(debug.contains("memory"));
        assert!(debug.contains("pages"));
    }
}
