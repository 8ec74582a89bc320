//! Namespaced cache abstraction over simple key-value stores.
//!
//! Network caches such as memcached or Redis only offer single-key (or small
//! batch) operations; there is no cheap "delete everything under prefix X".
//! This crate adds that capability through generation-counter namespacing:
//! every logical key is rewritten to embed the current version of its
//! namespace, and invalidating a namespace is a single store of an incremented
//! version number. Old entries become unreachable and are reclaimed by the
//! store's own eviction.
//!
//! Two traits form the core API:
//!
//! - [`Backend`]: primitive operations against one concrete store, on
//!   already-namespaced keys
//! - [`Cache`]: the public, fail-soft contract implemented by [`NamespacedCache`]
//!
//! # Implementations
//!
//! - [`NamespacedCache`]: the namespace-versioning decorator over any [`Backend`]
//! - [`NullBackend`]: no-op backend (always misses, every write succeeds)
//! - `MemoryBackend`: in-process backend for tests (behind the `mock` feature)
//!
//! # Example
//!
//! ```
//! use nsc_cache::{Cache, NamespacedCache, NullBackend, Value};
//!
//! let cache = NamespacedCache::new(Box::new(NullBackend));
//! cache.set_namespace("pages");
//! assert!(cache.save("home", &Value::from("<html>hello</html>"), 0));
//! assert_eq!(cache.fetch("home"), None); // NullBackend always misses
//! ```

pub mod codec;
mod error;
mod ext;
#[cfg(any(test, feature = "mock"))]
mod memory;
mod namespaced;

use std::collections::HashMap;

pub use error::{BackendError, BackendErrorKind};
pub use ext::CacheExt;
#[cfg(any(test, feature = "mock"))]
pub use memory::MemoryBackend;
pub use namespaced::{DEFAULT_CACHE_KEY_LIFETIME, DEFAULT_NAMESPACE_VERSION, NamespacedCache};

/// A cached value.
///
/// Any JSON-representable value can be stored. Falsy values (`false`, `0`,
/// `""`, `null`) are ordinary values: a key holding `false` is present.
pub type Value = serde_json::Value;

/// Usage statistics reported by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Number of read hits.
    pub hits: u64,
    /// Number of read misses.
    pub misses: u64,
    /// Seconds since the store started.
    pub uptime_seconds: u64,
    /// Bytes currently used by stored data.
    pub memory_used_bytes: u64,
    /// Configured memory limit in bytes, `None` when the store has no such concept.
    pub memory_available_bytes: Option<u64>,
}

/// Primitive operations against one concrete store.
///
/// Keys passed to a backend are already namespaced. Implementations report
/// failures as [`BackendError`]; turning those into cache misses and failed
/// writes is the job of [`NamespacedCache`].
///
/// Values are written with one fixed serialization format (see [`codec`]) so
/// that every writer of the same store stays wire-compatible.
pub trait Backend: Send + Sync {
    /// Short backend identifier used in logs (e.g., "redis").
    fn name(&self) -> &'static str;

    /// Fetch a single value. `Ok(None)` means the key is absent.
    fn fetch(&self, key: &str) -> Result<Option<Value>, BackendError>;

    /// Fetch several values in one batch.
    ///
    /// The returned map contains only keys that are present in the store,
    /// regardless of whether their value is falsy.
    fn fetch_multiple(&self, keys: &[String]) -> Result<HashMap<String, Value>, BackendError>;

    /// Check whether a key is present.
    fn contains(&self, key: &str) -> Result<bool, BackendError>;

    /// Store a value. A `ttl_seconds` of `0` means no expiry.
    fn save(&self, key: &str, value: &Value, ttl_seconds: u64) -> Result<(), BackendError>;

    /// Delete a key. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), BackendError>;

    /// Wipe the whole store.
    fn flush(&self) -> Result<(), BackendError>;

    /// Read store statistics.
    fn stats(&self) -> Result<CacheStats, BackendError>;
}

/// The public cache contract, operating on logical keys.
///
/// Every operation is total: backend failures degrade to misses (`None`,
/// empty maps, `false`) and failed writes (`false`), never to errors.
pub trait Cache: Send + Sync {
    /// Fetch the value stored under `key`.
    fn fetch(&self, key: &str) -> Option<Value>;

    /// Fetch several keys at once.
    ///
    /// Returns a map holding only the requested keys that are present.
    fn fetch_multiple(&self, keys: &[&str]) -> HashMap<String, Value>;

    /// Check whether `key` is present.
    fn contains(&self, key: &str) -> bool;

    /// Store `value` under `key`. A `ttl_seconds` of `0` means no expiry.
    fn save(&self, key: &str, value: &Value, ttl_seconds: u64) -> bool;

    /// Delete `key`. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> bool;

    /// Invalidate every key of the current namespace.
    fn delete_all(&self) -> bool;

    /// Wipe the entire underlying store, all namespaces included.
    fn flush_all(&self) -> bool;

    /// Read store statistics.
    fn stats(&self) -> Option<CacheStats>;

    /// Switch to another namespace, forgetting the cached version.
    fn set_namespace(&self, namespace: &str);

    /// Current namespace name.
    fn namespace(&self) -> String;

    /// Set the TTL in seconds applied to the namespace version record.
    fn set_cache_key_lifetime(&self, seconds: u64);
}

/// No-op [`Backend`] used when caching is disabled.
///
/// Every read misses, every write and delete succeeds, stats are zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn fetch(&self, _key: &str) -> Result<Option<Value>, BackendError> {
        Ok(None)
    }

    fn fetch_multiple(&self, _keys: &[String]) -> Result<HashMap<String, Value>, BackendError> {
        Ok(HashMap::new())
    }

    fn contains(&self, _key: &str) -> Result<bool, BackendError> {
        Ok(false)
    }

    fn save(&self, _key: &str, _value: &Value, _ttl_seconds: u64) -> Result<(), BackendError> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> Result<(), BackendError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn stats(&self) -> Result<CacheStats, BackendError> {
        Ok(CacheStats::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(NullBackend: Backend, Send, Sync);
    assert_impl_all!(NamespacedCache: Cache, Send, Sync);

    #[test]
    fn test_null_backend_always_misses() {
        let cache = NamespacedCache::new(Box::new(NullBackend));

        assert!(cache.save("key", &Value::from("hello"), 0));
        assert_eq!(cache.fetch("key"), None);
        assert!(!cache.contains("key"));
        assert!(cache.fetch_multiple(&["key", "other"]).is_empty());
    }

    #[test]
    fn test_null_backend_writes_succeed() {
        let cache = NamespacedCache::new(Box::new(NullBackend));

        assert!(cache.delete("never-written"));
        assert!(cache.delete_all());
        assert!(cache.flush_all());
    }

    #[test]
    fn test_null_backend_zero_stats() {
        let cache = NamespacedCache::new(Box::new(NullBackend));
        assert_eq!(cache.stats(), Some(CacheStats::default()));
        assert_eq!(cache.stats().unwrap().memory_available_bytes, None);
    }
}
