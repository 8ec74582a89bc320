//! Memcached backend for `nsc-cache`.
//!
//! [`MemcachedBackend`] implements [`Backend`] on top of a [`MemcacheStore`],
//! normally a [`MemcacheClient`] connection pool.
//!
//! Protocol specifics handled here:
//!
//! - memcached reads any expiration above 30 days as an absolute Unix time.
//!   Callers always pass relative seconds; larger TTLs are converted before
//!   they reach the store.
//! - There is no native existence check, so `contains` costs a full `get`.
//! - Deleting an absent key counts as success.
//! - Values are always encoded with [`nsc_cache::codec`], never compressed.
//!
//! # Example
//!
//! ```ignore
//! use nsc_cache::{Cache, NamespacedCache};
//! use nsc_cache_memcached::{MemcacheClient, MemcachedBackend};
//!
//! let client = MemcacheClient::connect(&["memcache://127.0.0.1:11211".to_owned()], "app:")?;
//! let cache = NamespacedCache::new(Box::new(MemcachedBackend::new(client)));
//! cache.save("key", &"value".into(), 3600);
//! ```

mod store;

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use nsc_cache::{Backend, BackendError, CacheStats, Value, codec};

pub use store::{MemcacheClient, MemcacheStore};

/// Largest TTL memcached interprets as relative seconds (30 days).
pub const MAX_RELATIVE_TTL: u64 = 30 * 24 * 3600;

/// Memcached [`Backend`].
pub struct MemcachedBackend<S = MemcacheClient> {
    store: S,
    clock: fn() -> u64,
}

impl<S: MemcacheStore> MemcachedBackend<S> {
    /// Create a backend over the given store.
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: unix_now,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

/// Convert a relative TTL into the expiration memcached expects.
///
/// TTLs above [`MAX_RELATIVE_TTL`] become absolute Unix timestamps.
#[must_use]
pub fn expiration(ttl_seconds: u64, now: u64) -> u32 {
    let expiration = if ttl_seconds > MAX_RELATIVE_TTL {
        now.saturating_add(ttl_seconds)
    } else {
        ttl_seconds
    };
    u32::try_from(expiration).unwrap_or(u32::MAX)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Read a numeric counter from a stats block, `0` if missing or malformed.
fn counter(stats: &HashMap<String, String>, name: &str) -> u64 {
    stats
        .get(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

impl<S: MemcacheStore> Backend for MemcachedBackend<S> {
    fn name(&self) -> &'static str {
        "memcached"
    }

    fn fetch(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.store
            .get(key)?
            .map(|bytes| codec::decode(&bytes))
            .transpose()
    }

    fn fetch_multiple(&self, keys: &[String]) -> Result<HashMap<String, Value>, BackendError> {
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let found = self.store.get_multi(&refs)?;

        Ok(found
            .into_iter()
            .filter_map(|(key, bytes)| match codec::decode(&bytes) {
                Ok(value) => Some((key, value)),
                Err(e) => {
                    tracing::warn!(key = %key, "dropping undecodable memcached value: {e}");
                    None
                }
            })
            .collect())
    }

    fn contains(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.store.get(key)?.is_some())
    }

    fn save(&self, key: &str, value: &Value, ttl_seconds: u64) -> Result<(), BackendError> {
        let bytes = codec::encode(value)?;
        self.store
            .set(key, &bytes, expiration(ttl_seconds, (self.clock)()))
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        // `false` means "not found", which is fine.
        self.store.delete(key).map(|_| ())
    }

    fn flush(&self) -> Result<(), BackendError> {
        self.store.flush()
    }

    fn stats(&self) -> Result<CacheStats, BackendError> {
        let servers = self.store.server_stats()?;
        let (_, stats) = servers.first().ok_or_else(|| {
            BackendError::protocol("no server statistics returned").with_backend("memcached")
        })?;

        Ok(CacheStats {
            hits: counter(stats, "get_hits"),
            misses: counter(stats, "get_misses"),
            uptime_seconds: counter(stats, "uptime"),
            memory_used_bytes: counter(stats, "bytes"),
            memory_available_bytes: Some(counter(stats, "limit_maxbytes")),
        })
    }
}

impl<S> std::fmt::Debug for MemcachedBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcachedBackend").finish_non_exhaustive()
    }
}
