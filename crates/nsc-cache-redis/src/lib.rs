//! Redis backend for `nsc-cache`.
//!
//! [`RedisBackend`] holds a read-write connection and an optional read-only
//! connection (typically to a replica). Reads (`fetch`, `fetch_multiple`,
//! `contains`, `stats`) go to the read-only connection when one is set; writes
//! (`save`, `delete`, `flush`, and therefore namespace version bumps) always go
//! to the read-write connection.
//!
//! `MGET` answers nil both for absent keys and for keys it cannot return as a
//! string. Every nil reply is double-checked with `EXISTS`, and a key is only
//! reported when that check confirms it and a direct `GET` returns a value.
//! A failed check counts as a miss.
//!
//! # Example
//!
//! ```ignore
//! use nsc_cache::{Cache, NamespacedCache};
//! use nsc_cache_redis::{RedisBackend, RedisConnection};
//!
//! let primary = RedisConnection::connect("10.0.0.1", 6379, None, "app:")?;
//! let replica = RedisConnection::connect("10.0.0.2", 6379, None, "app:")?;
//! let backend = RedisBackend::new(primary).with_read_only(replica);
//! let cache = NamespacedCache::new(Box::new(backend));
//! ```

mod store;

use std::collections::HashMap;

use nsc_cache::{Backend, BackendError, CacheStats, Value, codec};

pub use store::{RedisConnection, RedisStore};

/// Redis [`Backend`] with an optional read-only connection.
pub struct RedisBackend<S = RedisConnection> {
    write: S,
    read: Option<S>,
}

impl<S: RedisStore> RedisBackend<S> {
    /// Create a backend using `write` for every operation.
    #[must_use]
    pub fn new(write: S) -> Self {
        Self { write, read: None }
    }

    /// Route read operations to `read` instead of the write connection.
    #[must_use]
    pub fn with_read_only(mut self, read: S) -> Self {
        self.read = Some(read);
        self
    }

    /// Whether a separate read-only connection is configured.
    pub fn has_read_only(&self) -> bool {
        self.read.is_some()
    }

    /// The read-write connection.
    pub fn writer(&self) -> &S {
        &self.write
    }

    /// The connection used for reads (the read-write one if no replica is set).
    pub fn reader(&self) -> &S {
        self.read.as_ref().unwrap_or(&self.write)
    }

    /// Resolve a nil `MGET` reply: keep the key only if it provably exists.
    fn recheck_nil(&self, key: &str) -> Option<Value> {
        let reader = self.reader();
        match reader.exists(key) {
            Ok(true) => tracing::debug!(key, "nil MGET reply for existing key, re-reading"),
            Ok(false) => return None,
            Err(e) => {
                tracing::debug!(key, "existence check failed, treating as miss: {e}");
                return None;
            }
        }

        match reader.get(key) {
            Ok(Some(bytes)) => decode_or_drop(key, &bytes),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(key, "re-read after existence check failed: {e}");
                None
            }
        }
    }
}

fn decode_or_drop(key: &str, bytes: &[u8]) -> Option<Value> {
    match codec::decode(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, "dropping undecodable redis value: {e}");
            None
        }
    }
}

/// Parse `INFO` output into a field map.
fn parse_info(info: &str) -> HashMap<&str, &str> {
    info.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .collect()
}

fn counter(info: &HashMap<&str, &str>, name: &str) -> u64 {
    info.get(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

impl<S: RedisStore> Backend for RedisBackend<S> {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn fetch(&self, key: &str) -> Result<Option<Value>, BackendError> {
        self.reader()
            .get(key)?
            .map(|bytes| codec::decode(&bytes))
            .transpose()
    }

    fn fetch_multiple(&self, keys: &[String]) -> Result<HashMap<String, Value>, BackendError> {
        let replies = self.reader().mget(keys)?;
        if replies.len() != keys.len() {
            return Err(BackendError::protocol(format!(
                "MGET returned {} replies for {} keys",
                replies.len(),
                keys.len()
            ))
            .with_backend("redis"));
        }

        let mut found = HashMap::with_capacity(keys.len());
        for (key, reply) in keys.iter().zip(replies) {
            let value = match reply {
                Some(bytes) => decode_or_drop(key, &bytes),
                None => self.recheck_nil(key),
            };
            if let Some(value) = value {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    fn contains(&self, key: &str) -> Result<bool, BackendError> {
        self.reader().exists(key)
    }

    fn save(&self, key: &str, value: &Value, ttl_seconds: u64) -> Result<(), BackendError> {
        let bytes = codec::encode(value)?;
        if ttl_seconds > 0 {
            self.write.set_ex(key, &bytes, ttl_seconds)
        } else {
            self.write.set(key, &bytes)
        }
    }

    fn delete(&self, key: &str) -> Result<(), BackendError> {
        let removed = self.write.del(key)?;
        if removed < 0 {
            return Err(
                BackendError::protocol(format!("DEL returned {removed}")).with_backend("redis")
            );
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), BackendError> {
        self.write.flush_db()
    }

    fn stats(&self) -> Result<CacheStats, BackendError> {
        let raw = self.reader().info()?;
        let info = parse_info(&raw);

        Ok(CacheStats {
            hits: counter(&info, "keyspace_hits"),
            misses: counter(&info, "keyspace_misses"),
            uptime_seconds: counter(&info, "uptime_in_seconds"),
            memory_used_bytes: counter(&info, "used_memory"),
            memory_available_bytes: None,
        })
    }
}

impl<S> std::fmt::Debug for RedisBackend<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("read_only", &self.read.is_some())
            .finish_non_exhaustive()
    }
}
