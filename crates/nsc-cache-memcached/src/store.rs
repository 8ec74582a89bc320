//! Client seam for the memcached backend.

use std::collections::HashMap;

use memcache::MemcacheError;
use nsc_cache::{BackendError, BackendErrorKind};

/// Raw memcached operations on encoded bytes.
///
/// [`MemcacheClient`] implements this over a real connection pool; tests use
/// an in-process fake.
pub trait MemcacheStore: Send + Sync {
    /// Read one key.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Read several keys. Absent keys are missing from the returned map.
    fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Vec<u8>>, BackendError>;

    /// Write one key. `expiration` follows the memcached convention: `0` never
    /// expires, values up to 30 days are relative, larger values are Unix times.
    fn set(&self, key: &str, value: &[u8], expiration: u32) -> Result<(), BackendError>;

    /// Delete one key. Returns `false` if the key was not found.
    fn delete(&self, key: &str) -> Result<bool, BackendError>;

    /// Invalidate every item on every server.
    fn flush(&self) -> Result<(), BackendError>;

    /// Statistics of each server, in pool order.
    fn server_stats(&self) -> Result<Vec<(String, HashMap<String, String>)>, BackendError>;
}

/// [`MemcacheStore`] backed by a `memcache` client pool.
///
/// The key prefix is applied here, below the namespacing layer, the way a
/// client-level prefix option would be.
pub struct MemcacheClient {
    client: memcache::Client,
    prefix: String,
}

impl MemcacheClient {
    /// Connect to the given servers (`memcache://host:port` URLs).
    ///
    /// The first server is the one reported by statistics.
    pub fn connect(servers: &[String], prefix: impl Into<String>) -> Result<Self, BackendError> {
        if servers.is_empty() {
            return Err(BackendError::connection("no memcached server configured")
                .with_backend("memcached"));
        }

        let client = memcache::Client::connect(servers.to_vec()).map_err(to_backend_error)?;
        tracing::info!(servers = ?servers, "connected to memcached");

        Ok(Self {
            client,
            prefix: prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl MemcacheStore for MemcacheClient {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.client
            .get::<Vec<u8>>(&self.key(key))
            .map_err(to_backend_error)
    }

    fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, Vec<u8>>, BackendError> {
        let prefixed: Vec<String> = keys.iter().map(|key| self.key(key)).collect();
        let refs: Vec<&str> = prefixed.iter().map(String::as_str).collect();
        let found = self
            .client
            .gets::<Vec<u8>>(&refs)
            .map_err(to_backend_error)?;

        Ok(found
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(self.prefix.as_str())
                    .map(|bare| (bare.to_owned(), value))
            })
            .collect())
    }

    fn set(&self, key: &str, value: &[u8], expiration: u32) -> Result<(), BackendError> {
        self.client
            .set(&self.key(key), value, expiration)
            .map_err(to_backend_error)
    }

    fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.client
            .delete(&self.key(key))
            .map_err(to_backend_error)
    }

    fn flush(&self) -> Result<(), BackendError> {
        self.client.flush().map_err(to_backend_error)
    }

    fn server_stats(&self) -> Result<Vec<(String, HashMap<String, String>)>, BackendError> {
        self.client.stats().map_err(to_backend_error)
    }
}

impl std::fmt::Debug for MemcacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemcacheClient")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn to_backend_error(err: MemcacheError) -> BackendError {
    let kind = match err {
        MemcacheError::IOError(_) => BackendErrorKind::Connection,
        _ => BackendErrorKind::Protocol,
    };
    BackendError::new(kind)
        .with_backend("memcached")
        .with_source(err)
}
