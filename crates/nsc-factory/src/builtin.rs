//! Constructors for the backends shipped with the factory.

use nsc_cache::Backend;
use nsc_cache_memcached::{MemcacheClient, MemcachedBackend};
use nsc_cache_redis::{RedisBackend, RedisConnection};
use nsc_config::{BackendOptions, ConfigError};

use crate::FactoryError;

/// Connect a memcached pool.
pub(crate) fn memcached(options: &BackendOptions) -> Result<Box<dyn Backend>, FactoryError> {
    let servers = memcached_servers(options);
    let client = MemcacheClient::connect(&servers, options.prefix.clone())
        .map_err(|source| FactoryError::connect("memcached", source))?;
    Ok(Box::new(MemcachedBackend::new(client)))
}

/// Connect the Redis primary and, if configured, its read-only replica.
pub(crate) fn redis(options: &BackendOptions) -> Result<Box<dyn Backend>, FactoryError> {
    let (host, port) = options.endpoint().ok_or_else(|| {
        ConfigError::Validation("backends.redis requires host and port".to_owned())
    })?;
    let auth = options.auth();

    let write = RedisConnection::connect(host, port, auth, options.prefix.clone())
        .map_err(|source| FactoryError::connect("redis", source))?;
    let mut backend = RedisBackend::new(write);

    if let Some((host_ro, port_ro)) = options.read_only_endpoint() {
        let read = RedisConnection::connect(host_ro, port_ro, auth, options.prefix.clone())
            .map_err(|source| FactoryError::connect("redis", source))?;
        backend = backend.with_read_only(read);
    }

    Ok(Box::new(backend))
}

/// Pool order: `host`/`port` first, then every `servers` entry.
pub(crate) fn memcached_servers(options: &BackendOptions) -> Vec<String> {
    options
        .endpoint()
        .into_iter()
        .chain(options.servers.iter().map(|s| (s.host.as_str(), s.port)))
        .map(|(host, port)| format!("memcache://{host}:{port}"))
        .collect()
}
