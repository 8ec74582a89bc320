//! Backend registry and connection memoization.
//!
//! A [`CacheFactory`] maps backend type names to constructors, holds the
//! [`BackendOptions`] of every type, and hands out one shared
//! [`NamespacedCache`] per type. The first [`CacheFactory::get`] for a type
//! opens its connection; later calls return the same `Arc` until the options
//! are replaced with [`CacheFactory::configure`] or the memo table is cleared.
//!
//! `memcached` and `redis` are registered out of the box. Options with
//! `force_dummy = true` yield a [`NullBackend`] instead of a connection.
//!
//! # Example
//!
//! ```ignore
//! use nsc_cache::Cache;
//! use nsc_config::CacheConfig;
//! use nsc_factory::CacheFactory;
//!
//! let factory = CacheFactory::new();
//! factory.configure(CacheConfig::load(None)?);
//!
//! let cache = factory.get("redis")?;
//! cache.set_namespace("users");
//! cache.save("42", &"Ada".into(), 3600);
//! ```

mod builtin;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nsc_cache::{Backend, BackendError, NamespacedCache, NullBackend};
use nsc_config::{BackendOptions, CacheConfig, ConfigError};

/// Builds a backend from the options of its type.
pub type Constructor =
    Arc<dyn Fn(&BackendOptions) -> Result<Box<dyn Backend>, FactoryError> + Send + Sync>;

/// Error raised while registering or building a backend.
#[derive(Debug, thiserror::Error)]
pub enum FactoryError {
    /// No constructor is registered under this name.
    #[error("Unknown cache backend type: {0}")]
    UnknownBackend(String),
    /// Registration refused.
    #[error("Invalid backend registration: {0}")]
    InvalidRegistration(String),
    /// Options of the requested type are invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Opening the connection failed.
    #[error("Failed to connect {backend} backend: {source}")]
    Connect {
        /// Backend type name.
        backend: String,
        /// Underlying store error.
        source: BackendError,
    },
}

impl FactoryError {
    /// Connection failure of backend type `backend`.
    pub fn connect(backend: impl Into<String>, source: BackendError) -> Self {
        Self::Connect {
            backend: backend.into(),
            source,
        }
    }
}

/// Per-type construction lock holding the cache once built.
type BuildSlot = Arc<Mutex<Option<Arc<NamespacedCache>>>>;

struct FactoryState {
    config: CacheConfig,
    registry: HashMap<String, Constructor>,
    /// At most one live cache per type name.
    caches: HashMap<String, Arc<NamespacedCache>>,
    /// Types whose first `get` is in progress.
    building: HashMap<String, BuildSlot>,
}

impl FactoryState {
    fn drop_connections(&mut self) {
        self.caches.clear();
        self.building.clear();
    }
}

/// Registry of backend constructors with per-type connection memoization.
///
/// All methods take `&self`; share the factory itself with `Arc` or a
/// `static` initialized once.
///
/// Connections are opened outside the factory lock, under a lock private to
/// the backend type: concurrent first calls to [`get`](Self::get) for one type
/// open exactly one connection, while other types stay available. A
/// constructor may call `get` for another type, never for its own.
pub struct CacheFactory {
    state: Mutex<FactoryState>,
}

impl Default for CacheFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheFactory {
    /// Create a factory with the built-in backends and no options.
    #[must_use]
    pub fn new() -> Self {
        let mut registry: HashMap<String, Constructor> = HashMap::new();
        registry.insert("memcached".to_owned(), Arc::new(builtin::memcached));
        registry.insert("redis".to_owned(), Arc::new(builtin::redis));

        Self {
            state: Mutex::new(FactoryState {
                config: CacheConfig::default(),
                registry,
                caches: HashMap::new(),
                building: HashMap::new(),
            }),
        }
    }

    /// Create a factory with the built-in backends and the given options.
    #[must_use]
    pub fn with_config(config: CacheConfig) -> Self {
        let factory = Self::new();
        factory.configure(config);
        factory
    }

    fn lock(&self) -> MutexGuard<'_, FactoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace all options and drop every memoized connection.
    pub fn configure(&self, config: CacheConfig) {
        let mut state = self.lock();
        state.config = config;
        state.drop_connections();
        tracing::info!("cache options replaced, connections dropped");
    }

    /// Snapshot of the current options.
    pub fn options(&self) -> CacheConfig {
        self.lock().config.clone()
    }

    /// Options of one backend type.
    pub fn option(&self, name: &str) -> Option<BackendOptions> {
        self.lock().config.backend(name).cloned()
    }

    /// Add or replace the options of one type.
    ///
    /// A connection already opened for that type is kept; call
    /// [`clear_connection_cache`](Self::clear_connection_cache) to rebuild it.
    pub fn set_option(&self, name: &str, options: BackendOptions) {
        self.lock().config.backends.insert(name.to_owned(), options);
    }

    /// Forget all options. Open connections are kept.
    pub fn clear_options(&self) {
        self.lock().config.backends.clear();
    }

    /// Drop every memoized connection. Options are kept.
    pub fn clear_connection_cache(&self) {
        self.lock().drop_connections();
        tracing::info!("cache connections dropped");
    }

    /// Register `constructor` under `name`, replacing any previous entry.
    ///
    /// A connection memoized under `name` is dropped so the next
    /// [`get`](Self::get) uses the new constructor.
    ///
    /// # Errors
    ///
    /// Returns `FactoryError::InvalidRegistration` if `name` is empty or
    /// contains whitespace.
    pub fn register_backend<F>(&self, name: &str, constructor: F) -> Result<(), FactoryError>
    where
        F: Fn(&BackendOptions) -> Result<Box<dyn Backend>, FactoryError> + Send + Sync + 'static,
    {
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(FactoryError::InvalidRegistration(format!(
                "backend type name {name:?} must be non-empty and contain no whitespace"
            )));
        }

        let mut state = self.lock();
        state.registry.insert(name.to_owned(), Arc::new(constructor));
        state.caches.remove(name);
        state.building.remove(name);
        tracing::debug!(backend = name, "registered cache backend");
        Ok(())
    }

    /// Registered backend type names, sorted.
    pub fn backend_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().registry.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Whether a connection is currently memoized for `name`.
    pub fn is_connected(&self, name: &str) -> bool {
        self.lock().caches.contains_key(name)
    }

    /// Shared cache for backend type `name`, connecting on first use.
    ///
    /// # Errors
    ///
    /// - `FactoryError::UnknownBackend` if nothing is registered under `name`
    /// - `FactoryError::Config` if the options of `name` are invalid
    /// - `FactoryError::Connect` if the store cannot be reached
    pub fn get(&self, name: &str) -> Result<Arc<NamespacedCache>, FactoryError> {
        let (constructor, options, slot) = {
            let mut state = self.lock();

            let constructor = state
                .registry
                .get(name)
                .map(Arc::clone)
                .ok_or_else(|| FactoryError::UnknownBackend(name.to_owned()))?;

            if let Some(cache) = state.caches.get(name) {
                return Ok(Arc::clone(cache));
            }

            let options = state.config.backend(name).cloned().unwrap_or_default();
            let slot = Arc::clone(state.building.entry(name.to_owned()).or_default());
            (constructor, options, slot)
        };

        // Lock order: build slot, then factory state.
        let mut built = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = built.as_ref() {
            return Ok(Arc::clone(cache));
        }

        options.validate(name)?;
        let cache = Arc::new(build(&constructor, &options)?);
        *built = Some(Arc::clone(&cache));

        let mut state = self.lock();
        // Options replaced or connections cleared while connecting: hand the
        // cache to this caller only.
        if state
            .building
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            state.building.remove(name);
            state.caches.insert(name.to_owned(), Arc::clone(&cache));
        }
        tracing::info!(
            backend = name,
            driver = cache.backend_name(),
            "opened cache connection"
        );
        Ok(cache)
    }
}

/// Open the backend and wrap it with the options of its type.
fn build(
    constructor: &Constructor,
    options: &BackendOptions,
) -> Result<NamespacedCache, FactoryError> {
    let backend: Box<dyn Backend> = if options.force_dummy {
        Box::new(NullBackend)
    } else {
        constructor(options)?
    };

    let mut cache = NamespacedCache::new(backend);
    if let Some(prefix) = &options.id_prefix {
        cache = cache.with_id_prefix(prefix.clone());
    }
    if let Some(lifetime) = options.cache_key_lifetime {
        cache = cache.with_cache_key_lifetime(lifetime);
    }
    Ok(cache)
}

impl std::fmt::Debug for CacheFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        let mut registered: Vec<&String> = state.registry.keys().collect();
        registered.sort_unstable();
        let mut connected: Vec<&String> = state.caches.keys().collect();
        connected.sort_unstable();

        f.debug_struct("CacheFactory")
            .field("registered", &registered)
            .field("connected", &connected)
            .field("config", &state.config)
            .finish()
    }
}
