//! Backend options for the cache factory.
//!
//! Options can be built in code or parsed from an `nsc.toml` file, one table
//! per backend type:
//!
//! ```toml
//! [backends.redis]
//! host = "${REDIS_HOST:-127.0.0.1}"
//! port = 6379
//! host_ro = "replica.internal"
//! port_ro = 6379
//! prefix = "app:"
//! auth = "${REDIS_PASSWORD}"
//! cache_key_lifetime = 86400
//! id_prefix = "v2:"
//!
//! [backends.memcached]
//! host = "127.0.0.1"
//! port = 11211
//! servers = [{ host = "10.0.0.2", port = 11211 }]
//! ```
//!
//! ## Environment Variable Expansion
//!
//! - `${VAR}` - expands to the value of VAR, errors if unset
//! - `${VAR:-default}` - expands to VAR if set, otherwise uses default
//!
//! Expanded fields: `host`, `host_ro`, `auth`, and `host` of every `servers`
//! entry.

mod expand;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Configuration filename to search for.
const CONFIG_FILENAME: &str = "nsc.toml";

/// Options for every backend type, keyed by type name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Per-type options (`[backends.<type>]`).
    pub backends: BTreeMap<String, BackendOptions>,

    /// Path to the config file (set after loading).
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

/// Options of one backend type.
///
/// Which fields matter depends on the backend: `servers` is only read by
/// memcached, `host_ro`/`port_ro` and `auth` only by Redis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendOptions {
    /// Primary server host.
    pub host: Option<String>,
    /// Primary server port.
    pub port: Option<u16>,
    /// Additional servers, after the primary one.
    pub servers: Vec<ServerAddress>,
    /// Read-only replica host.
    #[serde(alias = "hostRO")]
    pub host_ro: Option<String>,
    /// Read-only replica port.
    #[serde(alias = "portRO")]
    pub port_ro: Option<u16>,
    /// Key prefix applied by the store client, below namespacing.
    pub prefix: String,
    /// Password sent on connect.
    pub auth: Option<String>,
    /// TTL in seconds of namespace version records.
    #[serde(alias = "cacheKeyLifetime")]
    pub cache_key_lifetime: Option<u64>,
    /// String prepended to every key the cache emits.
    #[serde(alias = "idPrefix")]
    pub id_prefix: Option<String>,
    /// Use the no-op backend instead of connecting.
    #[serde(alias = "forceDummy")]
    pub force_dummy: bool,
}

/// One `host:port` pair of an additional server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerAddress {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
}

impl ServerAddress {
    /// Create an address from a host and a port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File not found.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Validation error.
    #[error("Configuration error: {0}")]
    Validation(String),
    /// Environment variable error during expansion.
    #[error("Environment variable error in {field}: {message}")]
    EnvVar {
        /// Config field path (e.g., "`backends.redis.auth`").
        field: String,
        /// Error message (e.g., "${`REDIS_PASSWORD`} not set").
        message: String,
    },
}

fn require_non_empty(value: &str, field: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

fn require_port(port: u16, field: &str) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::Validation(format!("{field} cannot be 0")));
    }
    Ok(())
}

impl BackendOptions {
    /// Primary `host`/`port`, when both are set.
    pub fn endpoint(&self) -> Option<(&str, u16)> {
        Some((self.host.as_deref()?, self.port?))
    }

    /// Read-only `host_ro`/`port_ro`, when both are set.
    pub fn read_only_endpoint(&self) -> Option<(&str, u16)> {
        Some((self.host_ro.as_deref()?, self.port_ro?))
    }

    /// `auth`, with an empty string treated as absent.
    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref().filter(|a| !a.is_empty())
    }

    /// Validate the options of backend `name`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Validation` naming the offending field.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let field = |f: &str| format!("backends.{name}.{f}");

        if let Some(host) = &self.host {
            require_non_empty(host, &field("host"))?;
        }
        if let Some(port) = self.port {
            require_port(port, &field("port"))?;
        }
        for (i, server) in self.servers.iter().enumerate() {
            require_non_empty(&server.host, &field(&format!("servers[{i}].host")))?;
            require_port(server.port, &field(&format!("servers[{i}].port")))?;
        }

        match (&self.host_ro, self.port_ro) {
            (Some(host), Some(port)) => {
                require_non_empty(host, &field("host_ro"))?;
                require_port(port, &field("port_ro"))?;
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "{} and {} must be set together",
                    field("host_ro"),
                    field("port_ro")
                )));
            }
        }

        if self.cache_key_lifetime == Some(0) {
            return Err(ConfigError::Validation(format!(
                "{} must be greater than 0",
                field("cache_key_lifetime")
            )));
        }

        Ok(())
    }

    fn expand_env_vars(&mut self, name: &str) -> Result<(), ConfigError> {
        if let Some(host) = &self.host {
            self.host = Some(expand::expand_env(host, &format!("backends.{name}.host"))?);
        }
        if let Some(host) = &self.host_ro {
            self.host_ro = Some(expand::expand_env(host, &format!("backends.{name}.host_ro"))?);
        }
        if let Some(auth) = &self.auth {
            self.auth = Some(expand::expand_env(auth, &format!("backends.{name}.auth"))?);
        }
        for (i, server) in self.servers.iter_mut().enumerate() {
            server.host =
                expand::expand_env(&server.host, &format!("backends.{name}.servers[{i}].host"))?;
        }
        Ok(())
    }
}

impl CacheConfig {
    /// Load configuration.
    ///
    /// If `config_path` is provided, loads from that file. Otherwise, searches
    /// for `nsc.toml` in the current directory and its parents; when none is
    /// found the configuration is empty.
    ///
    /// # Errors
    ///
    /// Returns error if explicit `config_path` doesn't exist, or if reading,
    /// parsing, expansion or validation fails.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            return Self::load_from_file(path);
        }

        match Self::discover_config() {
            Some(discovered) => Self::load_from_file(&discovered),
            None => Ok(Self::default()),
        }
    }

    /// Parse, expand and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns error if parsing, expansion or validation fails.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.expand_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Options for backend `name`, if configured.
    pub fn backend(&self, name: &str) -> Option<&BackendOptions> {
        self.backends.get(name)
    }

    /// Validate every backend table.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError::Validation` found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.backends
            .iter()
            .try_for_each(|(name, options)| options.validate(name))
    }

    /// Search for config file in current directory and parents.
    fn discover_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        discover_from(&current)
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    fn expand_env_vars(&mut self) -> Result<(), ConfigError> {
        for (name, options) in &mut self.backends {
            options.expand_env_vars(name)?;
        }
        Ok(())
    }
}

fn discover_from(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILENAME))
        .find(|candidate| candidate.is_file())
}
