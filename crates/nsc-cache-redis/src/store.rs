//! Client seam for the Redis backend.

use std::sync::{Mutex, PoisonError};

use nsc_cache::{BackendError, BackendErrorKind};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use redis::{Cmd, FromRedisValue, RedisError};

/// Raw Redis commands on encoded bytes.
///
/// [`RedisConnection`] implements this over a real connection; tests use an
/// in-process fake.
pub trait RedisStore: Send + Sync {
    /// `GET key`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// `MGET key...`. One reply per key, in order; `None` is Redis nil.
    fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, BackendError>;

    /// `EXISTS key`.
    fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// `SET key value`.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    /// `SETEX key ttl value`.
    fn set_ex(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<(), BackendError>;

    /// `DEL key`, returning the number of removed keys.
    fn del(&self, key: &str) -> Result<i64, BackendError>;

    /// `FLUSHDB` on the selected database.
    fn flush_db(&self) -> Result<(), BackendError>;

    /// Raw `INFO` text.
    fn info(&self) -> Result<String, BackendError>;
}

/// [`RedisStore`] over one blocking `redis` connection.
///
/// The connection is shared behind a mutex. The key prefix is applied here,
/// below the namespacing layer, the way a client-level prefix option would be.
pub struct RedisConnection {
    conn: Mutex<redis::Connection>,
    prefix: String,
    address: String,
}

impl RedisConnection {
    /// Open a connection to `host:port`, authenticating with `auth` if given.
    pub fn connect(
        host: &str,
        port: u16,
        auth: Option<&str>,
        prefix: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let address = format!("{host}:{port}");
        let url = connection_url(host, port, auth);

        let client = redis::Client::open(url.as_str()).map_err(to_backend_error)?;
        let conn = client.get_connection().map_err(to_backend_error)?;
        tracing::info!(%address, "connected to redis");

        Ok(Self {
            conn: Mutex::new(conn),
            prefix: prefix.into(),
            address,
        })
    }

    /// `host:port` this connection talks to.
    pub fn address(&self) -> &str {
        &self.address
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, BackendError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        cmd.query(&mut *conn).map_err(to_backend_error)
    }
}

impl RedisStore for RedisConnection {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.query(redis::cmd("GET").arg(self.key(key)))
    }

    fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, BackendError> {
        let prefixed: Vec<String> = keys.iter().map(|key| self.key(key)).collect();
        self.query(redis::cmd("MGET").arg(&prefixed))
    }

    fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.query(redis::cmd("EXISTS").arg(self.key(key)))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.query(redis::cmd("SET").arg(self.key(key)).arg(value))
    }

    fn set_ex(&self, key: &str, value: &[u8], ttl_seconds: u64) -> Result<(), BackendError> {
        self.query(
            redis::cmd("SETEX")
                .arg(self.key(key))
                .arg(ttl_seconds)
                .arg(value),
        )
    }

    fn del(&self, key: &str) -> Result<i64, BackendError> {
        self.query(redis::cmd("DEL").arg(self.key(key)))
    }

    fn flush_db(&self) -> Result<(), BackendError> {
        self.query(&redis::cmd("FLUSHDB"))
    }

    fn info(&self) -> Result<String, BackendError> {
        self.query(&redis::cmd("INFO"))
    }
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("address", &self.address)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Build a `redis://` URL, percent-encoding the password.
fn connection_url(host: &str, port: u16, auth: Option<&str>) -> String {
    match auth {
        Some(password) if !password.is_empty() => {
            let password = utf8_percent_encode(password, NON_ALPHANUMERIC);
            format!("redis://:{password}@{host}:{port}/")
        }
        _ => format!("redis://{host}:{port}/"),
    }
}

fn to_backend_error(err: RedisError) -> BackendError {
    let kind = if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped()
    {
        BackendErrorKind::Connection
    } else {
        BackendErrorKind::Protocol
    };
    BackendError::new(kind).with_backend("redis").with_source(err)
}
