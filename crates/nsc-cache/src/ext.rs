//! Extension trait for [`Cache`] with typed convenience methods.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Cache;

/// Typed convenience methods for [`Cache`].
///
/// Provides `fetch_as`/`save_as` for serde types. These are default methods
/// on an extension trait so that [`Cache`] stays object-safe and callers get
/// typed access through a blanket impl.
///
/// # Example
///
/// ```
/// use nsc_cache::{CacheExt, NamespacedCache, NullBackend};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Profile { name: String }
///
/// let cache = NamespacedCache::new(Box::new(NullBackend));
///
/// cache.save_as("profile:1", &Profile { name: "Ada".into() }, 60);
/// let profile: Option<Profile> = cache.fetch_as("profile:1");
/// assert!(profile.is_none());
/// ```
pub trait CacheExt: Cache {
    /// Fetch and deserialize a value.
    ///
    /// Returns `None` on cache miss or when the stored value does not match `T`.
    fn fetch_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.fetch(key)?;
        serde_json::from_value(value).ok()
    }

    /// Serialize and store a value.
    ///
    /// Returns `false` if serialization or the write fails.
    fn save_as<T: Serialize>(&self, key: &str, value: &T, ttl_seconds: u64) -> bool {
        match serde_json::to_value(value) {
            Ok(value) => self.save(key, &value, ttl_seconds),
            Err(e) => {
                tracing::warn!(key, "failed to serialize cache value: {e}");
                false
            }
        }
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBackend, NamespacedCache};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Page {
        title: String,
        draft: bool,
    }

    #[test]
    fn test_typed_round_trip() {
        let cache = NamespacedCache::new(Box::new(MemoryBackend::new()));
        let page = Page {
            title: "Guide".to_owned(),
            draft: false,
        };

        assert!(cache.save_as("guide", &page, 0));
        assert_eq!(cache.fetch_as::<Page>("guide"), Some(page));
    }

    #[test]
    fn test_fetch_as_false_is_a_hit() {
        let cache = NamespacedCache::new(Box::new(MemoryBackend::new()));

        assert!(cache.save_as("flag", &false, 0));
        assert_eq!(cache.fetch_as::<bool>("flag"), Some(false));
    }

    #[test]
    fn test_fetch_as_type_mismatch_is_a_miss() {
        let cache = NamespacedCache::new(Box::new(MemoryBackend::new()));

        assert!(cache.save_as("count", &"not a number", 0));
        assert_eq!(cache.fetch_as::<u32>("count"), None);
    }
}
