//! Fixed value serialization shared by every backend.
//!
//! Values are always written as JSON, on every connection, regardless of any
//! serializer or compression the store client might offer. Processes written
//! in other languages can read and write the same entries as long as they use
//! the same format.

use crate::{BackendError, BackendErrorKind, Value};

/// Name of the serialization format.
pub const FORMAT: &str = "json";

/// Encode a value into its stored representation.
pub fn encode(value: &Value) -> Result<Vec<u8>, BackendError> {
    serde_json::to_vec(value)
        .map_err(|e| BackendError::new(BackendErrorKind::Codec).with_source(e))
}

/// Decode a stored representation back into a value.
pub fn decode(bytes: &[u8]) -> Result<Value, BackendError> {
    serde_json::from_slice(bytes)
        .map_err(|e| BackendError::new(BackendErrorKind::Codec).with_source(e))
}
