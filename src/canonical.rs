//! Canonical JSON encoding for content hashing
//!
//! Every value tree that feeds a digest goes through this module: keys
//! sorted by code point, minimal number forms, fixed string escapes
//! (RFC 8785 JSON Canonicalization Scheme).

use serde::Serialize;
use serde_json::Value;

/// Errors for canonical encoding
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("canonicalization error: {0}")]
    Canonicalize(String),

    #[error("non-integer number at {path}: identity-bearing numbers must be integers or strings")]
    FloatRejected { path: String },
}

/// Encode a value into its canonical JSON byte form.
///
/// NaN and Infinity cannot be represented and fail encoding; mapping keys
/// are strings by construction of the value tree.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodingError> {
    serde_json_canonicalizer::to_vec(value).map_err(|e| EncodingError::Canonicalize(e.to_string()))
}

/// Reject floats anywhere in a value tree.
///
/// Applied at the manifest boundary so that every number participating in a
/// digest round-trips exactly. Integers and strings pass through.
pub fn reject_floats(value: &Value, path: &str) -> Result<(), EncodingError> {
    match value {
        Value::Number(n) => {
            if n.as_i64().is_none() && n.as_u64().is_none() {
                return Err(EncodingError::FloatRejected {
                    path: path.to_string(),
                });
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                reject_floats(item, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                reject_floats(item, &format!("{}.{}", path, key))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
