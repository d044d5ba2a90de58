//! Canonical JSON encoding and content digests
//!
//! Every hashed structure in pinloom is digested over its canonical JSON
//! bytes: struct fields serialize in declaration order and JSON objects keep
//! sorted keys, so the same value always produces the same bytes.

use crate::types::Hash;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("JSON encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serialize a value to its canonical JSON bytes.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

/// Hash a value's canonical JSON bytes.
pub fn hash_json<T: Serialize>(value: &T) -> Result<Hash, CodecError> {
    Ok(Hash::of(&canonical_json(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_keys_sorted() {
        // serde_json::Value stores objects in a BTreeMap, so key order in the
        // input text does not change the canonical bytes.
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
        assert_eq!(hash_json(&a).unwrap(), hash_json(&b).unwrap());
    }

    #[test]
    fn test_distinct_values_distinct_hashes() {
        let a = json!({"x": 1});
        let b = json!({"x": 2});
        assert_ne!(hash_json(&a).unwrap(), hash_json(&b).unwrap());
    }
}
