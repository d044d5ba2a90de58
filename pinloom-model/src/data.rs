//! Data items carried in a batch payload
//!
//! A data item is a JSON value plus an optional blob reference. Its hash
//! covers the canonical value bytes, extended with the blob hash when one
//! is attached, so neither can be swapped without detection.

use crate::digest::{canonical_json, CodecError};
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reference to an out-of-band blob attached to a data item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub hash: Hash,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub id: Uuid,
    #[serde(default)]
    pub hash: Hash,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
}

impl Data {
    /// Compute the content hash over the canonical value bytes, mixing in
    /// the blob hash when present.
    pub fn compute_hash(&self) -> Result<Hash, CodecError> {
        let mut bytes = canonical_json(&self.value)?;
        if let Some(blob) = &self.blob {
            bytes.extend_from_slice(blob.hash.as_bytes());
        }
        Ok(Hash::of(&bytes))
    }

    /// Fill in the hash from the current value and blob.
    pub fn seal(&mut self) -> Result<(), CodecError> {
        self.hash = self.compute_hash()?;
        Ok(())
    }

    /// True when the stored hash matches the recomputed one.
    pub fn verify_hash(&self) -> bool {
        self.compute_hash().map(|h| h == self.hash).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seal_and_verify() {
        let mut data = Data {
            id: Uuid::new_v4(),
            hash: Hash::ZERO,
            value: json!({"amount": 100}),
            blob: None,
        };
        assert!(!data.verify_hash());
        data.seal().unwrap();
        assert!(data.verify_hash());
    }

    #[test]
    fn test_blob_hash_is_covered() {
        let mut data = Data {
            id: Uuid::new_v4(),
            hash: Hash::ZERO,
            value: json!("doc"),
            blob: Some(BlobRef { hash: Hash::of(b"blob-bytes"), size: 10 }),
        };
        data.seal().unwrap();
        let sealed = data.hash;

        data.blob = Some(BlobRef { hash: Hash::of(b"other-bytes"), size: 10 });
        assert_ne!(data.compute_hash().unwrap(), sealed);
        assert!(!data.verify_hash());
    }

    #[test]
    fn test_tampered_value_fails() {
        let mut data = Data {
            id: Uuid::new_v4(),
            hash: Hash::ZERO,
            value: json!("original"),
            blob: None,
        };
        data.seal().unwrap();
        data.value = json!("tampered");
        assert!(!data.verify_hash());
    }
}
