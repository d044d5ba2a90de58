//! Batches: the unit anchored on the ledger
//!
//! A batch bundles messages and data under one header. Its hash is the
//! digest of a manifest listing every payload member with its content
//! hash, so the on-ledger commitment transitively covers the whole
//! payload.

use crate::data::Data;
use crate::digest::{hash_json, CodecError};
use crate::message::{Message, SignerRef, TransactionType};
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Manifest encoding version; bumped only if the canonical layout changes.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    Broadcast,
    Private,
}

/// Reference to the ledger transaction a batch was pinned under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRef {
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    pub namespace: String,
    pub signer: SignerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Hash>,
    pub created: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPayload {
    pub tx: TransactionRef,
    pub messages: Vec<Message>,
    pub data: Vec<Data>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub header: BatchHeader,
    #[serde(default)]
    pub hash: Hash,
    pub payload: BatchPayload,
    /// Receiver-side timestamp set once the batch is durably persisted;
    /// not part of the wire identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<u64>,
}

/// One payload member in a manifest: its id and content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: Uuid,
    pub hash: Hash,
}

/// Canonical description of a batch's contents, in payload order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub version: u32,
    pub id: Uuid,
    pub tx: TransactionRef,
    pub messages: Vec<ManifestEntry>,
    pub data: Vec<ManifestEntry>,
}

impl Batch {
    /// Build the manifest from the current payload.
    pub fn manifest(&self) -> BatchManifest {
        BatchManifest {
            version: MANIFEST_VERSION,
            id: self.header.id,
            tx: self.payload.tx.clone(),
            messages: self
                .payload
                .messages
                .iter()
                .map(|m| ManifestEntry { id: m.header.id, hash: m.hash })
                .collect(),
            data: self
                .payload
                .data
                .iter()
                .map(|d| ManifestEntry { id: d.id, hash: d.hash })
                .collect(),
        }
    }

    /// Digest of the canonical manifest bytes.
    pub fn manifest_hash(&self) -> Result<Hash, CodecError> {
        hash_json(&self.manifest())
    }

    /// Fill in the batch hash from the current payload.
    pub fn seal(&mut self) -> Result<(), CodecError> {
        self.hash = self.manifest_hash()?;
        Ok(())
    }

    /// True when the stored hash matches the recomputed manifest hash.
    pub fn verify_hash(&self) -> bool {
        self.manifest_hash().map(|h| h == self.hash).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DataRef, MessageHeader, MessageState, MessageType};
    use serde_json::json;

    fn sample_batch() -> Batch {
        let mut data = Data {
            id: Uuid::new_v4(),
            hash: Hash::ZERO,
            value: json!("test"),
            blob: None,
        };
        data.seal().unwrap();

        let mut msg = Message {
            header: MessageHeader {
                id: Uuid::new_v4(),
                message_type: MessageType::Broadcast,
                signer: SignerRef { author: "org1".into(), key: "0x12345".into() },
                namespace: "ns1".into(),
                topics: vec!["topic1".into()],
                tx_type: TransactionType::BatchPin,
                group: None,
                created: 1_700_000_000_000,
                data_refs: vec![DataRef { id: data.id, hash: data.hash }],
                data_hash: Hash::ZERO,
            },
            hash: Hash::ZERO,
            local_state: MessageState::default(),
        };
        msg.seal().unwrap();

        Batch {
            header: BatchHeader {
                id: Uuid::new_v4(),
                batch_type: BatchType::Broadcast,
                namespace: "ns1".into(),
                signer: SignerRef { author: "org1".into(), key: "0x12345".into() },
                node: Some(Uuid::new_v4()),
                group: None,
                created: 1_700_000_000_000,
            },
            hash: Hash::ZERO,
            payload: BatchPayload {
                tx: TransactionRef { tx_type: TransactionType::BatchPin, id: Some(Uuid::new_v4()) },
                messages: vec![msg],
                data: vec![data],
            },
            confirmed: None,
        }
    }

    #[test]
    fn test_seal_and_verify() {
        let mut batch = sample_batch();
        batch.seal().unwrap();
        assert!(batch.verify_hash());
    }

    #[test]
    fn test_manifest_covers_payload() {
        let mut batch = sample_batch();
        batch.seal().unwrap();
        let sealed = batch.hash;

        // Tampering with a message hash changes the manifest hash.
        batch.payload.messages[0].hash = Hash::of(b"forged");
        assert_ne!(batch.manifest_hash().unwrap(), sealed);
        assert!(!batch.verify_hash());
    }

    #[test]
    fn test_wire_roundtrip_preserves_hash() {
        let mut batch = sample_batch();
        batch.seal().unwrap();

        let bytes = serde_json::to_vec(&batch).unwrap();
        let decoded: Batch = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded.hash, batch.hash);
        assert!(decoded.verify_hash());
    }
}
