//! Messages: the user-visible unit of exchange
//!
//! A message header names its author, namespace, topics and the data items
//! it carries. The header embeds `data_hash` (digest of the ordered data
//! reference hashes) and the message hash is the digest of the whole
//! header, chaining message integrity down to each data item.

use crate::digest::{hash_json, CodecError};
use crate::names::{validate_topics, NameError};
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Signing identity attached to batches and messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerRef {
    /// Canonical author identifier (resolved from the signing key).
    pub author: String,
    /// Raw signing key as it appeared on the ledger.
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Broadcast,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    BatchPin,
    Unpinned,
}

/// Receiver-side delivery state of a message. Never regresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    #[default]
    Pending,
    Ready,
    Confirmed,
    Rejected,
}

impl MessageState {
    /// Whether moving to `next` is a legal forward transition.
    pub fn can_transition(self, next: MessageState) -> bool {
        use MessageState::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, _) => true,
            (Ready, Confirmed) | (Ready, Rejected) => true,
            _ => false,
        }
    }

    /// Terminal states cannot change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Confirmed | MessageState::Rejected)
    }
}

/// Reference from a message header to a data item in the same batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    pub id: Uuid,
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub signer: SignerRef,
    pub namespace: String,
    pub topics: Vec<String>,
    pub tx_type: TransactionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Hash>,
    pub created: u64,
    pub data_refs: Vec<DataRef>,
    #[serde(default)]
    pub data_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub header: MessageHeader,
    #[serde(default)]
    pub hash: Hash,
    /// Local delivery state; not part of the wire identity of the message.
    #[serde(default)]
    pub local_state: MessageState,
}

#[derive(Error, Debug)]
pub enum SealError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Name(#[from] NameError),
}

/// Digest of an ordered list of data reference hashes: the raw 32-byte
/// hashes concatenated in reference order.
pub fn data_refs_hash(refs: &[DataRef]) -> Hash {
    let mut bytes = Vec::with_capacity(refs.len() * 32);
    for r in refs {
        bytes.extend_from_slice(r.hash.as_bytes());
    }
    Hash::of(&bytes)
}

impl Message {
    /// Validate topics, then fill in `data_hash` and the header hash.
    pub fn seal(&mut self) -> Result<(), SealError> {
        validate_topics(&self.header.topics)?;
        self.header.data_hash = data_refs_hash(&self.header.data_refs);
        self.hash = hash_json(&self.header)?;
        Ok(())
    }

    /// Recompute and compare `data_hash` and the header hash. Topic bounds
    /// are re-checked so an over-long list is rejected even if internally
    /// consistent.
    pub fn verify_hash(&self) -> bool {
        if validate_topics(&self.header.topics).is_err() {
            return false;
        }
        if self.header.data_hash != data_refs_hash(&self.header.data_refs) {
            return false;
        }
        hash_json(&self.header).map(|h| h == self.hash).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(topics: Vec<String>) -> Message {
        Message {
            header: MessageHeader {
                id: Uuid::new_v4(),
                message_type: MessageType::Broadcast,
                signer: SignerRef { author: "org1".into(), key: "0x12345".into() },
                namespace: "ns1".into(),
                topics,
                tx_type: TransactionType::BatchPin,
                group: None,
                created: 1_700_000_000_000,
                data_refs: vec![DataRef { id: Uuid::new_v4(), hash: Hash::of(b"d1") }],
                data_hash: Hash::ZERO,
            },
            hash: Hash::ZERO,
            local_state: MessageState::default(),
        }
    }

    #[test]
    fn test_seal_and_verify() {
        let mut msg = sample_message(vec!["topic1".into()]);
        msg.seal().unwrap();
        assert!(msg.verify_hash());
    }

    #[test]
    fn test_tampered_data_ref_fails() {
        let mut msg = sample_message(vec!["topic1".into()]);
        msg.seal().unwrap();
        msg.header.data_refs[0].hash = Hash::of(b"swapped");
        assert!(!msg.verify_hash());
    }

    #[test]
    fn test_seal_rejects_bad_topics() {
        let mut msg = sample_message((0..16).map(|i| format!("t{}", i)).collect());
        assert!(msg.seal().is_err());

        let mut msg = sample_message(vec!["x".repeat(65)]);
        assert!(msg.seal().is_err());
    }

    #[test]
    fn test_verify_rechecks_topics() {
        // A message sealed before the topics were mangled still fails
        // verification on the receiver.
        let mut msg = sample_message(vec!["topic1".into()]);
        msg.seal().unwrap();
        msg.header.topics = (0..16).map(|i| format!("t{}", i)).collect();
        assert!(!msg.verify_hash());
    }

    #[test]
    fn test_state_transitions() {
        use MessageState::*;
        assert!(Pending.can_transition(Confirmed));
        assert!(Pending.can_transition(Rejected));
        assert!(Ready.can_transition(Confirmed));
        assert!(!Confirmed.can_transition(Pending));
        assert!(!Rejected.can_transition(Confirmed));
        assert!(Confirmed.can_transition(Confirmed));
    }
}
