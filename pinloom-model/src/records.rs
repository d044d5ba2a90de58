//! Receiver-side records: pins, ledger events, transactions, user events
//! and namespaces, as persisted by the store.

use crate::message::TransactionType;
use crate::types::Hash;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Derive the ordering context for an unmasked topic: the digest of
/// `namespace:topic`. Private batches mask their contexts with group
/// nonces, so their pins never match this derivation here.
pub fn context_hash(namespace: &str, topic: &str) -> Hash {
    let mut bytes = Vec::with_capacity(namespace.len() + topic.len() + 1);
    bytes.extend_from_slice(namespace.as_bytes());
    bytes.push(b':');
    bytes.extend_from_slice(topic.as_bytes());
    Hash::of(&bytes)
}

/// One persisted context pin. `sequence` is assigned by the store on first
/// insert and preserved across replays; pins are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRecord {
    #[serde(default)]
    pub sequence: u64,
    pub hash: Hash,
    pub batch: Uuid,
    pub index: u32,
    pub signer: String,
    pub masked: bool,
    pub dispatched: bool,
    #[serde(default)]
    pub rejected: bool,
    pub created: u64,
}

/// A ledger event as recorded locally; unique on `(protocol_id, listener)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainEvent {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    /// The listener this event arrived through.
    pub listener: String,
    pub protocol_id: String,
    pub blockchain_tx_id: String,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub info: serde_json::Value,
    pub created: u64,
}

/// A ledger transaction reconciled across the pin events that reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub namespace: String,
    pub blockchain_tx_id: String,
    pub created: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserEventType {
    BlockchainEventReceived,
    MessageConfirmed,
}

/// User-visible event, published on the outward bus once durably recorded.
/// `sequence` is assigned by the store on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: UserEventType,
    pub namespace: String,
    /// The record this event refers to (message id, blockchain event id).
    pub reference: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default)]
    pub sequence: u64,
    pub created: u64,
}

/// A namespace known to this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    pub id: Uuid,
    #[serde(default)]
    pub seq: u64,
    pub name: String,
    pub ntype: String,
    #[serde(default)]
    pub description: String,
    pub created: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<u64>,
}

/// Maximum length of a namespace description.
pub const NAMESPACE_DESCRIPTION_MAX_LEN: usize = 4096;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_hash_distinct() {
        assert_ne!(context_hash("ns1", "topic1"), context_hash("ns1", "topic2"));
        assert_ne!(context_hash("ns1", "topic1"), context_hash("ns2", "topic1"));
        assert_eq!(context_hash("ns1", "topic1"), context_hash("ns1", "topic1"));
    }

    #[test]
    fn test_context_hash_no_splice() {
        // The delimiter keeps (namespace, topic) pairs from aliasing.
        assert_ne!(context_hash("ab", "c"), context_hash("a", "bc"));
    }
}
