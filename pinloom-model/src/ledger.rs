//! Inbound contract of the ledger adapter
//!
//! The adapter observes batch-pin transactions on chain and delivers one
//! `BatchPinEvent` per pin, together with the verified signing identity.
//! These types are the whole of what the core knows about any ledger.

use crate::types::Hash;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The raw ledger event a pin was extracted from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub name: String,
    pub blockchain_tx_id: String,
    /// Position of the event in the chain, unique per listener.
    pub protocol_id: String,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub info: serde_json::Value,
}

/// A batch-pin commitment observed on the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPinEvent {
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    pub batch_id: Uuid,
    pub batch_hash: Hash,
    /// Content reference of the payload in shared storage; empty for
    /// private batches, which travel over the private data channel.
    #[serde(default)]
    pub batch_payload_ref: Option<String>,
    pub contexts: Vec<Hash>,
    pub event: LedgerEvent,
}

impl BatchPinEvent {
    /// Broadcast pins carry a shared-storage payload reference.
    pub fn is_broadcast(&self) -> bool {
        self.batch_payload_ref.as_deref().is_some_and(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierType {
    EthAddress,
    MspId,
}

/// The on-chain identity that signed the pin transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierRef {
    #[serde(rename = "type")]
    pub verifier_type: VerifierType,
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_detection() {
        let mut pin = BatchPinEvent {
            namespace: "ns1".into(),
            transaction_id: None,
            batch_id: Uuid::new_v4(),
            batch_hash: Hash::ZERO,
            batch_payload_ref: Some("bafy123".into()),
            contexts: vec![],
            event: LedgerEvent::default(),
        };
        assert!(pin.is_broadcast());
        pin.batch_payload_ref = Some(String::new());
        assert!(!pin.is_broadcast());
        pin.batch_payload_ref = None;
        assert!(!pin.is_broadcast());
    }
}
