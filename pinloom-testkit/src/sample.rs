//! Builders for sealed sample batches and their pin events

use pinloom_model::{
    context_hash, Batch, BatchHeader, BatchPayload, BatchPinEvent, BatchType, Data, DataRef, Hash,
    LedgerEvent, Message, MessageHeader, MessageState, MessageType, SignerRef, TransactionRef,
    TransactionType, VerifierRef, VerifierType,
};
use serde_json::Value;
use uuid::Uuid;

pub const SAMPLE_CREATED: u64 = 1_700_000_000_000;

/// A sealed data item carrying the given JSON value.
pub fn sample_data(value: Value) -> Data {
    let mut data = Data { id: Uuid::new_v4(), hash: Hash::ZERO, value, blob: None };
    data.seal().expect("seal sample data");
    data
}

/// A sealed broadcast message referencing the given data items.
pub fn sample_message(
    namespace: &str,
    author: &str,
    key: &str,
    topics: &[&str],
    data: &[Data],
) -> Message {
    let mut msg = Message {
        header: MessageHeader {
            id: Uuid::new_v4(),
            message_type: MessageType::Broadcast,
            signer: SignerRef { author: author.into(), key: key.into() },
            namespace: namespace.into(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            tx_type: TransactionType::BatchPin,
            group: None,
            created: SAMPLE_CREATED,
            data_refs: data.iter().map(|d| DataRef { id: d.id, hash: d.hash }).collect(),
            data_hash: Hash::ZERO,
        },
        hash: Hash::ZERO,
        local_state: MessageState::Pending,
    };
    msg.seal().expect("seal sample message");
    msg
}

/// A sealed broadcast batch bundling the given messages and data under
/// one author.
pub fn sample_batch(
    namespace: &str,
    author: &str,
    key: &str,
    messages: Vec<Message>,
    data: Vec<Data>,
) -> Batch {
    let mut batch = Batch {
        header: BatchHeader {
            id: Uuid::new_v4(),
            batch_type: BatchType::Broadcast,
            namespace: namespace.into(),
            signer: SignerRef { author: author.into(), key: key.into() },
            node: Some(Uuid::new_v4()),
            group: None,
            created: SAMPLE_CREATED,
        },
        hash: Hash::ZERO,
        payload: BatchPayload {
            tx: TransactionRef { tx_type: TransactionType::BatchPin, id: Some(Uuid::new_v4()) },
            messages,
            data,
        },
        confirmed: None,
    };
    batch.seal().expect("seal sample batch");
    batch
}

/// The pin event a ledger listener would deliver for a broadcast batch:
/// one unmasked context per (message, topic) pair, in payload order.
pub fn pin_for_batch(batch: &Batch, payload_ref: &str, protocol_id: &str) -> BatchPinEvent {
    let contexts = batch
        .payload
        .messages
        .iter()
        .flat_map(|msg| {
            msg.header
                .topics
                .iter()
                .map(|topic| context_hash(&batch.header.namespace, topic))
        })
        .collect();
    BatchPinEvent {
        namespace: batch.header.namespace.clone(),
        transaction_id: batch.payload.tx.id,
        batch_id: batch.header.id,
        batch_hash: batch.hash,
        batch_payload_ref: Some(payload_ref.to_string()),
        contexts,
        event: LedgerEvent {
            name: "BatchPin".into(),
            blockchain_tx_id: "0x12345".into(),
            protocol_id: protocol_id.into(),
            output: Value::Null,
            info: Value::Null,
        },
    }
}

/// An ethereum-style verifier for the given key.
pub fn verifier(key: &str) -> VerifierRef {
    VerifierRef { verifier_type: VerifierType::EthAddress, value: key.into() }
}
