//! End-to-end pipeline tests: pin event in, user events out, against the
//! real embedded store and in-memory collaborator fakes.

use pinloom_core::{CoreConfig, Pipeline, RetryConfig};
use pinloom_model::{
    context_hash, Database, Hash, MessageState, MockClock, UserEvent, UserEventType, VerifierRef,
    VerifierType,
};
use pinloom_store::PinStore;
use pinloom_testkit::{
    sample::{pin_for_batch, sample_batch, sample_data, sample_message, verifier},
    FlakyDb, MemIdentityResolver, MemStorage,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const AUTHOR: &str = "org1";
const KEY: &str = "0x12345";

struct Rig {
    pipeline: Pipeline<FlakyDb<PinStore>>,
    db: Arc<FlakyDb<PinStore>>,
    storage: Arc<MemStorage>,
    identity: Arc<MemIdentityResolver>,
    token: CancellationToken,
}

impl Rig {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir").keep();
        let db = Arc::new(FlakyDb::new(
            PinStore::open(dir.join("pinloom.db")).expect("open store"),
        ));
        let storage = Arc::new(MemStorage::new());
        let identity = Arc::new(MemIdentityResolver::new());
        identity.register(KEY, AUTHOR);

        let config = CoreConfig {
            retry: RetryConfig { initial_delay_ms: 1, max_delay_ms: 20 },
            poll_interval_ms: 25,
            topic_stall_timeout_ms: 200,
            ..CoreConfig::default()
        };
        let pipeline = Pipeline::start(
            config,
            db.clone(),
            storage.clone(),
            identity.clone(),
            Arc::new(MockClock::new(1_700_000_000_000)),
        );
        Self { pipeline, db, storage, identity, token: CancellationToken::new() }
    }

    async fn deliver(&self, pin: &pinloom_model::BatchPinEvent, verifier: &VerifierRef) {
        self.pipeline
            .aggregator()
            .batch_pin_complete("listener1", pin, verifier, &self.token)
            .await
            .expect("pin processing");
    }

    async fn publish_batch(&self, batch: &pinloom_model::Batch) -> String {
        use pinloom_model::SharedStorage;
        let bytes = serde_json::to_vec(batch).expect("encode batch");
        self.storage.publish(&bytes).await.expect("publish batch")
    }
}

async fn next_event(rx: &mut broadcast::Receiver<UserEvent>, ms: u64) -> Option<UserEvent> {
    tokio::time::timeout(Duration::from_millis(ms), rx.recv())
        .await
        .ok()
        .and_then(|r| r.ok())
}

/// Collect message-confirmed events until `count` arrive or the window
/// elapses.
async fn collect_confirmed(
    rx: &mut broadcast::Receiver<UserEvent>,
    count: usize,
    ms: u64,
) -> Vec<UserEvent> {
    let mut out = Vec::new();
    while out.len() < count {
        match next_event(rx, ms).await {
            Some(ev) if ev.event_type == UserEventType::MessageConfirmed => out.push(ev),
            Some(_) => {}
            None => break,
        }
    }
    out
}

#[tokio::test]
async fn test_happy_broadcast_delivers_one_event() {
    let rig = Rig::new();
    let mut rx = rig.pipeline.subscribe();

    let data = sample_data(json!("test"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["topic1"], std::slice::from_ref(&data));
    let msg_id = msg.header.id;
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let pin = pin_for_batch(&batch, &payload_ref, "10/20/30");

    rig.deliver(&pin, &verifier(KEY)).await;

    let first = next_event(&mut rx, 2_000).await.expect("blockchain event");
    assert_eq!(first.event_type, UserEventType::BlockchainEventReceived);
    assert_eq!(first.sequence, 1);

    let second = next_event(&mut rx, 2_000).await.expect("confirmed event");
    assert_eq!(second.event_type, UserEventType::MessageConfirmed);
    assert_eq!(second.sequence, 2);
    assert_eq!(second.reference, msg_id);
    assert_eq!(second.topic.as_deref(), Some("topic1"));

    let stored = rig.db.get_batch(&batch.header.id).await.unwrap().expect("batch stored");
    assert!(stored.confirmed.is_some());
    let pin_row = rig.db.get_pin(&batch.header.id, 0).await.unwrap().expect("pin stored");
    assert!(pin_row.dispatched);
    assert!(!pin_row.rejected);
    let stored_msg = rig.db.get_message(&msg_id).await.unwrap().expect("message stored");
    assert_eq!(stored_msg.local_state, MessageState::Confirmed);
}

#[tokio::test]
async fn test_transient_store_failure_retries_to_one_event() {
    let rig = Rig::new();
    let mut rx = rig.pipeline.subscribe();

    let data = sample_data(json!("retry"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["topic1"], std::slice::from_ref(&data));
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let pin = pin_for_batch(&batch, &payload_ref, "10/20/30");

    // First pass fails inside the group; the retry re-runs the whole unit.
    rig.db.fail("insert_blockchain_event", 1);
    rig.deliver(&pin, &verifier(KEY)).await;

    assert!(collect_confirmed(&mut rx, 1, 2_000).await.len() == 1);

    // The rolled-back first attempt left nothing behind.
    let events = rig.db.list_events_after(0, 50).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, UserEventType::BlockchainEventReceived);
    assert_eq!(events[1].event_type, UserEventType::MessageConfirmed);
}

#[tokio::test]
async fn test_transient_storage_failure_retries_retrieval() {
    let rig = Rig::new();
    let mut rx = rig.pipeline.subscribe();

    let data = sample_data(json!("flaky-storage"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["topic1"], std::slice::from_ref(&data));
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let pin = pin_for_batch(&batch, &payload_ref, "10/20/30");

    rig.storage.fail_next(2);
    rig.deliver(&pin, &verifier(KEY)).await;

    assert_eq!(collect_confirmed(&mut rx, 1, 2_000).await.len(), 1);
}

#[tokio::test]
async fn test_bad_batch_hash_writes_no_batch() {
    let rig = Rig::new();

    let data = sample_data(json!("bad-hash"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["topic1"], std::slice::from_ref(&data));
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let mut pin = pin_for_batch(&batch, &payload_ref, "10/20/30");
    pin.batch_hash = Hash::of(b"not the manifest hash");

    rig.deliver(&pin, &verifier(KEY)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(rig.db.get_batch(&batch.header.id).await.unwrap().is_none());
    // The chain event is still faithfully recorded, but no message ever
    // confirms and no pins are written.
    let events = rig.db.list_events_after(0, 50).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, UserEventType::BlockchainEventReceived);
    assert!(rig.db.list_pins_after(0, 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_payload_swallowed_entirely() {
    let rig = Rig::new();

    rig.storage.put("garbage-ref", b"!json".to_vec());
    let data = sample_data(json!("x"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["topic1"], std::slice::from_ref(&data));
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let pin = pin_for_batch(&batch, "garbage-ref", "10/20/30");

    rig.deliver(&pin, &verifier(KEY)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Undecodable shared-storage data records nothing at all.
    assert!(rig.db.list_events_after(0, 50).await.unwrap().is_empty());
    assert!(rig.db.get_transaction(&pin.transaction_id.unwrap()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_namespace_swallowed() {
    let rig = Rig::new();

    let data = sample_data(json!("x"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["topic1"], std::slice::from_ref(&data));
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let mut pin = pin_for_batch(&batch, &payload_ref, "10/20/30");
    pin.namespace = "!Bad Namespace".into();

    rig.deliver(&pin, &verifier(KEY)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.db.list_events_after(0, 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_private_pin_sequences_without_dispatch() {
    let rig = Rig::new();

    let batch_id = Uuid::new_v4();
    let pin = pinloom_model::BatchPinEvent {
        namespace: "ns1".into(),
        transaction_id: Some(Uuid::new_v4()),
        batch_id,
        batch_hash: Hash::of(b"private"),
        batch_payload_ref: None,
        contexts: vec![Hash::of(b"masked-context")],
        event: pinloom_model::LedgerEvent {
            name: "BatchPin".into(),
            blockchain_tx_id: "0x12345".into(),
            protocol_id: "10/20/31".into(),
            output: serde_json::Value::Null,
            info: serde_json::Value::Null,
        },
    };

    rig.deliver(&pin, &verifier(KEY)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let pin_row = rig.db.get_pin(&batch_id, 0).await.unwrap().expect("pin stored");
    assert!(pin_row.masked);
    assert!(!pin_row.dispatched);
    assert_eq!(pin_row.sequence, 1);

    // Only the chain event surfaced; the batch must arrive over the
    // private channel before anything can confirm.
    let events = rig.db.list_events_after(0, 50).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, UserEventType::BlockchainEventReceived);
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let rig = Rig::new();
    let mut rx = rig.pipeline.subscribe();

    let data = sample_data(json!("replayed"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["topic1"], std::slice::from_ref(&data));
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let pin = pin_for_batch(&batch, &payload_ref, "10/20/30");

    rig.deliver(&pin, &verifier(KEY)).await;
    assert_eq!(collect_confirmed(&mut rx, 1, 2_000).await.len(), 1);
    let first = rig.db.get_pin(&batch.header.id, 0).await.unwrap().expect("pin stored");

    // Identical delivery: same protocol id, same listener.
    rig.deliver(&pin, &verifier(KEY)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let replayed = rig.db.get_pin(&batch.header.id, 0).await.unwrap().expect("pin stored");
    assert_eq!(replayed.sequence, first.sequence);

    let events = rig.db.list_events_after(0, 50).await.unwrap();
    let confirmed: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == UserEventType::MessageConfirmed)
        .collect();
    let received: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == UserEventType::BlockchainEventReceived)
        .collect();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(received.len(), 1);
}

#[tokio::test]
async fn test_message_with_wrong_key_rejected_others_proceed() {
    let rig = Rig::new();
    let mut rx = rig.pipeline.subscribe();
    rig.identity.register("0x9999999", "org2");

    let good_data = sample_data(json!("good"));
    let bad_data = sample_data(json!("bad"));
    let good = sample_message("ns1", AUTHOR, KEY, &["topic1"], std::slice::from_ref(&good_data));
    let bad =
        sample_message("ns1", AUTHOR, "0x9999999", &["topic2"], std::slice::from_ref(&bad_data));
    let good_id = good.header.id;
    let bad_id = bad.header.id;
    let batch =
        sample_batch("ns1", AUTHOR, KEY, vec![good, bad], vec![good_data, bad_data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let pin = pin_for_batch(&batch, &payload_ref, "10/20/30");

    rig.deliver(&pin, &verifier(KEY)).await;

    let confirmed = collect_confirmed(&mut rx, 2, 1_000).await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].reference, good_id);

    // The offending message's pin advanced as a rejection, with no event.
    let bad_pin = rig.db.get_pin(&batch.header.id, 1).await.unwrap().expect("pin stored");
    assert!(bad_pin.dispatched);
    assert!(bad_pin.rejected);
    let stored_bad = rig.db.get_message(&bad_id).await.unwrap().expect("message stored");
    assert_eq!(stored_bad.local_state, MessageState::Rejected);
}

#[tokio::test]
async fn test_topic_order_follows_pin_sequence() {
    let rig = Rig::new();
    let mut rx = rig.pipeline.subscribe();

    let mut expected = Vec::new();
    for i in 0..3 {
        let data = sample_data(json!({ "n": i }));
        let msg = sample_message("ns1", AUTHOR, KEY, &["ordered"], std::slice::from_ref(&data));
        expected.push(msg.header.id);
        let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
        let payload_ref = rig.publish_batch(&batch).await;
        let pin = pin_for_batch(&batch, &payload_ref, &format!("10/20/{}", 40 + i));
        rig.deliver(&pin, &verifier(KEY)).await;
    }

    let confirmed = collect_confirmed(&mut rx, 3, 2_000).await;
    assert_eq!(confirmed.len(), 3);
    let references: Vec<_> = confirmed.iter().map(|e| e.reference).collect();
    assert_eq!(references, expected);
    // Event sequences strictly ascend along the topic.
    assert!(confirmed.windows(2).all(|w| w[0].sequence < w[1].sequence));
}

#[tokio::test]
async fn test_stalled_topic_blocks_later_pins() {
    let rig = Rig::new();
    let mut rx = rig.pipeline.subscribe();

    // A masked pin parks at the head of the topic lane: its batch will
    // only ever arrive over the private channel.
    let masked_pin = pinloom_model::BatchPinEvent {
        namespace: "ns1".into(),
        transaction_id: Some(Uuid::new_v4()),
        batch_id: Uuid::new_v4(),
        batch_hash: Hash::of(b"private"),
        batch_payload_ref: None,
        contexts: vec![context_hash("ns1", "shared-topic")],
        event: pinloom_model::LedgerEvent {
            name: "BatchPin".into(),
            blockchain_tx_id: "0xaaa".into(),
            protocol_id: "10/20/50".into(),
            output: serde_json::Value::Null,
            info: serde_json::Value::Null,
        },
    };
    rig.deliver(&masked_pin, &verifier(KEY)).await;

    let data = sample_data(json!("blocked"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["shared-topic"], std::slice::from_ref(&data));
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let pin = pin_for_batch(&batch, &payload_ref, "10/20/51");
    rig.deliver(&pin, &verifier(KEY)).await;

    // The broadcast message is fully persisted and ready, but the topic
    // head cannot advance, so nothing may be delivered behind it.
    assert!(collect_confirmed(&mut rx, 1, 600).await.is_empty());
    let pin_row = rig.db.get_pin(&batch.header.id, 0).await.unwrap().expect("pin stored");
    assert!(!pin_row.dispatched);
}

#[tokio::test]
async fn test_multi_topic_message_confirms_once() {
    let rig = Rig::new();
    let mut rx = rig.pipeline.subscribe();

    let data = sample_data(json!("multi"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["t-a", "t-b"], std::slice::from_ref(&data));
    let msg_id = msg.header.id;
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let pin = pin_for_batch(&batch, &payload_ref, "10/20/30");
    assert_eq!(pin.contexts.len(), 2);

    rig.deliver(&pin, &verifier(KEY)).await;

    let confirmed = collect_confirmed(&mut rx, 2, 1_000).await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].reference, msg_id);

    for index in 0..2 {
        let row = rig.db.get_pin(&batch.header.id, index).await.unwrap().expect("pin stored");
        assert!(row.dispatched);
        assert!(!row.rejected);
    }
}

#[tokio::test]
async fn test_unknown_verifier_swallowed() {
    let rig = Rig::new();

    let data = sample_data(json!("x"));
    let msg = sample_message("ns1", AUTHOR, KEY, &["topic1"], std::slice::from_ref(&data));
    let batch = sample_batch("ns1", AUTHOR, KEY, vec![msg], vec![data]);
    let payload_ref = rig.publish_batch(&batch).await;
    let pin = pin_for_batch(&batch, &payload_ref, "10/20/30");

    let unknown = VerifierRef { verifier_type: VerifierType::EthAddress, value: "0xdead".into() };
    rig.deliver(&pin, &unknown).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rig.db.list_events_after(0, 50).await.unwrap().is_empty());
}
