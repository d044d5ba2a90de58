//! Fault-injecting store decorator
//!
//! Wraps any `Database` and makes named operations fail transiently a
//! scripted number of times before delegating, so tests can prove the
//! retry discipline without a flaky backend.

use async_trait::async_trait;
use pinloom_model::{
    Batch, BlockchainEvent, Data, Database, Message, MessageState, NamespaceRecord, PinRecord,
    StoreError, TransactionRecord, UpsertMode, UserEvent,
};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

pub struct FlakyDb<D> {
    inner: D,
    failures: Mutex<HashMap<&'static str, u32>>,
}

impl<D> FlakyDb<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, failures: Mutex::new(HashMap::new()) }
    }

    /// Make the next `times` calls of `op` fail with a transient error.
    /// `op` is the trait method name, e.g. `"insert_blockchain_event"`.
    pub fn fail(&self, op: &'static str, times: u32) {
        self.failures.lock().unwrap().insert(op, times);
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn trip(&self, op: &'static str) -> Result<(), StoreError> {
        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::Backend(format!("injected failure in {}", op)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<D: Database> Database for FlakyDb<D> {
    async fn begin_group(&self) -> Result<(), StoreError> {
        self.trip("begin_group")?;
        self.inner.begin_group().await
    }

    async fn end_group(&self, commit: bool) -> Result<(), StoreError> {
        self.trip("end_group")?;
        self.inner.end_group(commit).await
    }

    async fn upsert_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        self.trip("upsert_batch")?;
        self.inner.upsert_batch(batch).await
    }

    async fn get_batch(&self, id: &Uuid) -> Result<Option<Batch>, StoreError> {
        self.trip("get_batch")?;
        self.inner.get_batch(id).await
    }

    async fn insert_data_array(&self, data: &[Data]) -> Result<(), StoreError> {
        self.trip("insert_data_array")?;
        self.inner.insert_data_array(data).await
    }

    async fn upsert_data(&self, data: &Data, mode: UpsertMode) -> Result<(), StoreError> {
        self.trip("upsert_data")?;
        self.inner.upsert_data(data, mode).await
    }

    async fn get_data(&self, id: &Uuid) -> Result<Option<Data>, StoreError> {
        self.trip("get_data")?;
        self.inner.get_data(id).await
    }

    async fn insert_messages(&self, messages: &[Message]) -> Result<(), StoreError> {
        self.trip("insert_messages")?;
        self.inner.insert_messages(messages).await
    }

    async fn upsert_message(&self, message: &Message, mode: UpsertMode) -> Result<(), StoreError> {
        self.trip("upsert_message")?;
        self.inner.upsert_message(message, mode).await
    }

    async fn get_message(&self, id: &Uuid) -> Result<Option<Message>, StoreError> {
        self.trip("get_message")?;
        self.inner.get_message(id).await
    }

    async fn set_message_state(&self, id: &Uuid, state: MessageState) -> Result<(), StoreError> {
        self.trip("set_message_state")?;
        self.inner.set_message_state(id, state).await
    }

    async fn insert_pins(&self, pins: &mut [PinRecord]) -> Result<(), StoreError> {
        self.trip("insert_pins")?;
        self.inner.insert_pins(pins).await
    }

    async fn upsert_pin(&self, pin: &PinRecord) -> Result<(), StoreError> {
        self.trip("upsert_pin")?;
        self.inner.upsert_pin(pin).await
    }

    async fn get_pin(&self, batch: &Uuid, index: u32) -> Result<Option<PinRecord>, StoreError> {
        self.trip("get_pin")?;
        self.inner.get_pin(batch, index).await
    }

    async fn list_pins_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<PinRecord>, StoreError> {
        self.trip("list_pins_after")?;
        self.inner.list_pins_after(after, limit).await
    }

    async fn set_pin_dispatched(&self, sequence: u64, rejected: bool) -> Result<(), StoreError> {
        self.trip("set_pin_dispatched")?;
        self.inner.set_pin_dispatched(sequence, rejected).await
    }

    async fn insert_blockchain_event(&self, event: &BlockchainEvent) -> Result<(), StoreError> {
        self.trip("insert_blockchain_event")?;
        self.inner.insert_blockchain_event(event).await
    }

    async fn insert_event(&self, event: &mut UserEvent) -> Result<(), StoreError> {
        self.trip("insert_event")?;
        self.inner.insert_event(event).await
    }

    async fn list_events_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<UserEvent>, StoreError> {
        self.trip("list_events_after")?;
        self.inner.list_events_after(after, limit).await
    }

    async fn upsert_transaction(&self, tx: &TransactionRecord) -> Result<bool, StoreError> {
        self.trip("upsert_transaction")?;
        self.inner.upsert_transaction(tx).await
    }

    async fn get_transaction(&self, id: &Uuid) -> Result<Option<TransactionRecord>, StoreError> {
        self.trip("get_transaction")?;
        self.inner.get_transaction(id).await
    }

    async fn upsert_namespace(&self, ns: &NamespaceRecord) -> Result<(), StoreError> {
        self.trip("upsert_namespace")?;
        self.inner.upsert_namespace(ns).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>, StoreError> {
        self.trip("get_namespace")?;
        self.inner.get_namespace(name).await
    }
}
