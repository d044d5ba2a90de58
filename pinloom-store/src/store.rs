//! PinStore - embedded redb database behind the pipeline's store contract
//!
//! Tables:
//! - batches/messages/data/blockchain_events/transactions: UUID → JSON row
//! - pins, events: sequence (u64) → JSON row, scanned in order
//! - pin_index: (batch UUID, index) → sequence, for replay detection
//! - event_index: (listener, protocol_id) → event UUID, for exactly-once
//! - namespaces: name → JSON row
//! - sequences: name → last allocated value

use pinloom_model::StoreError;
use redb::{Database as RedbDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Display;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

pub(crate) const BATCHES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("batches");
pub(crate) const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");
pub(crate) const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");
pub(crate) const PINS: TableDefinition<u64, &[u8]> = TableDefinition::new("pins");
pub(crate) const PIN_INDEX: TableDefinition<&[u8], u64> = TableDefinition::new("pin_index");
pub(crate) const BLOCKCHAIN_EVENTS: TableDefinition<&[u8], &[u8]> =
    TableDefinition::new("blockchain_events");
pub(crate) const EVENT_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("event_index");
pub(crate) const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
pub(crate) const TRANSACTIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("transactions");
pub(crate) const NAMESPACES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("namespaces");
pub(crate) const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub(crate) const SEQ_PINS: &str = "pins";
pub(crate) const SEQ_EVENTS: &str = "events";
pub(crate) const SEQ_NAMESPACES: &str = "namespaces";

/// Embedded store. Mutations issued while a group is open land in the
/// group's transaction and commit together; otherwise each mutation is
/// its own transaction. Concurrent groups queue on an async gate, so a
/// waiting group never blocks the executor. While a group is open, its
/// owner is expected to be the only task issuing mutations.
pub struct PinStore {
    db: RedbDatabase,
    gate: Arc<tokio::sync::Mutex<()>>,
    group: Mutex<GroupSlot>,
}

#[derive(Default)]
struct GroupSlot {
    txn: Option<WriteTransaction>,
    guard: Option<OwnedMutexGuard<()>>,
}

pub(crate) fn backend(err: impl Display) -> StoreError {
    StoreError::Backend(err.to_string())
}

impl PinStore {
    /// Open or create the store at the given path, ensuring all tables
    /// exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = RedbDatabase::create(path).map_err(backend)?;

        let txn = db.begin_write().map_err(backend)?;
        {
            txn.open_table(BATCHES).map_err(backend)?;
            txn.open_table(MESSAGES).map_err(backend)?;
            txn.open_table(DATA).map_err(backend)?;
            txn.open_table(PINS).map_err(backend)?;
            txn.open_table(PIN_INDEX).map_err(backend)?;
            txn.open_table(BLOCKCHAIN_EVENTS).map_err(backend)?;
            txn.open_table(EVENT_INDEX).map_err(backend)?;
            txn.open_table(EVENTS).map_err(backend)?;
            txn.open_table(TRANSACTIONS).map_err(backend)?;
            txn.open_table(NAMESPACES).map_err(backend)?;
            txn.open_table(SEQUENCES).map_err(backend)?;
        }
        txn.commit().map_err(backend)?;

        Ok(Self {
            db,
            gate: Arc::new(tokio::sync::Mutex::new(())),
            group: Mutex::new(GroupSlot::default()),
        })
    }

    /// Open a transaction group, queueing behind any group already open.
    pub(crate) async fn begin_group_inner(&self) -> Result<(), StoreError> {
        let guard = self.gate.clone().lock_owned().await;
        let txn = self.db.begin_write().map_err(backend)?;
        let mut slot = self.group.lock().map_err(backend)?;
        slot.txn = Some(txn);
        slot.guard = Some(guard);
        Ok(())
    }

    pub(crate) fn end_group_inner(&self, commit: bool) -> Result<(), StoreError> {
        let (txn, guard) = {
            let mut slot = self.group.lock().map_err(backend)?;
            (slot.txn.take(), slot.guard.take())
        };
        let result = match txn {
            Some(txn) if commit => txn.commit().map_err(backend),
            Some(txn) => {
                tracing::debug!("rolling back transaction group");
                txn.abort().map_err(backend)
            }
            None => Err(StoreError::Backend("no transaction group open".into())),
        };
        drop(guard);
        result
    }

    /// Run a mutation in the open group's transaction, or in a one-shot
    /// transaction committed on success.
    pub(crate) fn write_op<R>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let slot = self.group.lock().map_err(backend)?;
        if let Some(txn) = slot.txn.as_ref() {
            return f(txn);
        }
        drop(slot);

        let txn = self.db.begin_write().map_err(backend)?;
        match f(&txn) {
            Ok(value) => {
                txn.commit().map_err(backend)?;
                Ok(value)
            }
            Err(err) => {
                let _ = txn.abort();
                Err(err)
            }
        }
    }

    /// Run a read against the last committed snapshot. Reads never look
    /// inside an open group, so uncommitted rows stay invisible to the
    /// rest of the pipeline until the group commits.
    pub(crate) fn read_op<R>(
        &self,
        f: impl FnOnce(&redb::ReadTransaction) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let txn = self.db.begin_read().map_err(backend)?;
        f(&txn)
    }

    /// Allocate the next value of a named monotonic sequence within `txn`.
    pub(crate) fn next_seq(txn: &WriteTransaction, name: &str) -> Result<u64, StoreError> {
        let mut table = txn.open_table(SEQUENCES).map_err(backend)?;
        let next = table
            .get(name)
            .map_err(backend)?
            .map(|v| v.value())
            .unwrap_or(0)
            + 1;
        table.insert(name, next).map_err(backend)?;
        Ok(next)
    }
}

pub(crate) fn encode_row<T: Serialize>(row: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(row).map_err(backend)
}

pub(crate) fn decode_row<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(backend)
}

/// Composite key for the pin replay index.
pub(crate) fn pin_index_key(batch: &Uuid, index: u32) -> [u8; 20] {
    let mut key = [0u8; 20];
    key[..16].copy_from_slice(batch.as_bytes());
    key[16..].copy_from_slice(&index.to_be_bytes());
    key
}

/// Composite key for the blockchain-event exactly-once index.
pub(crate) fn event_index_key(listener: &str, protocol_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(listener.len() + protocol_id.len() + 1);
    key.extend_from_slice(listener.as_bytes());
    key.push(0);
    key.extend_from_slice(protocol_id.as_bytes());
    key
}

/// Look up a JSON row by key in a table of the given definition.
pub(crate) fn get_json_row<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static [u8], &'static [u8]>,
    key: &[u8],
) -> Result<Option<T>, StoreError> {
    match table.get(key).map_err(backend)? {
        Some(guard) => Ok(Some(decode_row(guard.value())?)),
        None => Ok(None),
    }
}
