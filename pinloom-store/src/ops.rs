//! Database contract implementation for PinStore

use crate::store::{
    backend, decode_row, encode_row, event_index_key, get_json_row, pin_index_key, PinStore,
    BATCHES, BLOCKCHAIN_EVENTS, DATA, EVENTS, EVENT_INDEX, MESSAGES, NAMESPACES, PINS, PIN_INDEX,
    SEQ_EVENTS, SEQ_NAMESPACES, SEQ_PINS, TRANSACTIONS,
};
use async_trait::async_trait;
use redb::ReadableTable;
use pinloom_model::{
    Batch, BlockchainEvent, Data, Database, Message, MessageState, NamespaceRecord, PinRecord,
    StoreError, TransactionRecord, UpsertMode, UserEvent,
};
use uuid::Uuid;

#[async_trait]
impl Database for PinStore {
    async fn begin_group(&self) -> Result<(), StoreError> {
        self.begin_group_inner().await
    }

    async fn end_group(&self, commit: bool) -> Result<(), StoreError> {
        self.end_group_inner(commit)
    }

    async fn upsert_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        self.write_op(|txn| {
            let mut table = txn.open_table(BATCHES).map_err(backend)?;
            let key = batch.header.id.into_bytes();
            if let Some(existing) = get_json_row::<Batch>(&table, &key)? {
                if existing.hash != batch.hash {
                    return Err(StoreError::HashMismatch);
                }
                // Keep the earliest confirmation timestamp.
                if existing.confirmed.is_some() {
                    return Ok(());
                }
            }
            table.insert(key.as_slice(), encode_row(batch)?.as_slice()).map_err(backend)?;
            Ok(())
        })
    }

    async fn get_batch(&self, id: &Uuid) -> Result<Option<Batch>, StoreError> {
        self.read_op(|txn| {
            let table = txn.open_table(BATCHES).map_err(backend)?;
            get_json_row(&table, id.as_bytes())
        })
    }

    async fn insert_data_array(&self, data: &[Data]) -> Result<(), StoreError> {
        self.write_op(|txn| {
            let mut table = txn.open_table(DATA).map_err(backend)?;
            for item in data {
                if table.get(item.id.as_bytes().as_slice()).map_err(backend)?.is_some() {
                    return Err(StoreError::Duplicate);
                }
            }
            for item in data {
                table
                    .insert(item.id.as_bytes().as_slice(), encode_row(item)?.as_slice())
                    .map_err(backend)?;
            }
            Ok(())
        })
    }

    async fn upsert_data(&self, data: &Data, mode: UpsertMode) -> Result<(), StoreError> {
        self.write_op(|txn| {
            let mut table = txn.open_table(DATA).map_err(backend)?;
            let exists = table.get(data.id.as_bytes().as_slice()).map_err(backend)?.is_some();
            if exists && mode == UpsertMode::Existing {
                return Ok(());
            }
            table
                .insert(data.id.as_bytes().as_slice(), encode_row(data)?.as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    async fn get_data(&self, id: &Uuid) -> Result<Option<Data>, StoreError> {
        self.read_op(|txn| {
            let table = txn.open_table(DATA).map_err(backend)?;
            get_json_row(&table, id.as_bytes())
        })
    }

    async fn insert_messages(&self, messages: &[Message]) -> Result<(), StoreError> {
        self.write_op(|txn| {
            let mut table = txn.open_table(MESSAGES).map_err(backend)?;
            for msg in messages {
                if table.get(msg.header.id.as_bytes().as_slice()).map_err(backend)?.is_some() {
                    return Err(StoreError::Duplicate);
                }
            }
            for msg in messages {
                table
                    .insert(msg.header.id.as_bytes().as_slice(), encode_row(msg)?.as_slice())
                    .map_err(backend)?;
            }
            Ok(())
        })
    }

    async fn upsert_message(&self, message: &Message, mode: UpsertMode) -> Result<(), StoreError> {
        self.write_op(|txn| {
            let mut table = txn.open_table(MESSAGES).map_err(backend)?;
            let key = message.header.id.into_bytes();
            let existing = get_json_row::<Message>(&table, &key)?;
            if let Some(existing) = existing {
                if mode == UpsertMode::Existing {
                    return Ok(());
                }
                // Rewriting a message never regresses its delivery state.
                if !existing.local_state.can_transition(message.local_state) {
                    let mut kept = message.clone();
                    kept.local_state = existing.local_state;
                    table.insert(key.as_slice(), encode_row(&kept)?.as_slice()).map_err(backend)?;
                    return Ok(());
                }
            }
            table.insert(key.as_slice(), encode_row(message)?.as_slice()).map_err(backend)?;
            Ok(())
        })
    }

    async fn get_message(&self, id: &Uuid) -> Result<Option<Message>, StoreError> {
        self.read_op(|txn| {
            let table = txn.open_table(MESSAGES).map_err(backend)?;
            get_json_row(&table, id.as_bytes())
        })
    }

    async fn set_message_state(&self, id: &Uuid, state: MessageState) -> Result<(), StoreError> {
        self.write_op(|txn| {
            let mut table = txn.open_table(MESSAGES).map_err(backend)?;
            let key = id.into_bytes();
            let mut msg: Message =
                get_json_row(&table, &key)?.ok_or(StoreError::NotFound)?;
            if msg.local_state == state {
                return Ok(());
            }
            if !msg.local_state.can_transition(state) {
                return Err(StoreError::InvalidTransition { from: msg.local_state, to: state });
            }
            msg.local_state = state;
            table.insert(key.as_slice(), encode_row(&msg)?.as_slice()).map_err(backend)?;
            Ok(())
        })
    }

    async fn insert_pins(&self, pins: &mut [PinRecord]) -> Result<(), StoreError> {
        self.write_op(|txn| {
            {
                let index = txn.open_table(PIN_INDEX).map_err(backend)?;
                for pin in pins.iter() {
                    let key = pin_index_key(&pin.batch, pin.index);
                    if index.get(key.as_slice()).map_err(backend)?.is_some() {
                        return Err(StoreError::Duplicate);
                    }
                }
            }
            let mut table = txn.open_table(PINS).map_err(backend)?;
            let mut index = txn.open_table(PIN_INDEX).map_err(backend)?;
            for pin in pins.iter_mut() {
                pin.sequence = PinStore::next_seq(txn, SEQ_PINS)?;
                table
                    .insert(pin.sequence, encode_row(&*pin)?.as_slice())
                    .map_err(backend)?;
                index
                    .insert(pin_index_key(&pin.batch, pin.index).as_slice(), pin.sequence)
                    .map_err(backend)?;
            }
            Ok(())
        })
    }

    async fn upsert_pin(&self, pin: &PinRecord) -> Result<(), StoreError> {
        self.write_op(|txn| {
            let key = pin_index_key(&pin.batch, pin.index);
            {
                let index = txn.open_table(PIN_INDEX).map_err(backend)?;
                if index.get(key.as_slice()).map_err(backend)?.is_some() {
                    // Replay: the stored pin keeps its sequence and flags.
                    return Ok(());
                }
            }
            let sequence = PinStore::next_seq(txn, SEQ_PINS)?;
            let mut row = pin.clone();
            row.sequence = sequence;
            let mut table = txn.open_table(PINS).map_err(backend)?;
            table.insert(sequence, encode_row(&row)?.as_slice()).map_err(backend)?;
            let mut index = txn.open_table(PIN_INDEX).map_err(backend)?;
            index.insert(key.as_slice(), sequence).map_err(backend)?;
            Ok(())
        })
    }

    async fn get_pin(&self, batch: &Uuid, index: u32) -> Result<Option<PinRecord>, StoreError> {
        self.read_op(|txn| {
            let pin_index = txn.open_table(PIN_INDEX).map_err(backend)?;
            let sequence = match pin_index.get(pin_index_key(batch, index).as_slice()).map_err(backend)? {
                Some(guard) => guard.value(),
                None => return Ok(None),
            };
            let pins = txn.open_table(PINS).map_err(backend)?;
            match pins.get(sequence).map_err(backend)? {
                Some(guard) => Ok(Some(decode_row(guard.value())?)),
                None => Ok(None),
            }
        })
    }

    async fn list_pins_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<PinRecord>, StoreError> {
        self.read_op(|txn| {
            let table = txn.open_table(PINS).map_err(backend)?;
            let mut out = Vec::new();
            for entry in table.range(after + 1..).map_err(backend)? {
                if out.len() >= limit {
                    break;
                }
                let (_, value) = entry.map_err(backend)?;
                out.push(decode_row(value.value())?);
            }
            Ok(out)
        })
    }

    async fn set_pin_dispatched(&self, sequence: u64, rejected: bool) -> Result<(), StoreError> {
        self.write_op(|txn| {
            let mut table = txn.open_table(PINS).map_err(backend)?;
            let mut pin: PinRecord = match table.get(sequence).map_err(backend)? {
                Some(guard) => decode_row(guard.value())?,
                None => return Err(StoreError::NotFound),
            };
            if pin.dispatched {
                return Ok(());
            }
            pin.dispatched = true;
            pin.rejected = rejected;
            table.insert(sequence, encode_row(&pin)?.as_slice()).map_err(backend)?;
            Ok(())
        })
    }

    async fn insert_blockchain_event(&self, event: &BlockchainEvent) -> Result<(), StoreError> {
        self.write_op(|txn| {
            let key = event_index_key(&event.listener, &event.protocol_id);
            {
                let index = txn.open_table(EVENT_INDEX).map_err(backend)?;
                if index.get(key.as_slice()).map_err(backend)?.is_some() {
                    return Err(StoreError::Duplicate);
                }
            }
            let mut table = txn.open_table(BLOCKCHAIN_EVENTS).map_err(backend)?;
            table
                .insert(event.id.as_bytes().as_slice(), encode_row(event)?.as_slice())
                .map_err(backend)?;
            let mut index = txn.open_table(EVENT_INDEX).map_err(backend)?;
            index
                .insert(key.as_slice(), event.id.as_bytes().as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    async fn insert_event(&self, event: &mut UserEvent) -> Result<(), StoreError> {
        self.write_op(|txn| {
            event.sequence = PinStore::next_seq(txn, SEQ_EVENTS)?;
            let mut table = txn.open_table(EVENTS).map_err(backend)?;
            table
                .insert(event.sequence, encode_row(&*event)?.as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    async fn list_events_after(
        &self,
        after: u64,
        limit: usize,
    ) -> Result<Vec<UserEvent>, StoreError> {
        self.read_op(|txn| {
            let table = txn.open_table(EVENTS).map_err(backend)?;
            let mut out = Vec::new();
            for entry in table.range(after + 1..).map_err(backend)? {
                if out.len() >= limit {
                    break;
                }
                let (_, value) = entry.map_err(backend)?;
                out.push(decode_row(value.value())?);
            }
            Ok(out)
        })
    }

    async fn upsert_transaction(&self, tx: &TransactionRecord) -> Result<bool, StoreError> {
        self.write_op(|txn| {
            let mut table = txn.open_table(TRANSACTIONS).map_err(backend)?;
            let key = tx.id.into_bytes();
            if let Some(existing) = get_json_row::<TransactionRecord>(&table, &key)? {
                let matches = existing.tx_type == tx.tx_type
                    && existing.namespace == tx.namespace
                    && existing.blockchain_tx_id == tx.blockchain_tx_id;
                return Ok(matches);
            }
            table.insert(key.as_slice(), encode_row(tx)?.as_slice()).map_err(backend)?;
            Ok(true)
        })
    }

    async fn get_transaction(&self, id: &Uuid) -> Result<Option<TransactionRecord>, StoreError> {
        self.read_op(|txn| {
            let table = txn.open_table(TRANSACTIONS).map_err(backend)?;
            get_json_row(&table, id.as_bytes())
        })
    }

    async fn upsert_namespace(&self, ns: &NamespaceRecord) -> Result<(), StoreError> {
        if ns.description.len() > pinloom_model::records::NAMESPACE_DESCRIPTION_MAX_LEN {
            return Err(StoreError::Constraint(format!(
                "namespace description exceeds {} bytes",
                pinloom_model::records::NAMESPACE_DESCRIPTION_MAX_LEN
            )));
        }
        self.write_op(|txn| {
            let mut table = txn.open_table(NAMESPACES).map_err(backend)?;
            if table.get(ns.name.as_bytes()).map_err(backend)?.is_some() {
                return Ok(());
            }
            let mut row = ns.clone();
            row.seq = PinStore::next_seq(txn, SEQ_NAMESPACES)?;
            table
                .insert(ns.name.as_bytes(), encode_row(&row)?.as_slice())
                .map_err(backend)?;
            Ok(())
        })
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>, StoreError> {
        self.read_op(|txn| {
            let table = txn.open_table(NAMESPACES).map_err(backend)?;
            get_json_row(&table, name.as_bytes())
        })
    }
}
