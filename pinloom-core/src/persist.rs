//! Batch persistence and context pinning
//!
//! Everything here runs inside the caller's transactional group. A batch
//! is checked link by link down its hash chain: pin hash against batch
//! hash, batch hash against the recomputed manifest, each data item
//! against its content, each message against its header and data
//! references. The receiver records everything it can verify and skips
//! what it cannot: once an event is on the ledger it cannot be retracted,
//! so a malicious or buggy sender must not be able to wedge its peers.

use crate::aggregator::Aggregator;
use crate::error::PipelineError;
use pinloom_model::{
    Batch, BatchPinEvent, Database, Hash, Message, MessageState, PinRecord, StoreError,
    UpsertMode, VerifierRef,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};
use uuid::Uuid;

impl<D: Database> Aggregator<D> {
    /// Persist a retrieved batch. Returns whether at least one well-formed
    /// message was persisted; terminal problems log and return `false`,
    /// transient ones abort the group for retry.
    pub(crate) async fn persist_batch(
        &self,
        batch: &Batch,
        expected_hash: Option<&Hash>,
    ) -> Result<bool, PipelineError> {
        let batch_id = batch.header.id;

        if batch.payload.messages.is_empty() {
            warn!(%batch_id, "batch has no messages, nothing to persist");
            return Ok(false);
        }

        // The pin committed on chain, the hash the sender claims, and the
        // recomputed manifest must all agree.
        if let Some(expected) = expected_hash {
            if *expected != batch.hash {
                warn!(%batch_id, expected = %expected, got = %batch.hash, "batch hash does not match pinned hash");
                return Ok(false);
            }
        }
        match batch.manifest_hash() {
            Ok(recomputed) if recomputed == batch.hash => {}
            Ok(recomputed) => {
                warn!(%batch_id, stated = %batch.hash, %recomputed, "batch hash does not match manifest");
                return Ok(false);
            }
            Err(err) => {
                warn!(%batch_id, %err, "batch manifest cannot be encoded");
                return Ok(false);
            }
        }

        match self
            .resolve_key(&batch.header.namespace, &batch.header.signer.key)
            .await?
        {
            Some(author) if author == batch.header.signer.author => {}
            Some(author) => {
                warn!(%batch_id, claimed = %batch.header.signer.author, resolved = %author, "batch author does not match signing key");
                return Ok(false);
            }
            None => {
                warn!(%batch_id, key = %batch.header.signer.key, "batch signing key resolves to no identity");
                return Ok(false);
            }
        }

        let mut stored = batch.clone();
        stored.confirmed = Some(self.clock.now_ms());
        match self.db.upsert_batch(&stored).await {
            Ok(()) => {}
            Err(StoreError::HashMismatch) => {
                warn!(%batch_id, "batch id already stored under a different hash");
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        // Optimistic bulk insert; replays fall back to per-row upserts
        // that leave existing rows untouched.
        if !batch.payload.data.is_empty() {
            if let Err(err) = self.db.insert_data_array(&batch.payload.data).await {
                debug!(%batch_id, %err, "bulk data insert missed, falling back to upserts");
                for item in &batch.payload.data {
                    self.db.upsert_data(item, UpsertMode::Existing).await?;
                }
            }
        }

        let mut payload_hashes: HashMap<Uuid, Hash> = HashMap::new();
        let mut bad_data: HashSet<Uuid> = HashSet::new();
        for (i, item) in batch.payload.data.iter().enumerate() {
            payload_hashes.insert(item.id, item.hash);
            if !item.verify_hash() {
                warn!(%batch_id, index = i, data_id = %item.id, "data item hash does not verify");
                bad_data.insert(item.id);
            }
        }

        let mut rows: Vec<Message> = Vec::with_capacity(batch.payload.messages.len());
        let mut valid: Vec<Message> = Vec::new();
        for (i, msg) in batch.payload.messages.iter().enumerate() {
            let ok = self
                .validate_batch_message(batch, i, msg, &payload_hashes, &bad_data)
                .await?;
            let mut row = msg.clone();
            row.local_state = if ok { MessageState::Pending } else { MessageState::Rejected };
            if ok {
                valid.push(row.clone());
            }
            rows.push(row);
        }

        if let Err(err) = self.db.insert_messages(&rows).await {
            debug!(%batch_id, %err, "bulk message insert missed, falling back to upserts");
            for row in &rows {
                self.db.upsert_message(row, UpsertMode::Existing).await?;
            }
        }

        // Write-through so dispatch readiness rarely re-reads the store.
        for msg in valid.iter() {
            let data: Vec<_> = msg
                .header
                .data_refs
                .iter()
                .filter_map(|r| batch.payload.data.iter().find(|d| d.id == r.id).cloned())
                .collect();
            self.data_cache.insert(msg.clone(), data);
        }

        Ok(!valid.is_empty())
    }

    /// A message is well formed when its hashes verify, every data
    /// reference is satisfied by the payload, and its signing key
    /// normalizes to the batch author. A failing message never fails the
    /// batch; it just never dispatches.
    async fn validate_batch_message(
        &self,
        batch: &Batch,
        index: usize,
        msg: &Message,
        payload_hashes: &HashMap<Uuid, Hash>,
        bad_data: &HashSet<Uuid>,
    ) -> Result<bool, PipelineError> {
        let msg_id = msg.header.id;
        if msg.header.namespace != batch.header.namespace {
            warn!(%msg_id, index, "message namespace differs from batch");
            return Ok(false);
        }
        if !msg.verify_hash() {
            warn!(%msg_id, index, "message hashes do not verify");
            return Ok(false);
        }
        for data_ref in &msg.header.data_refs {
            match payload_hashes.get(&data_ref.id) {
                Some(hash) if *hash == data_ref.hash && !bad_data.contains(&data_ref.id) => {}
                Some(_) => {
                    warn!(%msg_id, data_id = %data_ref.id, "message references data with a mismatched hash");
                    return Ok(false);
                }
                None => {
                    warn!(%msg_id, data_id = %data_ref.id, "message references data missing from the payload");
                    return Ok(false);
                }
            }
        }
        match self
            .resolve_key(&msg.header.namespace, &msg.header.signer.key)
            .await?
        {
            Some(author) if author == batch.header.signer.author => Ok(true),
            Some(author) => {
                warn!(%msg_id, resolved = %author, batch_author = %batch.header.signer.author, "message signing key does not belong to the batch author");
                Ok(false)
            }
            None => {
                warn!(%msg_id, key = %msg.header.signer.key, "message signing key resolves to no identity");
                Ok(false)
            }
        }
    }

    /// Persist the per-topic context pins for a pin event. Duplicate bulk
    /// inserts (a replay) fall back to per-row upserts that preserve the
    /// stored sequence and dispatch flags.
    pub(crate) async fn persist_contexts(
        &self,
        pin: &BatchPinEvent,
        verifier: &VerifierRef,
        masked: bool,
    ) -> Result<(), PipelineError> {
        if pin.contexts.is_empty() {
            return Ok(());
        }
        let now = self.clock.now_ms();
        let mut rows: Vec<PinRecord> = pin
            .contexts
            .iter()
            .enumerate()
            .map(|(i, context)| PinRecord {
                sequence: 0,
                hash: *context,
                batch: pin.batch_id,
                index: i as u32,
                signer: verifier.value.clone(),
                masked,
                dispatched: false,
                rejected: false,
                created: now,
            })
            .collect();

        match self.db.insert_pins(&mut rows).await {
            Ok(()) => Ok(()),
            Err(StoreError::Duplicate) => {
                debug!(batch_id = %pin.batch_id, "pins already recorded, upserting individually");
                for row in &rows {
                    self.db.upsert_pin(row).await?;
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}
