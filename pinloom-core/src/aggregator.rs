//! Pin intake and batch retrieval
//!
//! `batch_pin_complete` is the single entry point for inbound ledger pin
//! events. A pin runs through namespace validation, verifier resolution,
//! payload retrieval (broadcast only) and then one transactional group
//! covering the transaction row, the blockchain event, batch persistence
//! and the context pins. Transient failures re-run the whole unit; bad
//! input is logged and swallowed because the ledger cannot un-emit an
//! event.

use crate::bus::EventBus;
use crate::cache::{KeyResolver, MessageDataCache};
use crate::config::CoreConfig;
use crate::dispatch::DispatcherHandle;
use crate::error::PipelineError;
use crate::retry::Retrier;
use pinloom_model::{
    run_as_group, validate_name, Batch, BatchPinEvent, BlockchainEvent, Clock, Database,
    NamespaceRecord, SharedStorage, TransactionRecord, TransactionType, UserEvent, UserEventType,
    VerifierRef,
};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Namespace type recorded for namespaces first seen via the ledger.
const NS_TYPE_PINNED: &str = "pinned";

pub struct Aggregator<D> {
    pub(crate) db: Arc<D>,
    pub(crate) storage: Arc<dyn SharedStorage>,
    pub(crate) resolver: KeyResolver,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) bus: EventBus,
    pub(crate) dispatcher: DispatcherHandle,
    pub(crate) data_cache: Arc<MessageDataCache>,
    pub(crate) retry: Retrier,
    pub(crate) config: CoreConfig,
}

impl<D: Database> Aggregator<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        db: Arc<D>,
        storage: Arc<dyn SharedStorage>,
        resolver: KeyResolver,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        dispatcher: DispatcherHandle,
        data_cache: Arc<MessageDataCache>,
    ) -> Self {
        let retry = Retrier::new(config.retry.clone());
        Self {
            db,
            storage,
            resolver,
            clock,
            bus,
            dispatcher,
            data_cache,
            retry,
            config,
        }
    }

    /// Handle one inbound batch-pin event from a ledger listener.
    ///
    /// Returns `Ok` for everything except cancellation: transient errors
    /// are retried here until they stop being transient, and bad input is
    /// swallowed after logging.
    pub async fn batch_pin_complete(
        &self,
        listener: &str,
        pin: &BatchPinEvent,
        verifier: &VerifierRef,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if let Err(err) = validate_name(&pin.namespace) {
            warn!(namespace = %pin.namespace, %err, "ignoring pin with invalid namespace");
            return Ok(());
        }
        if pin.transaction_id.is_none() {
            debug!(batch_id = %pin.batch_id, "pin carries no transaction id, nothing to record");
            return Ok(());
        }
        self.retry
            .run(token, "batch-pin", || self.process_pin(listener, pin, verifier))
            .await
    }

    /// One attempt at processing a pin end to end.
    async fn process_pin(
        &self,
        listener: &str,
        pin: &BatchPinEvent,
        verifier: &VerifierRef,
    ) -> Result<(), PipelineError> {
        match self.resolve_key(&pin.namespace, &verifier.value).await? {
            Some(author) => {
                debug!(batch_id = %pin.batch_id, %author, "resolved pin verifier");
            }
            None => {
                warn!(batch_id = %pin.batch_id, key = %verifier.value, "pin verifier resolves to no identity");
                return Ok(());
            }
        }

        let batch = if pin.is_broadcast() {
            let payload_ref = pin.batch_payload_ref.as_deref().unwrap_or_default();
            match self.retrieve_batch(payload_ref).await? {
                Some(batch) => Some(batch),
                // Garbage in shared storage can never become valid; the
                // pin is dropped without recording anything.
                None => return Ok(()),
            }
        } else {
            None
        };

        let events = run_as_group(
            self.db.as_ref(),
            self.persist_pin_group(listener, pin, verifier, batch.as_ref()),
        )
        .await?;

        for event in events {
            self.bus.publish(event);
        }
        if !pin.contexts.is_empty() {
            self.dispatcher.poke();
        }
        Ok(())
    }

    /// The transactional unit: transaction row, namespace row, blockchain
    /// event, batch and context pins. Returns the user events to publish
    /// once the group has committed.
    async fn persist_pin_group(
        &self,
        listener: &str,
        pin: &BatchPinEvent,
        verifier: &VerifierRef,
        batch: Option<&Batch>,
    ) -> Result<Vec<UserEvent>, PipelineError> {
        let mut emitted = Vec::new();
        let now = self.clock.now_ms();
        let tx_id = match pin.transaction_id {
            Some(id) => id,
            None => return Ok(emitted),
        };

        let tx = TransactionRecord {
            id: tx_id,
            tx_type: TransactionType::BatchPin,
            namespace: pin.namespace.clone(),
            blockchain_tx_id: pin.event.blockchain_tx_id.clone(),
            created: now,
        };
        if !self.db.upsert_transaction(&tx).await? {
            warn!(transaction_id = %tx_id, "pin disagrees with recorded transaction, ignoring");
            return Ok(emitted);
        }

        self.db
            .upsert_namespace(&NamespaceRecord {
                id: Uuid::new_v4(),
                seq: 0,
                name: pin.namespace.clone(),
                ntype: NS_TYPE_PINNED.to_string(),
                description: String::new(),
                created: now,
                confirmed: Some(now),
            })
            .await?;

        let chain_event = BlockchainEvent {
            id: Uuid::new_v4(),
            name: pin.event.name.clone(),
            namespace: pin.namespace.clone(),
            listener: listener.to_string(),
            protocol_id: pin.event.protocol_id.clone(),
            blockchain_tx_id: pin.event.blockchain_tx_id.clone(),
            output: pin.event.output.clone(),
            info: pin.event.info.clone(),
            created: now,
        };
        match self.db.insert_blockchain_event(&chain_event).await {
            Ok(()) => {
                let mut event = UserEvent {
                    id: Uuid::new_v4(),
                    event_type: UserEventType::BlockchainEventReceived,
                    namespace: pin.namespace.clone(),
                    reference: chain_event.id,
                    topic: None,
                    sequence: 0,
                    created: now,
                };
                self.db.insert_event(&mut event).await?;
                emitted.push(event);
            }
            Err(pinloom_model::StoreError::Duplicate) => {
                // The whole pin was already processed through this
                // listener; replaying it must not emit anything twice.
                info!(protocol_id = %pin.event.protocol_id, listener, "pin already processed, skipping replay");
                return Ok(emitted);
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(batch) = batch {
            let valid = self.persist_batch(batch, Some(&pin.batch_hash)).await?;
            if valid {
                self.persist_contexts(pin, verifier, false).await?;
            }
        } else {
            self.persist_contexts(pin, verifier, true).await?;
        }
        Ok(emitted)
    }

    /// Fetch and decode a broadcast batch payload from shared storage.
    /// `Ok(None)` means the payload is terminally invalid (oversized or
    /// malformed); storage failures surface as transient errors.
    pub(crate) async fn retrieve_batch(
        &self,
        payload_ref: &str,
    ) -> Result<Option<Batch>, PipelineError> {
        let reader = self.storage.retrieve(payload_ref).await?;
        let max = self.config.max_payload_size;

        let mut buf = Vec::new();
        let mut limited = reader.take(max as u64 + 1);
        limited
            .read_to_end(&mut buf)
            .await
            .map_err(|e| pinloom_model::SharedStorageError::Unavailable(e.to_string()))?;
        if buf.len() > max {
            warn!(payload_ref, max, "batch payload exceeds size limit, ignoring");
            return Ok(None);
        }

        match serde_json::from_slice::<Batch>(&buf) {
            Ok(batch) => Ok(Some(batch)),
            Err(err) => {
                warn!(payload_ref, %err, "batch payload does not decode, ignoring");
                Ok(None)
            }
        }
    }

    /// Resolve a signing key through the shared identity cache.
    pub(crate) async fn resolve_key(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<String>, PipelineError> {
        Ok(self.resolver.resolve(namespace, key).await?)
    }
}
