//! Capability contracts for the core's external collaborators
//!
//! One trait per collaborator: content-addressed shared storage, the
//! identity resolver, and the database plugin. Implementations live
//! elsewhere (the embedded redb store, adapter crates, test fakes); the
//! pipeline only ever sees these traits.

use crate::batch::Batch;
use crate::data::Data;
use crate::message::{Message, MessageState};
use crate::records::{
    BlockchainEvent, NamespaceRecord, PinRecord, TransactionRecord, UserEvent,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;
use uuid::Uuid;

/// Errors from the shared-storage adapter. Both variants are retryable:
/// a reference that cannot be resolved yet may simply not have propagated
/// to this node's storage peer.
#[derive(Error, Debug)]
pub enum SharedStorageError {
    #[error("payload ref '{0}' not found in shared storage")]
    NotFound(String),
    #[error("shared storage unavailable: {0}")]
    Unavailable(String),
}

/// Content-addressed blob storage shared between the parties.
#[async_trait]
pub trait SharedStorage: Send + Sync {
    /// Open a byte stream for the given content reference.
    async fn retrieve(
        &self,
        payload_ref: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, SharedStorageError>;

    /// Publish bytes, returning their content reference.
    async fn publish(&self, data: &[u8]) -> Result<String, SharedStorageError>;
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("identity resolution unavailable: {0}")]
    Unavailable(String),
}

/// Resolves raw signing keys to canonical author identifiers.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Normalize a signing key within a namespace. `Ok(None)` means the
    /// key resolves to no registered identity, which is a terminal
    /// rejection of whatever carried it; errors are retryable.
    async fn normalize_signing_key(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<String>, IdentityError>;
}

/// Errors from the database plugin. `Backend` is the only retryable
/// variant; the rest are discriminated outcomes callers handle in place.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A row already exists under this id with different content.
    #[error("existing record has a different hash")]
    HashMismatch,
    /// A uniqueness constraint was hit by an insert.
    #[error("record already exists")]
    Duplicate,
    #[error("record not found")]
    NotFound,
    #[error("illegal state transition {from:?} -> {to:?}")]
    InvalidTransition { from: MessageState, to: MessageState },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}

/// How an upsert resolves when the row already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// Optimized for the row being new: write, tolerate overwrite.
    New,
    /// Optimized for the row existing: keep the stored row untouched.
    Existing,
}

/// The transactional KV+relational store the pipeline persists into.
///
/// Writes issued between `begin_group` and `end_group(true)` commit
/// atomically; without a group every write commits on its own. Sequences
/// (pins, user events, namespaces) are allocated monotonically at first
/// insert and never reassigned.
#[async_trait]
pub trait Database: Send + Sync {
    async fn begin_group(&self) -> Result<(), StoreError>;
    async fn end_group(&self, commit: bool) -> Result<(), StoreError>;

    /// Upsert a batch. `HashMismatch` when a batch with this id already
    /// exists under a different content hash.
    async fn upsert_batch(&self, batch: &Batch) -> Result<(), StoreError>;
    async fn get_batch(&self, id: &Uuid) -> Result<Option<Batch>, StoreError>;

    /// Optimistic bulk insert; fails whole on any pre-existing row.
    async fn insert_data_array(&self, data: &[Data]) -> Result<(), StoreError>;
    async fn upsert_data(&self, data: &Data, mode: UpsertMode) -> Result<(), StoreError>;
    async fn get_data(&self, id: &Uuid) -> Result<Option<Data>, StoreError>;

    /// Optimistic bulk insert; fails whole on any pre-existing row.
    async fn insert_messages(&self, messages: &[Message]) -> Result<(), StoreError>;
    async fn upsert_message(&self, message: &Message, mode: UpsertMode) -> Result<(), StoreError>;
    async fn get_message(&self, id: &Uuid) -> Result<Option<Message>, StoreError>;
    /// Forward-only state change; regressions return `InvalidTransition`.
    async fn set_message_state(&self, id: &Uuid, state: MessageState) -> Result<(), StoreError>;

    /// Bulk insert pins, assigning each its global sequence. `Duplicate`
    /// when any pin (batch, index) already exists.
    async fn insert_pins(&self, pins: &mut [PinRecord]) -> Result<(), StoreError>;
    /// Duplicate-tolerant single-pin write: an existing row keeps its
    /// sequence and dispatch flags.
    async fn upsert_pin(&self, pin: &PinRecord) -> Result<(), StoreError>;
    async fn get_pin(&self, batch: &Uuid, index: u32) -> Result<Option<PinRecord>, StoreError>;
    /// Pins with `sequence > after`, ascending, at most `limit`.
    async fn list_pins_after(&self, after: u64, limit: usize) -> Result<Vec<PinRecord>, StoreError>;
    /// Durably mark a pin dispatched (optionally as a rejection). Set
    /// exactly once; later calls are no-ops.
    async fn set_pin_dispatched(&self, sequence: u64, rejected: bool) -> Result<(), StoreError>;

    /// `Duplicate` when an event with the same `(protocol_id, listener)`
    /// was already recorded.
    async fn insert_blockchain_event(&self, event: &BlockchainEvent) -> Result<(), StoreError>;

    /// Insert a user event, assigning its sequence.
    async fn insert_event(&self, event: &mut UserEvent) -> Result<(), StoreError>;
    /// User events with `sequence > after`, ascending, at most `limit`.
    async fn list_events_after(&self, after: u64, limit: usize)
        -> Result<Vec<UserEvent>, StoreError>;

    /// Reconcile a transaction row against an inbound pin. `Ok(false)`
    /// when an existing row disagrees on type or blockchain transaction
    /// id (a replay or corruption, for the caller to swallow).
    async fn upsert_transaction(&self, tx: &TransactionRecord) -> Result<bool, StoreError>;
    async fn get_transaction(&self, id: &Uuid) -> Result<Option<TransactionRecord>, StoreError>;

    /// Ensure a namespace row exists; an existing row is preserved.
    async fn upsert_namespace(&self, ns: &NamespaceRecord) -> Result<(), StoreError>;
    async fn get_namespace(&self, name: &str) -> Result<Option<NamespaceRecord>, StoreError>;
}

/// Run `fut` inside one transactional group: commit on `Ok`, roll back on
/// `Err`. The rollback error, if any, is swallowed in favor of the
/// original failure.
pub async fn run_as_group<D, T, E, Fut>(db: &D, fut: Fut) -> Result<T, E>
where
    D: Database + ?Sized,
    E: From<StoreError>,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    db.begin_group().await?;
    match fut.await {
        Ok(value) => {
            db.end_group(true).await?;
            Ok(value)
        }
        Err(err) => {
            let _ = db.end_group(false).await;
            Err(err)
        }
    }
}
