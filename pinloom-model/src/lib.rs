//! Pinloom Model
//!
//! Pure data types and collaborator contracts for the pinloom sync core,
//! decoupled from storage engines, ledger adapters and the pipeline.

pub mod batch;
pub mod clock;
pub mod data;
pub mod digest;
pub mod ledger;
pub mod message;
pub mod names;
pub mod records;
pub mod traits;
pub mod types;

// Re-exports from dependencies
pub use uuid::Uuid;

pub use batch::{Batch, BatchHeader, BatchManifest, BatchPayload, BatchType, TransactionRef};
pub use clock::{Clock, MockClock, SystemClock};
pub use data::{BlobRef, Data};
pub use digest::{canonical_json, hash_json, CodecError};
pub use ledger::{BatchPinEvent, LedgerEvent, VerifierRef, VerifierType};
pub use message::{
    data_refs_hash, DataRef, Message, MessageHeader, MessageState, MessageType, SealError,
    SignerRef, TransactionType,
};
pub use names::{validate_name, validate_topics, NameError, NAME_MAX_LEN, TOPICS_MAX_ITEMS};
pub use records::{
    context_hash, BlockchainEvent, NamespaceRecord, PinRecord, TransactionRecord, UserEvent,
    UserEventType, NAMESPACE_DESCRIPTION_MAX_LEN,
};
pub use traits::{
    run_as_group, Database, IdentityError, IdentityResolver, SharedStorage, SharedStorageError,
    StoreError, UpsertMode,
};
pub use types::Hash;
