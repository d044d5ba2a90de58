//! Pipeline error classification
//!
//! Inbound ledger events cannot be NACKed, so the pipeline distinguishes
//! only two fates for an error: transient ones re-run the enclosing
//! transactional group, everything else is logged and swallowed at the
//! point it is understood. `Cancelled` unwinds without side effects.

use pinloom_model::{IdentityError, SharedStorageError, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("shared storage: {0}")]
    Storage(#[from] SharedStorageError),
    #[error("identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("operation cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Whether a retry of the enclosing group can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Store(e) => e.is_transient(),
            PipelineError::Storage(_) => true,
            PipelineError::Identity(_) => true,
            PipelineError::Cancelled => false,
        }
    }
}
