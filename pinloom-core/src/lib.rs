//! Pinloom Core
//!
//! The receive side of the batch-pin exchange: ingest pin events observed
//! on the ledger, reconstruct the referenced batches from shared storage,
//! persist them with end-to-end hash verification, and dispatch per-topic
//! user events in global sequence order - exactly once, tolerant of
//! duplicates, out-of-order delivery and partial failure.

pub mod aggregator;
pub mod bus;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
mod persist;
pub mod pipeline;
pub mod retry;

pub use aggregator::Aggregator;
pub use bus::EventBus;
pub use cache::{IdentityCache, KeyResolver, MessageDataCache};
pub use config::{CoreConfig, RetryConfig};
pub use dispatch::{Dispatcher, DispatcherHandle};
pub use error::PipelineError;
pub use listener::{spawn_listener, PinDelivery};
pub use pipeline::Pipeline;
pub use retry::Retrier;
