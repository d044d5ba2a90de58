//! Pinloom Store
//!
//! Embedded implementation of the pipeline's database contract on top of
//! redb: one file, MVCC snapshots for readers, a single writer at a time,
//! and monotonic sequence allocation for pins, user events and namespaces.

mod ops;
mod store;

pub use store::PinStore;
