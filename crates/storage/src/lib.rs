//! `KVStore` abstraction and the persistent chunk DAG (perdag).
//!
//! See spec.md §4.1 (C2, C3). The memdag overlay (C4) lives in
//! `tidepool-concurrency`, which depends on this crate's
//! [`perdag::ChunkSource`] trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod kv;
pub mod perdag;

/// Result alias used throughout this crate.
pub type Result<T> = tidepool_core::Result<T>;

pub use kv::{KvRead, KvStore, KvWrite, MemKvStore};
pub use perdag::{ChunkSource, Perdag, PerdagReadTx, PerdagWriteTx};
