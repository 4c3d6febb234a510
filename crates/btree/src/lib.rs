//! Content-addressed copy-on-write B+Tree (spec.md §4.2, C5).
//!
//! Nodes are chunks owned by whatever [`store::NodeStore`] they were
//! built over (in practice a [`tidepool_concurrency::Memdag`]); reads
//! and writes are explicit over a root [`tidepool_core::Hash`] rather
//! than a live mutable pointer, which is what lets this crate stay free
//! of any locking of its own — see [`read`] and [`write`] module docs.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binary_search;
pub mod diff;
pub mod node;
pub mod read;
pub mod store;
pub mod write;

pub use diff::{diff, DiffOp};
pub use node::{Entry, EntryValue, Node};
pub use read::BTreeRead;
pub use store::{empty_root, NodeStore};
pub use write::BTreeWrite;
