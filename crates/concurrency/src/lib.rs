//! The memdag lazy overlay and its bounded source-chunk cache
//! (spec.md §4.1, C4), plus the write-lock model §5 layers on top of.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
pub mod memdag;

pub use memdag::{Memdag, DEFAULT_CACHE_BYTES};
