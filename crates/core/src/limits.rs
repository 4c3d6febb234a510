//! B+Tree node size constants.
//!
//! These are part of the on-chunk format: a node's entries must sum
//! (including [`CHUNK_HEADER_SIZE`]) to within `[MIN_SIZE, MAX_SIZE]`,
//! except for the unique root when it cannot be split further. Changing
//! these after chunks have been written would require a migration.

/// Maximum serialized size of a B+Tree node chunk, in bytes.
pub const MAX_SIZE: usize = 64 * 1024;

/// Minimum serialized size of a non-root B+Tree node chunk, in bytes.
pub const MIN_SIZE: usize = MAX_SIZE / 2;

/// Fixed JSON overhead of a node chunk excluding its entries (the
/// `[level, entries]` wrapper).
pub const CHUNK_HEADER_SIZE: usize = 16;
