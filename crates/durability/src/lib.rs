//! Commit chain traversal, transactions, and the persist/refresh
//! algorithms that move state between the memdag overlay and the
//! durable perdag (spec.md §4.3-§4.5, §4.7, components C6, C7, C10).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod commit;
pub mod index;
pub mod persist;
pub mod rebase;
pub mod refresh;
pub mod transaction;

pub use commit::{
    base_snapshot_from_hash, chain, compare_cookies_for_snapshots, genesis_snapshot,
    get_mutation_id, local_mutations, local_mutations_greater_than, Commit,
};
pub use rebase::rebase_mutations;
pub use transaction::{IndexTx, ReadTx, WriteTx, WriteTxResult};
