//! Refresh: pull a client group's perdag state into this client's memdag
//! and rebase its own pending local mutations on top (spec.md §4.7, C10
//! "Refresh" — the counterpart to [`crate::persist::persist`], moving
//! state in the opposite direction).

use std::collections::HashSet;
use tidepool_core::{CommitData, Error, Hash, MutatorRegistry, Result};
use tidepool_concurrency::Memdag;
use tidepool_storage::{ChunkSource, KvStore, Perdag};

use crate::commit::{local_mutations_greater_than, Commit};
use crate::rebase::rebase_mutations;

/// Walks the chunk reachable from `root` through an already-durable
/// perdag, warming the memdag's source cache with every chunk visited
/// (spec.md §4.2: done under [`Memdag::with_suspended_source_cache_evicts_and_deletes`]
/// so nothing evicts mid-walk).
fn warm_from_perdag<K: KvStore>(perdag: &Perdag<K>, memdag: &Memdag, root: &Hash) -> Result<()> {
    fn visit<K: KvStore>(
        perdag: &Perdag<K>,
        memdag: &Memdag,
        hash: &Hash,
        seen: &mut HashSet<Hash>,
    ) -> Result<()> {
        if seen.contains(hash) {
            return Ok(());
        }
        seen.insert(hash.clone());
        let chunk = perdag
            .get_chunk(hash)?
            .ok_or_else(|| Error::ChunkNotFound(hash.clone()))?;
        for child in chunk.refs() {
            visit(perdag, memdag, child, seen)?;
        }
        memdag.warm_cache(chunk);
        Ok(())
    }
    let mut seen = HashSet::new();
    visit(perdag, memdag, root, &mut seen)
}

/// Pulls `head_name`'s current perdag state into the memdag and rebases
/// any local mutations this client still has pending on top of it.
///
/// Returns the (possibly unchanged) resulting memdag head. A no-op if
/// the perdag doesn't have `head_name` yet, or if its current value is
/// already what this client's memdag head is based on.
pub fn refresh<K: KvStore>(
    perdag: &Perdag<K>,
    memdag: &Memdag,
    head_name: &str,
    registry: &MutatorRegistry,
) -> Result<Hash> {
    let perdag_head = match perdag.with_read(|tx| tx.get_head(head_name))? {
        Some(h) => h,
        None => {
            return memdag
                .get_head(head_name)
                .ok_or_else(|| Error::InvalidOperation(format!("no such head: {head_name}")))
        }
    };

    let local_head_hash = memdag.get_head(head_name);
    if let Some(local_head_hash) = &local_head_hash {
        let current_base = crate::commit::base_snapshot_from_hash(local_head_hash, memdag)?;
        if current_base.hash() == &perdag_head {
            return Ok(local_head_hash.clone());
        }
    }

    memdag.with_suspended_source_cache_evicts_and_deletes(|| {
        warm_from_perdag(perdag, memdag, &perdag_head)
    })?;

    let new_snapshot = Commit::from_hash(&perdag_head, memdag)?;
    let local_head_hash = match local_head_hash {
        Some(h) => h,
        None => {
            memdag.set_head(head_name, perdag_head.clone());
            return Ok(perdag_head);
        }
    };

    let floor = match new_snapshot.data() {
        CommitData::Snapshot {
            last_mutation_ids, ..
        } => last_mutation_ids.clone(),
        CommitData::Local { .. } => {
            return Err(Error::InvalidOperation(
                "refresh: perdag head is not a snapshot".into(),
            ))
        }
    };
    let mut pending = local_mutations_greater_than(&local_head_hash, &floor, memdag)?;
    pending.reverse(); // oldest first

    rebase_mutations(memdag, &new_snapshot, &pending, registry, head_name)
}
