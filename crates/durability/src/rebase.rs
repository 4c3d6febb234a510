//! Replays a list of local commits onto a new basis (spec.md §4.6
//! "Rebase one mutation onto syncHead", component C9's core primitive —
//! shared by `tidepool-durability::refresh` here and
//! `tidepool-sync::pull`'s rebase step).

use std::collections::HashSet;
use tidepool_core::{CommitData, Error, Hash, MutatorRegistry, Result};

use crate::commit::Commit;
use crate::transaction::{is_index_change, IndexTx, WriteTx};
use tidepool_concurrency::Memdag;

/// Replays `mutations` (oldest first) on top of `onto`, in order,
/// leaving `head_name` pointed at the final result. A mutation whose
/// `mutator_name` is no longer present in `registry` is replayed as a
/// no-op that still advances the mutation id and basis — spec.md §4.6:
/// "If the mutator is no longer registered, treat as a no-op". Index
/// create/drop commits (see [`is_index_change`]) are replayed
/// structurally via [`IndexTx`] instead of through the registry.
///
/// Returns the hash of the final (possibly unchanged, if `mutations` is
/// empty) commit.
pub fn rebase_mutations(
    memdag: &Memdag,
    onto: &Commit,
    mutations: &[Commit],
    registry: &MutatorRegistry,
    head_name: &str,
) -> Result<Hash> {
    let mut current = onto.clone();
    for original in mutations {
        match original.data() {
            CommitData::Snapshot { .. } => {
                return Err(Error::InvalidOperation(
                    "rebase_mutations: a snapshot is not a replayable mutation".into(),
                ))
            }
            CommitData::Local {
                mutator_name,
                mutator_args,
                client_id,
                timestamp,
                mutation_id,
                ..
            } => {
                if is_index_change(mutator_name) {
                    current = replay_index_change(memdag, head_name, &current, original)?;
                    continue;
                }
                let mut tx = WriteTx::open_for_rebase(
                    memdag,
                    &current,
                    original,
                    *client_id,
                    mutator_name.clone(),
                    mutator_args.clone(),
                    *timestamp,
                    *mutation_id,
                );
                if let Some(mutator) = registry.get(mutator_name) {
                    tx.run(mutator.as_ref())?;
                }
                let result = tx.commit_to(head_name)?;
                current = Commit::from_hash(&result.head_hash, memdag)?;
            }
        }
    }
    memdag.set_head(head_name, current.hash().clone());
    Ok(current.hash().clone())
}

/// Replays one index-change commit structurally: diffs `original`'s
/// index set against its own basis to recover whether it was a create
/// or a drop, then re-derives the equivalent change against `current`
/// (which may have a different value tree than `original`'s basis did,
/// e.g. a create backfills from whatever data `current` holds now).
fn replay_index_change(
    memdag: &Memdag,
    head_name: &str,
    current: &Commit,
    original: &Commit,
) -> Result<Commit> {
    let (client_id, timestamp) = match original.data() {
        CommitData::Local {
            client_id,
            timestamp,
            ..
        } => (*client_id, *timestamp),
        CommitData::Snapshot { .. } => unreachable!("caller only passes Local commits here"),
    };
    let original_basis = Commit::from_hash(
        original
            .data()
            .basis_hash()
            .expect("a local commit always has a basis"),
        memdag,
    )?;
    let before: HashSet<&str> = original_basis
        .data()
        .indexes()
        .iter()
        .map(|r| r.definition.name.as_str())
        .collect();
    let after: HashSet<&str> = original
        .data()
        .indexes()
        .iter()
        .map(|r| r.definition.name.as_str())
        .collect();

    memdag.set_head(head_name, current.hash().clone());
    if let Some(&added) = after.difference(&before).next() {
        let definition = original
            .data()
            .indexes()
            .iter()
            .find(|r| r.definition.name == added)
            .expect("added name came from this commit's own indexes")
            .definition
            .clone();
        let result = IndexTx::create_index(memdag, head_name, client_id, timestamp, definition)?;
        Commit::from_hash(&result.head_hash, memdag)
    } else if let Some(&removed) = before.difference(&after).next() {
        let result = IndexTx::drop_index(memdag, head_name, client_id, timestamp, removed)?;
        Commit::from_hash(&result.head_hash, memdag)
    } else {
        // No net index change (can happen if a later rebase step already
        // folded it in); nothing to do.
        Ok(current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::genesis_snapshot;
    use serde_json::json;
    use std::sync::Arc;
    use tidepool_core::{JsonValue, MutationContext, Mutator};
    use tidepool_storage::{kv::MemKvStore, perdag::Perdag};

    fn new_memdag() -> Memdag {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        Memdag::new(perdag, tidepool_concurrency::DEFAULT_CACHE_BYTES)
    }

    struct PutMutator;
    impl Mutator for PutMutator {
        fn apply(&self, ctx: &mut dyn MutationContext, args: JsonValue) -> Result<()> {
            ctx.put(args["key"].as_str().unwrap(), args["value"].clone())
        }
    }

    #[test]
    fn rebase_replays_mutations_onto_new_basis() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("local", genesis_hash.clone());
        let client = tidepool_core::ClientId::new();

        let mut tx = WriteTx::open(&memdag, "local", client, "put", json!({"key": "a", "value": 1}), 0)
            .unwrap();
        tx.run(&PutMutator).unwrap();
        let r1 = tx.commit_to("local").unwrap();
        let m1 = Commit::from_hash(&r1.head_hash, &memdag).unwrap();

        // A different snapshot (simulating one pulled from the server)
        // that the original genesis's single mutation should rebase onto.
        let new_basis_hash = genesis_snapshot(&memdag).hash().clone();
        let new_basis = Commit::from_hash(&new_basis_hash, &memdag).unwrap();

        let mut registry = MutatorRegistry::new();
        registry.register("put", Arc::new(PutMutator));

        let final_hash =
            rebase_mutations(&memdag, &new_basis, &[m1], &registry, "rebased").unwrap();
        let final_commit = Commit::from_hash(&final_hash, &memdag).unwrap();
        assert_eq!(final_commit.data().mutation_id(client), 1);
        assert_eq!(memdag.get_head("rebased"), Some(final_hash));
    }

    #[test]
    fn unregistered_mutator_is_replayed_as_noop() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("local", genesis_hash);
        let client = tidepool_core::ClientId::new();

        let mut tx = WriteTx::open(
            &memdag,
            "local",
            client,
            "gone",
            json!({"key": "a", "value": 1}),
            0,
        )
        .unwrap();
        // Mutator "gone" was never run against tx (simulating that it's
        // unregistered on this client): value tree stays at basis.
        let r1 = tx.commit_to("local").unwrap();
        let m1 = Commit::from_hash(&r1.head_hash, &memdag).unwrap();

        let onto_hash = genesis_snapshot(&memdag).hash().clone();
        let onto = Commit::from_hash(&onto_hash, &memdag).unwrap();
        let registry = MutatorRegistry::new();
        let final_hash = rebase_mutations(&memdag, &onto, &[m1], &registry, "rebased").unwrap();
        let final_commit = Commit::from_hash(&final_hash, &memdag).unwrap();
        assert_eq!(final_commit.data().mutation_id(client), 1);
    }
}
