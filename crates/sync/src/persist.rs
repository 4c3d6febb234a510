//! Ties `tidepool_durability`'s memdag→perdag snapshot move to the
//! client-group registry bookkeeping spec.md §4.7 step 3c requires:
//! "Update `clientGroup.headHash`, `mutationIDs`, and
//! `lastServerAckdMutationIDs = memdagBase.lastMutationIDs`".
//!
//! `tidepool_durability::persist::persist` only knows about a raw named
//! perdag head; it has no notion of a [`ClientGroupId`]. This module is
//! the seam between the two: it drives the low-level move, then folds
//! the result back into the `client-groups` registry this crate owns.

use tidepool_concurrency::Memdag;
use tidepool_core::{ClientGroupId, CommitData, Error, Hash, MutatorRegistry, Result};
use tidepool_durability::commit::{base_snapshot_from_hash, local_mutations, Commit};
use tidepool_storage::{KvStore, Perdag};

use crate::registry::{get_client_groups, set_client_groups};

/// Persists `head_name`'s current memdag state for `client_group_id`
/// into the perdag, then records the result on that group's registry
/// entry: `head_hash` moves to the new persisted head, `mutation_ids`
/// is raised to the highest mutation id now reachable from it per
/// client, and `last_server_ackd_mutation_ids` is raised to the new
/// base snapshot's `lastMutationIDs` (never lowered — mirrors spec.md
/// §8 property 8's monotonicity requirement for acknowledged ids).
pub fn persist<K: KvStore>(
    perdag: &Perdag<K>,
    memdag: &Memdag,
    head_name: &str,
    client_group_id: ClientGroupId,
    registry: &MutatorRegistry,
) -> Result<Hash> {
    let new_head = tidepool_durability::persist::persist(perdag, memdag, head_name, registry)?;

    let base = base_snapshot_from_hash(&new_head, memdag)?;
    let snapshot_acks = match base.data() {
        CommitData::Snapshot {
            last_mutation_ids, ..
        } => last_mutation_ids.clone(),
        CommitData::Local { .. } => unreachable!("base_snapshot_from_hash always returns a snapshot"),
    };

    let mut groups = get_client_groups(perdag)?;
    let mut record = groups
        .get(client_group_id)
        .cloned()
        .ok_or_else(|| Error::ClientStateNotFound {
            reason: format!("client group {client_group_id} not found during persist"),
        })?;

    record.head_hash = new_head.clone();
    for commit in local_mutations(&new_head, memdag)? {
        if let CommitData::Local {
            client_id,
            mutation_id,
            ..
        } = commit.data()
        {
            let current = record.mutation_ids.get(*client_id);
            if *mutation_id > current {
                record.mutation_ids.set(*client_id, *mutation_id);
            }
        }
    }
    for (client_id, ackd) in snapshot_acks.iter() {
        let current = record.last_server_ackd_mutation_ids.get(client_id);
        record
            .last_server_ackd_mutation_ids
            .set(client_id, ackd.max(current));
    }

    groups.insert(client_group_id, record);
    set_client_groups(perdag, &groups)?;

    Ok(new_head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tidepool_core::{ClientId, JsonValue, MutationContext, Mutator};
    use tidepool_durability::transaction::WriteTx;
    use tidepool_storage::kv::MemKvStore;

    use crate::registry::init_client;

    struct PutMutator;
    impl Mutator for PutMutator {
        fn apply(&self, ctx: &mut dyn MutationContext, args: JsonValue) -> Result<()> {
            ctx.put(args["key"].as_str().unwrap(), args["value"].clone())
        }
    }

    #[test]
    fn persist_updates_client_group_mutation_and_ack_state() {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        let memdag = Memdag::new(perdag.clone(), tidepool_concurrency::DEFAULT_CACHE_BYTES);
        let mut registry = MutatorRegistry::new();
        registry.register("put", Arc::new(PutMutator));

        let (client, group, _) = init_client(&perdag, &memdag, &["put".into()], &[], 0).unwrap();
        for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
            let mut tx =
                WriteTx::open(&memdag, "main", client, "put", json!({"key": key, "value": value}), 0)
                    .unwrap();
            tx.run(&PutMutator).unwrap();
            tx.commit_to("main").unwrap();
        }

        persist(&perdag, &memdag, "main", group, &registry).unwrap();

        let groups = get_client_groups(&perdag).unwrap();
        let record = groups.get(group).unwrap();
        assert_eq!(record.mutation_ids.get(client), 3);
        assert_eq!(record.last_server_ackd_mutation_ids.get(client), 0);
        assert_eq!(record.head_hash, memdag.get_head("main").unwrap());
    }
}
