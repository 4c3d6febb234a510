//! Ties `tidepool_durability`'s perdag→memdag pull to the client
//! registry bookkeeping spec.md §4.7 "Refresh" steps 2b and 4 require:
//! pinning `client.tempRefreshHash` to the group's perdag head before
//! the pull-in starts (so GC can't collect it mid-refresh), and setting
//! `client.headHash` to that same hash once the pull-in finishes,
//! clearing `tempRefreshHash` — "whether or not the refresh succeeded".

use tidepool_concurrency::Memdag;
use tidepool_core::{ClientId, Hash, MutatorRegistry, Result};
use tidepool_storage::{KvStore, Perdag};

use crate::registry::{get_clients, set_clients};

/// Refreshes `client_id`'s memdag state from `head_name`'s current
/// perdag value, bracketing the pull-in with the client registry
/// updates spec.md §4.7 describes.
///
/// Registry bookkeeping failures around the pull-in are logged and
/// swallowed rather than propagated — spec.md §4.7: "Failures in this
/// cleanup are tolerated — next refresh fixes it" — but a failure from
/// the underlying [`tidepool_durability::refresh::refresh`] call itself
/// is always returned.
pub fn refresh<K: KvStore>(
    perdag: &Perdag<K>,
    memdag: &Memdag,
    head_name: &str,
    client_id: ClientId,
    registry: &MutatorRegistry,
) -> Result<Hash> {
    let group_head = perdag.with_read(|tx| tx.get_head(head_name))?;
    if let Some(group_head) = &group_head {
        if let Err(e) = pin_temp_refresh_hash(perdag, client_id, group_head) {
            tracing::error!(client_id = %client_id, error = %e, "refresh: failed to pin tempRefreshHash");
        }
    }

    let result = tidepool_durability::refresh::refresh(perdag, memdag, head_name, registry);

    if let Some(group_head) = group_head {
        if let Err(e) = finish_refresh(perdag, client_id, group_head) {
            tracing::error!(client_id = %client_id, error = %e, "refresh: failed to clear tempRefreshHash");
        }
    }

    result
}

fn pin_temp_refresh_hash<K: KvStore>(
    perdag: &Perdag<K>,
    client_id: ClientId,
    group_head: &Hash,
) -> Result<()> {
    let mut clients = get_clients(perdag)?;
    if let Some(mut record) = clients.get(client_id).cloned() {
        record.temp_refresh_hash = Some(group_head.clone());
        clients.insert(client_id, record);
        set_clients(perdag, &clients)?;
    }
    Ok(())
}

fn finish_refresh<K: KvStore>(
    perdag: &Perdag<K>,
    client_id: ClientId,
    group_head: Hash,
) -> Result<()> {
    let mut clients = get_clients(perdag)?;
    if let Some(mut record) = clients.get(client_id).cloned() {
        record.head_hash = group_head;
        record.temp_refresh_hash = None;
        clients.insert(client_id, record);
        set_clients(perdag, &clients)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tidepool_core::{JsonValue, MutationContext, Mutator};
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
    fn refresh_sets_client_head_hash_and_clears_temp_refresh_hash() {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        let memdag = Memdag::new(perdag.clone(), tidepool_concurrency::DEFAULT_CACHE_BYTES);
        let mut registry = MutatorRegistry::new();
        registry.register("put", Arc::new(PutMutator));

        let (client, group, _) = init_client(&perdag, &memdag, &["put".into()], &[], 0).unwrap();
        let mut tx = WriteTx::open(&memdag, "main", client, "put", json!({"key": "a", "value": 1}), 0)
            .unwrap();
        tx.run(&PutMutator).unwrap();
        tx.commit_to("main").unwrap();
        crate::persist::persist(&perdag, &memdag, "main", group, &registry).unwrap();

        // A second client in the same process refreshes from perdag.
        let other_memdag = Memdag::new(perdag.clone(), tidepool_concurrency::DEFAULT_CACHE_BYTES);
        let result = refresh(&perdag, &other_memdag, "main", client, &registry).unwrap();

        let clients = get_clients(&perdag).unwrap();
        let record = clients.get(client).unwrap();
        assert_eq!(record.head_hash, result);
        assert!(record.temp_refresh_hash.is_none());
    }
}
