//! Client registry and garbage collection (spec.md §4.8, C11).
//!
//! The `clients` head always points at a chunk whose `refs` are exactly
//! the set of hashes [`ClientMap::referenced_hashes`] reports, so moving
//! it (via [`set_clients`]) keeps every registered client's commit
//! chain alive through the perdag's ordinary refcount GC. `client-groups`
//! is a plain value head with no such constraint — a group's own
//! `head_hash` is already kept alive by whichever client(s) reference it.

use std::collections::HashSet;
use tidepool_concurrency::Memdag;
use tidepool_core::{
    ClientGroupId, ClientGroupMap, ClientGroupRecord, ClientId, ClientMap, ClientRecord, Error,
    IndexDefinition, MutationIdMap, Result,
};
use tidepool_durability::commit::{base_snapshot_from_hash, genesis_snapshot, Commit};
use tidepool_storage::{KvStore, Perdag};

const CLIENTS_HEAD: &str = "clients";
const CLIENT_GROUPS_HEAD: &str = "client-groups";

/// Reads the current `clients` registry, or an empty one if the head
/// doesn't exist yet.
pub fn get_clients<K: KvStore>(perdag: &Perdag<K>) -> Result<ClientMap> {
    perdag.with_read(|tx| match tx.get_head(CLIENTS_HEAD)? {
        Some(hash) => decode(&tx.must_get_chunk(&hash)?),
        None => Ok(ClientMap::new()),
    })
}

/// Reads the current `client-groups` registry, or an empty one if the
/// head doesn't exist yet.
pub fn get_client_groups<K: KvStore>(perdag: &Perdag<K>) -> Result<ClientGroupMap> {
    perdag.with_read(|tx| match tx.get_head(CLIENT_GROUPS_HEAD)? {
        Some(hash) => decode(&tx.must_get_chunk(&hash)?),
        None => Ok(ClientGroupMap::new()),
    })
}

fn decode<T: serde::de::DeserializeOwned>(chunk: &tidepool_core::Chunk) -> Result<T> {
    serde_json::from_value(chunk.data().clone()).map_err(Error::from)
}

/// Writes `clients`, recomputing its chunk's `refs` from
/// [`ClientMap::referenced_hashes`] so every registered client's chain
/// stays reachable.
pub fn set_clients<K: KvStore>(perdag: &Perdag<K>, clients: &ClientMap) -> Result<()> {
    let data = serde_json::to_value(clients)?;
    let refs = clients.referenced_hashes();
    perdag.with_write(|tx| {
        let chunk = tidepool_core::Chunk::new_content_addressed(data, refs);
        tx.put_chunk(&chunk)?;
        tx.set_head(CLIENTS_HEAD, chunk.hash().clone())
    })
}

/// Writes `client-groups` (a plain value chunk; group heads are kept
/// alive transitively through the client that references them, never
/// through this head's own refs).
pub fn set_client_groups<K: KvStore>(perdag: &Perdag<K>, groups: &ClientGroupMap) -> Result<()> {
    let data = serde_json::to_value(groups)?;
    perdag.with_write(|tx| {
        let chunk = tidepool_core::Chunk::new_content_addressed(data, Vec::new());
        tx.put_chunk(&chunk)?;
        tx.set_head(CLIENT_GROUPS_HEAD, chunk.hash().clone())
    })
}

/// What [`init_client`] decided (spec.md §4.8 `initClient`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitClientResult {
    /// No existing client group at all; a brand new one was created
    /// with an empty genesis snapshot.
    New,
    /// An existing group's mutator/index definitions matched exactly;
    /// the new client was registered against it directly.
    Head,
    /// A candidate group existed but its definitions didn't match; a
    /// new group was branched from the candidate's base snapshot,
    /// inheriting its index roots by hash.
    Fork,
}

/// spec.md §4.8 `initClient`: registers a new [`ClientId`], deciding
/// whether to join an existing compatible client group, fork one, or
/// start fresh.
///
/// `mutator_names` must already be sorted (see
/// [`MutatorRegistry::names`]); `index_definitions` are this client's
/// currently configured secondary indexes.
pub fn init_client<K: KvStore>(
    perdag: &Perdag<K>,
    memdag: &Memdag,
    mutator_names: &[String],
    index_definitions: &[IndexDefinition],
    now_ms: i64,
) -> Result<(ClientId, ClientGroupId, InitClientResult)> {
    let groups = get_client_groups(perdag)?;
    let mut compatible: Option<(ClientGroupId, ClientGroupRecord)> = None;
    let mut any_candidate: Option<ClientGroupRecord> = None;
    for (id, g) in groups.iter() {
        if any_candidate.is_none() {
            any_candidate = Some(g.clone());
        }
        if g.mutator_names == mutator_names && g.index_definitions == index_definitions {
            compatible = Some((*id, g.clone()));
            break;
        }
    }

    let client_id = ClientId::new();
    let (client_group_id, head_hash, result, new_group) = match compatible {
        Some((group_id, group)) => (group_id, group.head_hash.clone(), InitClientResult::Head, None),
        None => match any_candidate {
            Some(candidate) => {
                let base = base_snapshot_from_hash(&candidate.head_hash, memdag)?;
                tidepool_durability::persist::persist_closure(perdag, memdag, base.hash())?;
                let group_id = ClientGroupId::new();
                let record = ClientGroupRecord {
                    head_hash: base.hash().clone(),
                    mutation_ids: MutationIdMap::new(),
                    last_server_ackd_mutation_ids: MutationIdMap::new(),
                    mutator_names: mutator_names.to_vec(),
                    index_definitions: index_definitions.to_vec(),
                    disabled: false,
                };
                (group_id, base.hash().clone(), InitClientResult::Fork, Some(record))
            }
            None => {
                let genesis = Commit::from_chunk(genesis_snapshot(memdag))?;
                tidepool_durability::persist::persist_closure(perdag, memdag, genesis.hash())?;
                let group_id = ClientGroupId::new();
                let record = ClientGroupRecord {
                    head_hash: genesis.hash().clone(),
                    mutation_ids: MutationIdMap::new(),
                    last_server_ackd_mutation_ids: MutationIdMap::new(),
                    mutator_names: mutator_names.to_vec(),
                    index_definitions: index_definitions.to_vec(),
                    disabled: false,
                };
                (group_id, genesis.hash().clone(), InitClientResult::New, Some(record))
            }
        },
    };

    if let Some(record) = new_group {
        let mut groups = groups;
        groups.insert(client_group_id, record);
        set_client_groups(perdag, &groups)?;
    }

    let mut clients = get_clients(perdag)?;
    clients.insert(
        client_id,
        ClientRecord {
            client_group_id,
            head_hash: head_hash.clone(),
            temp_refresh_hash: None,
            heartbeat_timestamp_ms: now_ms,
        },
    );
    set_clients(perdag, &clients)?;

    memdag.set_head("main", head_hash);
    Ok((client_id, client_group_id, result))
}

/// spec.md §4.8 "heartbeats": updates `client_id`'s
/// `heartbeatTimestampMs` to `now_ms`. A no-op if the client is no
/// longer registered (already GC'd).
pub fn heartbeat<K: KvStore>(perdag: &Perdag<K>, client_id: ClientId, now_ms: i64) -> Result<()> {
    let mut clients = get_clients(perdag)?;
    if let Some(record) = clients.get(client_id).cloned() {
        clients.insert(
            client_id,
            ClientRecord {
                heartbeat_timestamp_ms: now_ms,
                ..record
            },
        );
        set_clients(perdag, &clients)?;
    }
    Ok(())
}

/// spec.md §4.8 "client GC": removes every client whose heartbeat is
/// older than `ttl_ms` as of `now_ms`. Returns the removed ids.
pub fn gc_clients<K: KvStore>(perdag: &Perdag<K>, now_ms: i64, ttl_ms: i64) -> Result<Vec<ClientId>> {
    let mut clients = get_clients(perdag)?;
    let stale: Vec<ClientId> = clients
        .iter()
        .filter(|(_, r)| now_ms - r.heartbeat_timestamp_ms > ttl_ms)
        .map(|(id, _)| *id)
        .collect();
    if stale.is_empty() {
        return Ok(stale);
    }
    for id in &stale {
        clients.remove(id);
    }
    set_clients(perdag, &clients)?;
    Ok(stale)
}

/// spec.md §4.8 "clientGroup GC": removes every client group with no
/// referencing client and no pending mutations (`mutationIDs ==
/// lastServerAckdMutationIDs` for every client id it knows about).
/// Returns the removed ids.
pub fn gc_client_groups<K: KvStore>(perdag: &Perdag<K>) -> Result<Vec<ClientGroupId>> {
    let clients = get_clients(perdag)?;
    let referenced: HashSet<ClientGroupId> =
        clients.iter().map(|(_, r)| r.client_group_id).collect();

    let mut groups = get_client_groups(perdag)?;
    let doomed: Vec<ClientGroupId> = groups
        .iter()
        .filter(|(id, g)| {
            !referenced.contains(*id)
                && g.mutation_ids
                    .iter()
                    .all(|(c, mid)| mid == g.last_server_ackd_mutation_ids.get(c))
        })
        .map(|(id, _)| *id)
        .collect();
    if doomed.is_empty() {
        return Ok(doomed);
    }
    for id in &doomed {
        groups.remove(id);
    }
    set_client_groups(perdag, &groups)?;
    Ok(doomed)
}
