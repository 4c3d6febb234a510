//! Commit chain traversal (spec.md §4.3, C6).
//!
//! A [`Commit`] wraps the [`Chunk`] a commit is stored as together with
//! its decoded [`CommitData`]. Every traversal helper here takes an
//! explicit [`Memdag`] so the same functions work whether the chain is
//! rooted in memdag-only (temp) chunks or already-persisted perdag
//! chunks fetched through the memdag overlay.

use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use tidepool_concurrency::Memdag;
use tidepool_core::{
    Chunk, ClientId, CommitData, CookieOrder, Error, Hash, MutationId, MutationIdMap, Result,
};

/// A commit chunk plus its decoded payload.
#[derive(Debug, Clone)]
pub struct Commit {
    chunk: Chunk,
    data: CommitData,
}

impl Commit {
    /// Decodes a commit from an already-fetched chunk.
    pub fn from_chunk(chunk: Chunk) -> Result<Self> {
        let data: CommitData = serde_json::from_value(chunk.data().clone())?;
        Ok(Self { chunk, data })
    }

    /// Fetches and decodes the commit at `hash`.
    pub fn from_hash(hash: &Hash, memdag: &Memdag) -> Result<Self> {
        Self::from_chunk(memdag.must_get_chunk(hash)?)
    }

    /// Fetches and decodes the commit a named head currently points at,
    /// or `None` if the head doesn't exist.
    pub fn from_head(name: &str, memdag: &Memdag) -> Result<Option<Self>> {
        match memdag.get_head(name) {
            Some(h) => Ok(Some(Self::from_hash(&h, memdag)?)),
            None => Ok(None),
        }
    }

    /// This commit's own hash.
    pub fn hash(&self) -> &Hash {
        self.chunk.hash()
    }

    /// This commit's decoded payload.
    pub fn data(&self) -> &CommitData {
        &self.data
    }

    /// The underlying chunk.
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    /// The exact refs a commit chunk for `data` must carry: its value
    /// tree root, its basis (if any), and every index root — spec.md
    /// §3's "refs is the exact set of other chunks referenced".
    pub fn refs_for(data: &CommitData) -> Vec<Hash> {
        let mut refs = vec![data.value_hash().clone()];
        if let Some(basis) = data.basis_hash() {
            refs.push(basis.clone());
        }
        refs.extend(data.indexes().iter().map(|i| i.value_hash.clone()));
        refs
    }

    /// Mints a new (temp-owned) commit chunk for `data`.
    pub fn new_chunk(memdag: &Memdag, data: CommitData) -> Chunk {
        let refs = Self::refs_for(&data);
        let json = serde_json::to_value(&data).expect("CommitData always serializes");
        memdag.put_temp_chunk(json, refs)
    }
}

/// Builds the very first commit of a new client group: an empty
/// snapshot with no basis, no acknowledged mutations, and a `null`
/// cookie (spec.md §8 S1).
pub fn genesis_snapshot(memdag: &Memdag) -> Chunk {
    let value_hash = tidepool_btree::empty_root(memdag);
    Commit::new_chunk(
        memdag,
        CommitData::Snapshot {
            basis_hash: None,
            last_mutation_ids: MutationIdMap::new(),
            cookie: JsonValue::Null,
            value_hash,
            indexes: Vec::new(),
        },
    )
}

/// Walks `basisHash` links from `hash` until a snapshot commit is
/// reached (spec.md §4.3 `baseSnapshotFromHash`).
pub fn base_snapshot_from_hash(hash: &Hash, memdag: &Memdag) -> Result<Commit> {
    let mut commit = Commit::from_hash(hash, memdag)?;
    while !commit.data().is_snapshot() {
        let basis = commit
            .data()
            .basis_hash()
            .expect("a local commit always has a basis")
            .clone();
        commit = Commit::from_hash(&basis, memdag)?;
    }
    Ok(commit)
}

/// All local commits between `hash` and its base snapshot, newest
/// first (spec.md §4.3 `localMutations`).
pub fn local_mutations(hash: &Hash, memdag: &Memdag) -> Result<Vec<Commit>> {
    let mut out = Vec::new();
    let mut cur = Commit::from_hash(hash, memdag)?;
    while !cur.data().is_snapshot() {
        let basis = cur
            .data()
            .basis_hash()
            .expect("a local commit always has a basis")
            .clone();
        out.push(cur);
        cur = Commit::from_hash(&basis, memdag)?;
    }
    Ok(out)
}

/// The subset of [`local_mutations`] whose mutation id exceeds the
/// floor recorded for its client in `floor` (spec.md §4.3
/// `localMutationsGreaterThan`).
pub fn local_mutations_greater_than(
    hash: &Hash,
    floor: &MutationIdMap,
    memdag: &Memdag,
) -> Result<Vec<Commit>> {
    let all = local_mutations(hash, memdag)?;
    Ok(all
        .into_iter()
        .filter(|c| match c.data() {
            CommitData::Local {
                client_id,
                mutation_id,
                ..
            } => *mutation_id > floor.get(*client_id),
            CommitData::Snapshot { .. } => false,
        })
        .collect())
}

/// The full chain from the base snapshot to `hash`, oldest first
/// (spec.md §4.3 `chain`).
pub fn chain(hash: &Hash, memdag: &Memdag) -> Result<Vec<Commit>> {
    let mut locals = local_mutations(hash, memdag)?;
    locals.reverse();
    let base = base_snapshot_from_hash(hash, memdag)?;
    let mut result = vec![base];
    result.extend(locals);
    Ok(result)
}

/// spec.md §4.3 `getMutationID`: for a local commit belonging to
/// `client_id`, that commit's own mutation id; otherwise walks up to
/// the nearest ancestor (a snapshot, or a local commit for a different
/// client) and reports its recorded value for `client_id`.
pub fn get_mutation_id(client_id: ClientId, hash: &Hash, memdag: &Memdag) -> Result<MutationId> {
    let commit = Commit::from_hash(hash, memdag)?;
    match commit.data() {
        CommitData::Local {
            client_id: c,
            mutation_id,
            basis_hash,
            ..
        } => {
            if *c == client_id {
                Ok(*mutation_id)
            } else {
                get_mutation_id(client_id, basis_hash, memdag)
            }
        }
        CommitData::Snapshot {
            last_mutation_ids, ..
        } => Ok(last_mutation_ids.get(client_id)),
    }
}

/// spec.md §4.3 `compareCookiesForSnapshots`: delegates to the
/// embedder-supplied [`CookieOrder`]. Both commits must be snapshots.
pub fn compare_cookies_for_snapshots(
    a: &Commit,
    b: &Commit,
    order: &dyn CookieOrder,
) -> Result<Ordering> {
    match (a.data(), b.data()) {
        (
            CommitData::Snapshot { cookie: ca, .. },
            CommitData::Snapshot { cookie: cb, .. },
        ) => Ok(order.compare(ca, cb)),
        _ => Err(Error::InvalidOperation(
            "compare_cookies_for_snapshots called on a non-snapshot commit".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tidepool_core::{ClientId, IndexDefinition, IndexRecord};
    use tidepool_storage::{kv::MemKvStore, perdag::Perdag};

    fn new_memdag() -> Memdag {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        Memdag::new(perdag, tidepool_concurrency::DEFAULT_CACHE_BYTES)
    }

    fn local_commit(memdag: &Memdag, basis: &Commit, client: ClientId, mid: MutationId) -> Commit {
        let data = CommitData::Local {
            basis_hash: basis.hash().clone(),
            client_id: client,
            mutation_id: mid,
            mutator_name: "noop".into(),
            mutator_args: JsonValue::Null,
            original_hash: None,
            timestamp: 0,
            value_hash: basis.data().value_hash().clone(),
            indexes: basis.data().indexes().to_vec(),
        };
        Commit::from_chunk(Commit::new_chunk(memdag, data)).unwrap()
    }

    #[test]
    fn base_snapshot_and_local_mutations_walk_the_chain() {
        let memdag = new_memdag();
        let genesis = Commit::from_chunk(genesis_snapshot(&memdag)).unwrap();
        let client = ClientId::new();
        let m1 = local_commit(&memdag, &genesis, client, 1);
        let m2 = local_commit(&memdag, &m1, client, 2);

        let base = base_snapshot_from_hash(m2.hash(), &memdag).unwrap();
        assert_eq!(base.hash(), genesis.hash());

        let locals = local_mutations(m2.hash(), &memdag).unwrap();
        assert_eq!(locals.len(), 2);
        assert_eq!(locals[0].hash(), m2.hash());
        assert_eq!(locals[1].hash(), m1.hash());

        let full = chain(m2.hash(), &memdag).unwrap();
        assert_eq!(full.len(), 3);
        assert_eq!(full[0].hash(), genesis.hash());
        assert_eq!(full[2].hash(), m2.hash());
    }

    #[test]
    fn get_mutation_id_reads_local_commit_or_falls_back_to_snapshot() {
        let memdag = new_memdag();
        let genesis = Commit::from_chunk(genesis_snapshot(&memdag)).unwrap();
        let client = ClientId::new();
        let m1 = local_commit(&memdag, &genesis, client, 1);
        assert_eq!(get_mutation_id(client, m1.hash(), &memdag).unwrap(), 1);
        assert_eq!(get_mutation_id(client, genesis.hash(), &memdag).unwrap(), 0);
    }

    #[test]
    fn local_mutations_greater_than_filters_by_floor() {
        let memdag = new_memdag();
        let genesis = Commit::from_chunk(genesis_snapshot(&memdag)).unwrap();
        let client = ClientId::new();
        let m1 = local_commit(&memdag, &genesis, client, 1);
        let m2 = local_commit(&memdag, &m1, client, 2);
        let mut floor = MutationIdMap::new();
        floor.set(client, 1);
        let above = local_mutations_greater_than(m2.hash(), &floor, &memdag).unwrap();
        assert_eq!(above.len(), 1);
        assert_eq!(above[0].hash(), m2.hash());
    }

    #[test]
    fn commit_refs_include_basis_value_and_indexes() {
        let value_hash = Hash::of(b"v");
        let index_hash = Hash::of(b"i");
        let basis = Hash::of(b"basis");
        let data = CommitData::Snapshot {
            basis_hash: Some(basis.clone()),
            last_mutation_ids: MutationIdMap::new(),
            cookie: JsonValue::Null,
            value_hash: value_hash.clone(),
            indexes: vec![IndexRecord {
                definition: IndexDefinition {
                    name: "by_x".into(),
                    json_pointer: "/x".into(),
                    key_prefix: String::new(),
                    allow_empty: false,
                },
                value_hash: index_hash.clone(),
            }],
        };
        let refs = Commit::refs_for(&data);
        assert!(refs.contains(&value_hash));
        assert!(refs.contains(&index_hash));
        assert!(refs.contains(&basis));
    }
}
