//! Commit chain data model (DD31).
//!
//! spec.md §9 Open Question 1 resolves the SDD/DD31 split in the original
//! source in favor of DD31 as the sole, forward commit shape; legacy SDD
//! commits (scalar `lastMutationID`, a standalone `IndexChangeCommit`
//! variant) are not modeled here — see DESIGN.md.

use crate::client::{ClientId, MutationId};
use crate::hash::Hash;
use crate::json::JsonValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-client last-acknowledged-mutation-id map, as carried by a snapshot
/// commit.
///
/// Wraps a `BTreeMap<ClientId, MutationId>` with an explicit
/// string-keyed wire representation, since the map is itself stored
/// inside a JSON chunk payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationIdMap(BTreeMap<ClientId, MutationId>);

impl MutationIdMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a client's recorded mutation id, defaulting to 0.
    pub fn get(&self, client_id: ClientId) -> MutationId {
        self.0.get(&client_id).copied().unwrap_or(0)
    }

    /// Sets a client's mutation id.
    pub fn set(&mut self, client_id: ClientId, mutation_id: MutationId) {
        self.0.insert(client_id, mutation_id);
    }

    /// Iterates over `(client, mutation_id)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ClientId, MutationId)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }

    /// True if every client in `self` has a mutation id `<=` the
    /// corresponding entry in `other` (used when comparing ancestor
    /// snapshots along a chain).
    pub fn le_all(&self, other: &MutationIdMap) -> bool {
        self.0.iter().all(|(c, mid)| *mid <= other.get(*c))
    }
}

impl FromIterator<(ClientId, MutationId)> for MutationIdMap {
    fn from_iter<T: IntoIterator<Item = (ClientId, MutationId)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for MutationIdMap {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let stringly: BTreeMap<String, MutationId> =
            self.0.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        stringly.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MutationIdMap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let stringly = BTreeMap::<String, MutationId>::deserialize(deserializer)?;
        let mut map = BTreeMap::new();
        for (k, v) in stringly {
            let client_id = ClientId::parse(&k)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid client id {k:?}")))?;
            map.insert(client_id, v);
        }
        Ok(Self(map))
    }
}

/// Definition of a secondary index (shared by every client in a client
/// group; see [`crate::client::ClientGroupId`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Application-chosen index name.
    pub name: String,
    /// JSON Pointer into each value used to derive the secondary key.
    pub json_pointer: String,
    /// Restrict indexing to primary keys with this prefix, or index
    /// everything if empty.
    pub key_prefix: String,
    /// If false, values missing the pointer path are skipped rather than
    /// causing an error.
    pub allow_empty: bool,
}

/// A secondary index's root as attached to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// The index's definition.
    pub definition: IndexDefinition,
    /// Root hash of the index's B+Tree (keyed by
    /// `(encodedIndexKey, primaryKey)`).
    pub value_hash: Hash,
}

/// The data carried by a commit chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CommitData {
    /// Establishes a new base state: a server cookie plus the
    /// per-client mutation ids it acknowledges.
    Snapshot {
        /// Hash of the basis commit, or `None` for the very first
        /// snapshot (the genesis commit).
        basis_hash: Option<Hash>,
        /// Mutation ids acknowledged as of this snapshot, per client.
        last_mutation_ids: MutationIdMap,
        /// Opaque, application-defined cookie identifying the server's
        /// view. Ordered via a [`crate::cookie::CookieOrder`].
        cookie: JsonValue,
        /// Root hash of the primary B+Tree.
        value_hash: Hash,
        /// Secondary index roots as of this snapshot.
        indexes: Vec<IndexRecord>,
    },
    /// Represents one pending local mutation.
    Local {
        /// Hash of the commit this mutation was applied on top of.
        basis_hash: Hash,
        /// Client that produced this mutation.
        client_id: ClientId,
        /// This client's mutation id for this commit
        /// (`parent.mutation_id(client_id) + 1`).
        mutation_id: MutationId,
        /// Registered mutator name.
        mutator_name: String,
        /// Arguments passed to the mutator, opaque JSON.
        mutator_args: JsonValue,
        /// If this commit was produced by rebasing another commit during
        /// pull, the hash of that original commit (diagnostics only).
        original_hash: Option<Hash>,
        /// Mutator-entry wall-clock time, in milliseconds since epoch.
        timestamp: i64,
        /// Root hash of the primary B+Tree after the mutation.
        value_hash: Hash,
        /// Secondary index roots after the mutation.
        indexes: Vec<IndexRecord>,
    },
}

impl CommitData {
    /// The hash of this commit's basis, or `None` for the genesis
    /// snapshot.
    pub fn basis_hash(&self) -> Option<&Hash> {
        match self {
            CommitData::Snapshot { basis_hash, .. } => basis_hash.as_ref(),
            CommitData::Local { basis_hash, .. } => Some(basis_hash),
        }
    }

    /// The root hash of the primary B+Tree this commit reflects.
    pub fn value_hash(&self) -> &Hash {
        match self {
            CommitData::Snapshot { value_hash, .. } => value_hash,
            CommitData::Local { value_hash, .. } => value_hash,
        }
    }

    /// The secondary index roots this commit reflects.
    pub fn indexes(&self) -> &[IndexRecord] {
        match self {
            CommitData::Snapshot { indexes, .. } => indexes,
            CommitData::Local { indexes, .. } => indexes,
        }
    }

    /// True if this is a snapshot commit.
    pub fn is_snapshot(&self) -> bool {
        matches!(self, CommitData::Snapshot { .. })
    }

    /// For a local commit on `client_id`, this commit's own mutation id;
    /// for a snapshot, the last acknowledged mutation id recorded for
    /// that client.
    pub fn mutation_id(&self, client_id: ClientId) -> MutationId {
        match self {
            CommitData::Snapshot {
                last_mutation_ids, ..
            } => last_mutation_ids.get(client_id),
            CommitData::Local {
                client_id: c,
                mutation_id,
                ..
            } => {
                if *c == client_id {
                    *mutation_id
                } else {
                    0
                }
            }
        }
    }
}
