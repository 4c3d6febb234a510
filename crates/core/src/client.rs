//! Client and client-group identifiers, and the registry records
//! persisted under the `clients` / `client-groups` perdag heads
//! (spec.md §4.8, C11).

use crate::commit::MutationIdMap;
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifies a single tab/process's replica of the database.
///
/// Each [`ClientId`] has its own heartbeat and main head pointer but
/// shares mutator/index definitions and server-acknowledged mutation
/// state with the other clients in its [`ClientGroupId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

/// Identifies a set of clients sharing mutator/index definitions — the
/// unit of server-side push/pull state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientGroupId(Uuid);

macro_rules! uuid_id {
    ($ty:ident) => {
        impl $ty {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parses an identifier from its string form.
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(ClientId);
uuid_id!(ClientGroupId);

/// A client's monotonically increasing per-client mutation counter.
///
/// Mutation ids start at 1 for a client's first mutation and strictly
/// increase along any chain from a snapshot to the head (see §3 invariants
/// in spec.md).
pub type MutationId = u64;

/// One client's registry entry, persisted in the `clients` head's
/// `ClientMap` (spec.md §4.8, §6 "Persisted state layout").
///
/// `head_hash` and `temp_refresh_hash` are exactly the hashes the
/// `clients` chunk's own `refs` must include to keep this client's
/// subtree alive — see [`ClientMap::referenced_hashes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    /// The group this client shares mutator/index definitions with.
    pub client_group_id: ClientGroupId,
    /// The commit this client's `main` head currently points at.
    pub head_hash: Hash,
    /// Set to the client group's perdag head while a [`refresh`] is in
    /// flight, so GC can't collect it mid-refresh; cleared on completion.
    ///
    /// [`refresh`]: https://docs.rs/tidepool-durability (crate::refresh)
    pub temp_refresh_hash: Option<Hash>,
    /// Last time this client reported itself alive, in epoch
    /// milliseconds (spec.md §4.8 "heartbeats").
    pub heartbeat_timestamp_ms: i64,
}

/// A client group's registry entry, persisted in the `client-groups`
/// head's `ClientGroupMap` (DD31; spec.md §4.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientGroupRecord {
    /// The group's shared commit chain head in the perdag.
    pub head_hash: Hash,
    /// Per-client mutation ids reflected by `head_hash`'s chain.
    pub mutation_ids: MutationIdMap,
    /// Per-client mutation ids the server has acknowledged, as of
    /// `head_hash`'s base snapshot.
    pub last_server_ackd_mutation_ids: MutationIdMap,
    /// Registered mutator names as of this group's creation, sorted —
    /// compared against a candidate client's own registry by
    /// [`crate::mutator::MutatorRegistry::names`] to decide `initClient`'s
    /// `HEAD` vs. `FORK` outcome.
    pub mutator_names: Vec<String>,
    /// Secondary index definitions as of this group's creation, for the
    /// same compatibility check.
    pub index_definitions: Vec<crate::commit::IndexDefinition>,
    /// Set once the server has rejected this group outright
    /// (spec.md §8 S6, `ClientStateNotFound` on push). A disabled group
    /// rejects further pushes locally without a round trip.
    pub disabled: bool,
}

macro_rules! id_keyed_map {
    ($name:ident, $key:ty, $value:ty) => {
        /// Stringly-keyed wire representation of a map keyed by an id
        /// type, mirroring [`MutationIdMap`]'s approach: JSON object keys
        /// must be strings, so the typed key round-trips through
        /// `Display`/`parse` at the serde boundary.
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name(BTreeMap<$key, $value>);

        impl $name {
            /// An empty map.
            pub fn new() -> Self {
                Self::default()
            }

            /// Looks up an entry.
            pub fn get(&self, id: $key) -> Option<&$value> {
                self.0.get(&id)
            }

            /// Inserts or replaces an entry.
            pub fn insert(&mut self, id: $key, value: $value) {
                self.0.insert(id, value);
            }

            /// Removes an entry, returning it if present.
            pub fn remove(&mut self, id: &$key) -> Option<$value> {
                self.0.remove(id)
            }

            /// Iterates over `(id, value)` pairs.
            pub fn iter(&self) -> impl Iterator<Item = (&$key, &$value)> {
                self.0.iter()
            }

            /// True if no entries.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            /// Number of entries.
            pub fn len(&self) -> usize {
                self.0.len()
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                let stringly: BTreeMap<String, &$value> =
                    self.0.iter().map(|(k, v)| (k.to_string(), v)).collect();
                stringly.serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let stringly = BTreeMap::<String, $value>::deserialize(deserializer)?;
                let mut map = BTreeMap::new();
                for (k, v) in stringly {
                    let id = <$key>::parse(&k).ok_or_else(|| {
                        serde::de::Error::custom(format!("invalid id {k:?}"))
                    })?;
                    map.insert(id, v);
                }
                Ok(Self(map))
            }
        }
    };
}

id_keyed_map!(ClientMap, ClientId, ClientRecord);
id_keyed_map!(ClientGroupMap, ClientGroupId, ClientGroupRecord);

impl ClientMap {
    /// The exact set of hashes a `clients` chunk's `refs` must carry to
    /// keep every client's subtree alive: each entry's `head_hash`, plus
    /// its `temp_refresh_hash` when set (spec.md §4.8).
    pub fn referenced_hashes(&self) -> Vec<Hash> {
        let mut out = Vec::with_capacity(self.0.len());
        for record in self.0.values() {
            out.push(record.head_hash.clone());
            if let Some(h) = &record.temp_refresh_hash {
                out.push(h.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;

    fn record(head: Hash) -> ClientRecord {
        ClientRecord {
            client_group_id: ClientGroupId::new(),
            head_hash: head,
            temp_refresh_hash: None,
            heartbeat_timestamp_ms: 0,
        }
    }

    #[test]
    fn client_map_roundtrips_through_json() {
        let mut map = ClientMap::new();
        let client = ClientId::new();
        map.insert(client, record(Hash::of(b"x")));
        let json = serde_json::to_value(&map).unwrap();
        let back: ClientMap = serde_json::from_value(json).unwrap();
        assert_eq!(back.get(client), map.get(client));
    }

    #[test]
    fn referenced_hashes_includes_temp_refresh_hash_when_set() {
        let mut map = ClientMap::new();
        let head = Hash::of(b"head");
        let refreshing = Hash::of(b"refreshing");
        map.insert(
            ClientId::new(),
            ClientRecord {
                client_group_id: ClientGroupId::new(),
                head_hash: head.clone(),
                temp_refresh_hash: Some(refreshing.clone()),
                heartbeat_timestamp_ms: 0,
            },
        );
        let refs = map.referenced_hashes();
        assert!(refs.contains(&head));
        assert!(refs.contains(&refreshing));
    }
}
