//! B+Tree node chunk format (spec.md §3 "B+Tree node", C5).
//!
//! A node is stored as one [`Chunk`] whose data is `[level, entries]`.
//! Level 0 entries carry a user value directly; level > 0 entries carry
//! the hash of a child node, keyed by that child's `max_key()`. Entries
//! are always sorted by UTF-8 byte order of their key.

use serde::{Deserialize, Serialize};
use tidepool_core::{json::encoded_size, Chunk, Error, Hash, JsonValue, Result};

/// What an entry points at: a user value (level 0) or a child node
/// (level > 0).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryValue {
    /// A leaf entry's user-supplied value.
    Data(JsonValue),
    /// An internal entry's child hash.
    Child(Hash),
}

impl EntryValue {
    /// The child hash, if this is an internal entry.
    pub fn as_child(&self) -> Option<&Hash> {
        match self {
            EntryValue::Child(h) => Some(h),
            EntryValue::Data(_) => None,
        }
    }

    /// The data value, if this is a leaf entry.
    pub fn as_data(&self) -> Option<&JsonValue> {
        match self {
            EntryValue::Data(v) => Some(v),
            EntryValue::Child(_) => None,
        }
    }
}

/// One `(key, value)` pair of a node, with its serialized size cached
/// at construction time (spec.md: "each entry carries a cached
/// serialized-size").
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The entry's key (a user key for leaves, a child's `max_key()`
    /// for internal entries).
    pub key: String,
    /// The entry's payload.
    pub value: EntryValue,
    size: usize,
}

impl Entry {
    /// Builds a leaf entry holding a user value.
    pub fn data(key: impl Into<String>, value: JsonValue) -> Self {
        let key = key.into();
        let size = encoded_size(&key) + encoded_size(&value);
        Self {
            key,
            value: EntryValue::Data(value),
            size,
        }
    }

    /// Builds an internal entry pointing at a child node.
    pub fn child(key: impl Into<String>, child: Hash) -> Self {
        let key = key.into();
        let size = encoded_size(&key) + tidepool_core::hash::HASH_LEN;
        Self {
            key,
            value: EntryValue::Child(child),
            size,
        }
    }

    /// This entry's cached serialized size, in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// One level of the tree, as stored in a single chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// 0 for a data (leaf) node, > 0 for an internal node.
    pub level: u32,
    /// This node's entries, sorted by key.
    pub entries: Vec<Entry>,
}

impl Node {
    /// The canonical empty data node used for an empty tree.
    pub fn empty_leaf() -> Self {
        Self {
            level: 0,
            entries: Vec::new(),
        }
    }

    /// The key of this node's rightmost entry — what a parent entry
    /// pointing at this node is keyed by. Panics on an empty node;
    /// only the (unique) empty root may have no entries, and it is
    /// never itself referenced by a parent entry.
    pub fn max_key(&self) -> &str {
        &self
            .entries
            .last()
            .expect("only the empty root has no entries")
            .key
    }

    /// Sum of this node's entries' cached sizes, excluding the chunk
    /// header (spec.md limits).
    pub fn entries_size(&self) -> usize {
        self.entries.iter().map(Entry::size).sum()
    }

    /// Total serialized size including [`tidepool_core::limits::CHUNK_HEADER_SIZE`].
    pub fn total_size(&self) -> usize {
        tidepool_core::limits::CHUNK_HEADER_SIZE + self.entries_size()
    }

    /// Serializes this node to the JSON payload a [`Chunk`] carries.
    pub fn to_json(&self) -> JsonValue {
        let entries: Vec<JsonValue> = self
            .entries
            .iter()
            .map(|e| serde_json::json!([e.key, e.value]))
            .collect();
        serde_json::json!([self.level, entries])
    }

    /// Deserializes a node from a chunk's data, recomputing cached
    /// sizes.
    pub fn from_chunk(chunk: &Chunk) -> Result<Self> {
        Self::from_json(chunk.data())
    }

    /// Deserializes a node directly from its JSON form.
    pub fn from_json(data: &JsonValue) -> Result<Self> {
        let arr = data
            .as_array()
            .filter(|a| a.len() == 2)
            .ok_or_else(|| Error::Corrupt("btree node is not a 2-element array".into()))?;
        let level = arr[0]
            .as_u64()
            .ok_or_else(|| Error::Corrupt("btree node level is not a number".into()))?
            as u32;
        let raw_entries = arr[1]
            .as_array()
            .ok_or_else(|| Error::Corrupt("btree node entries is not an array".into()))?;
        let mut entries = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            let pair = raw
                .as_array()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| Error::Corrupt("btree entry is not a 2-element array".into()))?;
            let key = pair[0]
                .as_str()
                .ok_or_else(|| Error::Corrupt("btree entry key is not a string".into()))?
                .to_string();
            if level == 0 {
                entries.push(Entry::data(key, pair[1].clone()));
            } else {
                let hash_str = pair[1]
                    .as_str()
                    .ok_or_else(|| Error::Corrupt("btree entry child is not a string".into()))?;
                let hash = Hash::parse(hash_str)
                    .map_err(|e| Error::Corrupt(format!("btree entry child hash: {e}")))?;
                entries.push(Entry::child(key, hash));
            }
        }
        Ok(Self { level, entries })
    }
}
