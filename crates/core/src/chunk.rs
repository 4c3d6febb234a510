//! Immutable content-addressed chunks — the storage unit of the DAG.

use crate::hash::Hash;
use crate::json::JsonValue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An immutable `(hash, data, refs)` triple.
///
/// `refs` must be exactly the set of other chunks referenced by `data`;
/// refcounting in the perdag depends on this invariant holding on every
/// `putChunk` call. Chunks are cheap to clone (the payload is behind an
/// `Arc`) since both the perdag and memdag pass them around freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    hash: Hash,
    data: Arc<JsonValue>,
    refs: Arc<[Hash]>,
}

impl Chunk {
    /// Builds a chunk whose hash is the content hash of `data`'s
    /// canonical serialization. Use this for chunks that will be written
    /// to the perdag.
    pub fn new_content_addressed(data: JsonValue, refs: Vec<Hash>) -> Self {
        let bytes = serde_json::to_vec(&data).expect("JsonValue always serializes");
        let hash = Hash::of(&bytes);
        Self {
            hash,
            data: Arc::new(data),
            refs: refs.into(),
        }
    }

    /// Builds a chunk under an explicit (typically temp) hash. Used by the
    /// memdag, which mints a fresh [`Hash::new_uuid`] for every chunk it
    /// owns rather than hashing content.
    pub fn new_with_hash(hash: Hash, data: JsonValue, refs: Vec<Hash>) -> Self {
        Self {
            hash,
            data: Arc::new(data),
            refs: refs.into(),
        }
    }

    /// The chunk's content address.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// The chunk's payload.
    pub fn data(&self) -> &JsonValue {
        &self.data
    }

    /// The hashes of chunks this chunk references.
    pub fn refs(&self) -> &[Hash] {
        &self.refs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_addressed_chunks_with_equal_data_hash_equal() {
        let a = Chunk::new_content_addressed(json!({"x": 1}), vec![]);
        let b = Chunk::new_content_addressed(json!({"x": 1}), vec![]);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn refs_are_preserved() {
        let child = Hash::of(b"child");
        let c = Chunk::new_content_addressed(json!({"x": 1}), vec![child.clone()]);
        assert_eq!(c.refs(), &[child]);
    }
}
