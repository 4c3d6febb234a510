//! The seam between the tree algorithms and the chunk store they run
//! over. In production this is always a [`tidepool_concurrency::Memdag`]
//! (spec.md: "BTreeWrite ... built over a memdag write transaction"),
//! but tests can stand up a bare perdag-backed store too.

use tidepool_concurrency::Memdag;
use tidepool_core::{Chunk, Hash, JsonValue, Result};

use crate::node::Node;

/// What the B+Tree needs from its backing store: fetch nodes by hash,
/// mint new ones.
pub trait NodeStore {
    /// Fetches a chunk, failing with [`tidepool_core::Error::ChunkNotFound`]
    /// if absent.
    fn get_chunk(&self, hash: &Hash) -> Result<Chunk>;

    /// Mints a new node chunk, owned by this store until persisted.
    fn put_node(&self, node: &Node) -> Chunk;

    /// Fetches and deserializes a node by hash.
    fn get_node(&self, hash: &Hash) -> Result<Node> {
        Node::from_chunk(&self.get_chunk(hash)?)
    }
}

impl NodeStore for Memdag {
    fn get_chunk(&self, hash: &Hash) -> Result<Chunk> {
        self.must_get_chunk(hash)
    }

    fn put_node(&self, node: &Node) -> Chunk {
        self.put_temp_chunk(node.to_json(), child_refs(node))
    }
}

fn child_refs(node: &Node) -> Vec<Hash> {
    if node.level == 0 {
        Vec::new()
    } else {
        node.entries
            .iter()
            .filter_map(|e| e.value.as_child().cloned())
            .collect()
    }
}

/// Builds (and, for leaves, owns) the canonical empty-tree root: a
/// level-0 node with no entries.
pub fn empty_root(store: &impl NodeStore) -> Hash {
    store.put_node(&Node::empty_leaf()).hash().clone()
}

/// JSON passthrough helper shared by read and write paths: the value
/// type stored at tree leaves.
pub type Value = JsonValue;
