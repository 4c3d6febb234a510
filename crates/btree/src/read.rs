//! Read API over a B+Tree root (spec.md §4.2 "Read API").
//!
//! A [`BTreeRead`] is handed an explicit root hash rather than a live
//! pointer to one, so the §4.2 "restart on concurrent flush" rule does
//! not apply here: there is no mutable root to race with, since every
//! reader already operates against a snapshot hash it was given (see
//! DESIGN.md).

use crate::binary_search::binary_search;
use crate::node::{EntryValue, Node};
use crate::store::NodeStore;
use tidepool_core::{Hash, JsonValue, Result};

/// A read-only view of the tree rooted at a given hash.
pub struct BTreeRead<'a, S: NodeStore> {
    store: &'a S,
    root: Hash,
}

impl<'a, S: NodeStore> BTreeRead<'a, S> {
    /// Opens a read view of the tree rooted at `root`.
    pub fn new(store: &'a S, root: Hash) -> Self {
        Self { store, root }
    }

    /// This view's root hash.
    pub fn root(&self) -> &Hash {
        &self.root
    }

    /// Descends to the leaf that would contain `key`, returning its
    /// entries.
    fn find_leaf(&self, key: &str) -> Result<Node> {
        let mut node = self.store.get_node(&self.root)?;
        while node.level > 0 {
            let idx = child_index(&node.entries, key);
            let child_hash = node.entries[idx]
                .value
                .as_child()
                .expect("internal entries always point at a child")
                .clone();
            node = self.store.get_node(&child_hash)?;
        }
        Ok(node)
    }

    /// Looks up `key`'s current value.
    pub fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        let leaf = self.find_leaf(key)?;
        let idx = binary_search(leaf.entries.len(), |i| leaf.entries[i].key.as_str() >= key);
        match leaf.entries.get(idx) {
            Some(e) if e.key == key => Ok(e.value.as_data().cloned()),
            _ => Ok(None),
        }
    }

    /// True if `key` is present.
    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// True if the tree has no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.store.get_node(&self.root)?.entries.is_empty())
    }

    /// Collects every `(key, value)` pair with `key >= from_key`, in
    /// UTF-8 key order.
    ///
    /// Materialized eagerly into a `Vec` rather than returned as a lazy
    /// generator (spec.md describes an "async sequence"); see
    /// DESIGN.md for why that simplification is sound here.
    pub fn scan(&self, from_key: &str) -> Result<Vec<(String, JsonValue)>> {
        let mut out = Vec::new();
        self.scan_node(&self.root, from_key, &mut out)?;
        Ok(out)
    }

    fn scan_node(&self, hash: &Hash, from_key: &str, out: &mut Vec<(String, JsonValue)>) -> Result<()> {
        let node = self.store.get_node(hash)?;
        if node.level == 0 {
            for e in &node.entries {
                if e.key.as_str() >= from_key {
                    out.push((e.key.clone(), e.value.as_data().cloned().expect("leaf entry")));
                }
            }
            return Ok(());
        }
        // A child's key is its max_key(); skip children whose max_key is
        // strictly before `from_key`, since every key they hold precedes it.
        let start = binary_search(node.entries.len(), |i| node.entries[i].key.as_str() >= from_key);
        for entry in &node.entries[start..] {
            if let EntryValue::Child(child) = &entry.value {
                self.scan_node(child, from_key, out)?;
            }
        }
        Ok(())
    }
}

/// The index of the child entry that would lead to `key`: the first
/// entry whose key is `>= key`, or the last entry if `key` exceeds
/// every child's `max_key()`.
pub(crate) fn child_index(entries: &[crate::node::Entry], key: &str) -> usize {
    let idx = binary_search(entries.len(), |i| entries[i].key.as_str() >= key);
    idx.min(entries.len() - 1)
}
