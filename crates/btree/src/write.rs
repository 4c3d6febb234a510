//! Write API over a B+Tree root (spec.md §4.2 "Write API").
//!
//! Every `put`/`del` rewrites its path copy-on-write immediately rather
//! than deferring to an explicit mutable-builder phase that `flush`
//! later commits; since nothing can observe the tree between two calls
//! on the same [`BTreeWrite`], this is behaviorally equivalent to the
//! deferred-builder design the spec describes and `flush` is a cheap
//! accessor for the current root. See DESIGN.md.

use crate::node::{Entry, Node};
use crate::read::child_index;
use crate::store::NodeStore;
use tidepool_core::limits::{CHUNK_HEADER_SIZE, MAX_SIZE, MIN_SIZE};
use tidepool_core::{Hash, JsonValue, Result};

/// A mutable handle on one tree, rooted at `root`. `put`/`del` update
/// `root` in place; `flush` returns it.
pub struct BTreeWrite<'a, S: NodeStore> {
    store: &'a S,
    root: Hash,
}

impl<'a, S: NodeStore> BTreeWrite<'a, S> {
    /// Opens a write view starting from `root`.
    pub fn new(store: &'a S, root: Hash) -> Self {
        Self { store, root }
    }

    /// The current root hash (reflects every `put`/`del` applied so
    /// far).
    pub fn root(&self) -> &Hash {
        &self.root
    }

    /// Inserts or overwrites `key`.
    pub fn put(&mut self, key: &str, value: JsonValue) -> Result<()> {
        let node = self.store.get_node(&self.root)?;
        let replacement = put_in_subtree(self.store, node, key, value)?;
        self.root = finalize(self.store, replacement)?;
        Ok(())
    }

    /// Removes `key`, returning whether it was present.
    pub fn del(&mut self, key: &str) -> Result<bool> {
        let node = self.store.get_node(&self.root)?;
        let (found, replacement) = del_in_subtree(self.store, node, key)?;
        if found {
            self.root = finalize(self.store, replacement)?;
        }
        Ok(found)
    }

    /// Empties the tree.
    pub fn clear(&mut self) {
        self.root = crate::store::empty_root(self.store);
    }

    /// Returns the current root hash. A no-op beyond that (see module
    /// docs): every mutation is already durable in the memdag's temp
    /// chunks by the time `put`/`del` return.
    pub fn flush(&mut self) -> Result<Hash> {
        Ok(self.root.clone())
    }
}

/// Writes `entries` as one or more same-level node chunks (splitting if
/// they don't fit in [`MAX_SIZE`]), returning the parent-facing entries
/// that reference them — i.e. `{key: child.max_key(), value:
/// Child(child.hash())}` for each resulting chunk.
fn write_level(store: &impl NodeStore, level: u32, entries: Vec<Entry>) -> Vec<Entry> {
    let total = CHUNK_HEADER_SIZE + entries.iter().map(Entry::size).sum::<usize>();
    let chunks: Vec<Vec<Entry>> = if total <= MAX_SIZE || entries.len() <= 1 {
        vec![entries]
    } else {
        partition(entries)
    };
    chunks
        .into_iter()
        .map(|chunk_entries| {
            let node = Node {
                level,
                entries: chunk_entries,
            };
            let key = node.max_key().to_string();
            let hash = store.put_node(&node).hash().clone();
            Entry::child(key, hash)
        })
        .collect()
}

/// spec.md §4.2's partition algorithm: walk left to right, emit a
/// partition as soon as it reaches [`MIN_SIZE`], emit a singleton
/// whenever one entry alone is `>= MAX_SIZE`; merge a leftover
/// under-min tail into the preceding partition when it still fits,
/// else let it stand alone.
fn partition(entries: Vec<Entry>) -> Vec<Vec<Entry>> {
    let mut partitions: Vec<Vec<Entry>> = Vec::new();
    let mut current: Vec<Entry> = Vec::new();
    let mut current_size = CHUNK_HEADER_SIZE;

    for entry in entries {
        if CHUNK_HEADER_SIZE + entry.size() >= MAX_SIZE {
            if !current.is_empty() {
                partitions.push(std::mem::take(&mut current));
                current_size = CHUNK_HEADER_SIZE;
            }
            partitions.push(vec![entry]);
            continue;
        }
        current_size += entry.size();
        current.push(entry);
        if current_size >= MIN_SIZE {
            partitions.push(std::mem::take(&mut current));
            current_size = CHUNK_HEADER_SIZE;
        }
    }

    if !current.is_empty() {
        let leftover_size: usize = CHUNK_HEADER_SIZE + current.iter().map(Entry::size).sum::<usize>();
        match partitions.last_mut() {
            Some(last) if last.iter().map(Entry::size).sum::<usize>() + leftover_size - CHUNK_HEADER_SIZE
                <= MAX_SIZE =>
            {
                last.extend(current);
            }
            _ => partitions.push(current),
        }
    }

    if partitions.is_empty() {
        partitions.push(Vec::new());
    }
    partitions
}

/// Applies `put` within the subtree rooted at `node`, returning the
/// parent-facing entries that replace it (see [`write_level`]).
fn put_in_subtree(
    store: &impl NodeStore,
    node: Node,
    key: &str,
    value: JsonValue,
) -> Result<Vec<Entry>> {
    let level = node.level;
    if level == 0 {
        let mut entries = node.entries;
        let idx = crate::binary_search::binary_search(entries.len(), |i| entries[i].key.as_str() >= key);
        let new_entry = Entry::data(key, value);
        match entries.get(idx) {
            Some(e) if e.key == key => entries[idx] = new_entry,
            _ => entries.insert(idx, new_entry),
        }
        return Ok(write_level(store, 0, entries));
    }

    let mut entries = node.entries;
    let idx = child_index(&entries, key);
    let child_hash = entries[idx]
        .value
        .as_child()
        .expect("internal entries always point at a child")
        .clone();
    let child = store.get_node(&child_hash)?;
    let child_replacement = put_in_subtree(store, child, key, value)?;
    splice(&mut entries, idx, child_replacement);
    Ok(write_level(store, level, entries))
}

/// Applies `del` within the subtree rooted at `node`. Returns whether
/// `key` was found and, if so, the parent-facing entries that replace
/// this node (possibly empty, meaning the caller should drop this
/// child entirely).
fn del_in_subtree(store: &impl NodeStore, node: Node, key: &str) -> Result<(bool, Vec<Entry>)> {
    let level = node.level;
    if level == 0 {
        let mut entries = node.entries;
        let idx = crate::binary_search::binary_search(entries.len(), |i| entries[i].key.as_str() >= key);
        if entries.get(idx).map(|e| e.key.as_str()) != Some(key) {
            return Ok((false, write_level(store, 0, entries)));
        }
        entries.remove(idx);
        if entries.is_empty() {
            return Ok((true, Vec::new()));
        }
        return Ok((true, write_level(store, 0, entries)));
    }

    let mut entries = node.entries;
    let idx = child_index(&entries, key);
    let child_hash = entries[idx]
        .value
        .as_child()
        .expect("internal entries always point at a child")
        .clone();
    let child = store.get_node(&child_hash)?;
    let (found, child_replacement) = del_in_subtree(store, child, key)?;
    if !found {
        return Ok((false, write_level(store, level, entries)));
    }
    rebalance_underfull_child(store, &mut entries, idx, child_replacement)?;
    if entries.is_empty() {
        return Ok((true, Vec::new()));
    }
    Ok((true, write_level(store, level, entries)))
}

fn splice(entries: &mut Vec<Entry>, idx: usize, replacement: Vec<Entry>) {
    entries.splice(idx..=idx, replacement);
}

/// Splices a child's post-`del` replacement entries into its parent's
/// `entries` at `idx`, folding the child into an adjacent sibling when
/// the replacement has shrunk below [`MIN_SIZE`] on its own (spec.md
/// §4.2: "splits and merges honor minSize/maxSize"; the partition
/// algorithm walks a sibling-merged sequence). A replacement that
/// vanished entirely or that already split into multiple chunks needs
/// no merge check — those can't be underfull by construction.
fn rebalance_underfull_child(
    store: &impl NodeStore,
    entries: &mut Vec<Entry>,
    idx: usize,
    replacement: Vec<Entry>,
) -> Result<()> {
    if replacement.len() != 1 {
        splice(entries, idx, replacement);
        return Ok(());
    }
    let child_hash = replacement[0]
        .value
        .as_child()
        .expect("write_level always returns child-pointing entries");
    let child_node = store.get_node(child_hash)?;
    if child_node.total_size() >= MIN_SIZE {
        splice(entries, idx, replacement);
        return Ok(());
    }

    let sibling_idx = if idx + 1 < entries.len() {
        idx + 1
    } else if idx > 0 {
        idx - 1
    } else {
        splice(entries, idx, replacement);
        return Ok(());
    };
    let sibling_hash = entries[sibling_idx]
        .value
        .as_child()
        .expect("internal entries always point at a child")
        .clone();
    let sibling_node = store.get_node(&sibling_hash)?;

    let combined = if sibling_idx < idx {
        let mut merged = sibling_node.entries;
        merged.extend(child_node.entries);
        merged
    } else {
        let mut merged = child_node.entries;
        merged.extend(sibling_node.entries);
        merged
    };
    let rewritten = write_level(store, child_node.level, combined);
    let (lo, hi) = if sibling_idx < idx {
        (sibling_idx, idx)
    } else {
        (idx, sibling_idx)
    };
    entries.splice(lo..=hi, rewritten);
    Ok(())
}

/// Turns the parent-facing entries returned for the root subtree back
/// into a single root hash, applying the root-degeneracy rule (spec.md
/// §4.2): collapse any chain of single-child internal nodes down to
/// their ultimate child, and fall back to the empty leaf if nothing is
/// left.
fn finalize(store: &impl NodeStore, mut entries: Vec<Entry>) -> Result<Hash> {
    if entries.is_empty() {
        return Ok(crate::store::empty_root(store));
    }
    if entries.len() > 1 {
        // The root split; wrap the returned entries in a fresh level
        // above whatever level they reference.
        let wrapped = write_level(store, implied_parent_level(store, &entries)?, entries);
        entries = wrapped;
    }
    let mut hash = entries[0]
        .value
        .as_child()
        .expect("write_level always returns child-pointing entries")
        .clone();
    loop {
        let node = store.get_node(&hash)?;
        if node.level > 0 && node.entries.len() == 1 {
            hash = node.entries[0]
                .value
                .as_child()
                .expect("internal entries always point at a child")
                .clone();
        } else {
            break;
        }
    }
    Ok(hash)
}

fn implied_parent_level(store: &impl NodeStore, entries: &[Entry]) -> Result<u32> {
    let child_hash = entries[0]
        .value
        .as_child()
        .expect("write_level always returns child-pointing entries");
    Ok(store.get_node(child_hash)?.level + 1)
}
