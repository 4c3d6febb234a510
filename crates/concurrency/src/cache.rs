//! Bounded source-chunk cache for the memdag (spec.md §4.1).
//!
//! Insertion-order LRU: the oldest *inserted* entry is evicted first,
//! not the least-recently-*read* one — matching the spec text exactly
//! ("bounded source-chunk cache (default 100 MiB, LRU by insertion
//! order)").

use std::collections::{HashMap, VecDeque};
use tidepool_core::{Chunk, Hash};

pub(crate) struct SourceCache {
    order: VecDeque<Hash>,
    entries: HashMap<Hash, (Chunk, u64)>,
    total_bytes: u64,
    limit_bytes: u64,
    suspend_depth: u32,
}

impl SourceCache {
    pub(crate) fn new(limit_bytes: u64) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            total_bytes: 0,
            limit_bytes,
            suspend_depth: 0,
        }
    }

    pub(crate) fn get(&self, hash: &Hash) -> Option<Chunk> {
        self.entries.get(hash).map(|(c, _)| c.clone())
    }

    pub(crate) fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Inserts a chunk fetched from the source, evicting the oldest
    /// entries if the cache is over budget (unless evictions are
    /// currently suspended).
    pub(crate) fn insert(&mut self, hash: Hash, chunk: Chunk, size: u64) {
        if self.entries.contains_key(&hash) {
            return;
        }
        self.entries.insert(hash.clone(), (chunk, size));
        self.order.push_back(hash);
        self.total_bytes += size;
        if self.suspend_depth == 0 {
            self.evict_to_limit();
        }
    }

    /// Removes an entry outright (used when a chunk that was cached
    /// from the source gets superseded, e.g. never needed in practice
    /// here but kept symmetric with `chunksPersisted`'s "delete" half).
    pub(crate) fn remove(&mut self, hash: &Hash) {
        if self.entries.remove(hash).is_some() {
            self.order.retain(|h| h != hash);
        }
    }

    fn evict_to_limit(&mut self) {
        while self.total_bytes > self.limit_bytes {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some((_, size)) = self.entries.remove(&oldest) {
                self.total_bytes = self.total_bytes.saturating_sub(size);
            }
        }
    }

    pub(crate) fn suspend_evicts(&mut self) {
        self.suspend_depth += 1;
    }

    pub(crate) fn resume_evicts(&mut self) {
        self.suspend_depth = self.suspend_depth.saturating_sub(1);
        if self.suspend_depth == 0 {
            self.evict_to_limit();
        }
    }

    #[cfg(test)]
    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(tag: &str) -> Chunk {
        Chunk::new_content_addressed(json!({"tag": tag}), vec![])
    }

    #[test]
    fn evicts_oldest_insertion_when_over_budget() {
        let mut cache = SourceCache::new(20);
        let a = chunk("a");
        let b = chunk("b");
        let c = chunk("c");
        cache.insert(a.hash().clone(), a.clone(), 10);
        cache.insert(b.hash().clone(), b.clone(), 10);
        assert!(cache.contains(a.hash()));
        cache.insert(c.hash().clone(), c.clone(), 10);
        // Inserting c pushes total to 30 > 20, so the oldest (a) is evicted.
        assert!(!cache.contains(a.hash()));
        assert!(cache.contains(b.hash()));
        assert!(cache.contains(c.hash()));
    }

    #[test]
    fn suspended_evicts_are_deferred() {
        let mut cache = SourceCache::new(10);
        let a = chunk("a");
        let b = chunk("b");
        cache.suspend_evicts();
        cache.insert(a.hash().clone(), a.clone(), 10);
        cache.insert(b.hash().clone(), b.clone(), 10);
        assert_eq!(cache.total_bytes(), 20);
        assert!(cache.contains(a.hash()));
        cache.resume_evicts();
        assert!(cache.total_bytes() <= 10);
    }
}
