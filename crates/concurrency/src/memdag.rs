//! The memdag (LazyStore): an in-memory overlay over a [`ChunkSource`]
//! (normally the perdag), plus the bounded source-chunk cache and the
//! in-memory head table the engine mutates between persists (spec.md
//! §4.1, C4).
//!
//! Chunks created by local mutations get temp, UUID-derived hashes and
//! live in `temp_chunks` until [`Memdag::chunks_persisted`] retires
//! them (the persist algorithm rewrites them to content hashes and
//! writes them into the perdag). Chunks fetched from the source to
//! satisfy a read are cached in a bounded, insertion-order LRU —
//! they're never temp-owned, since the perdag remains their source of
//! truth.

use crate::cache::SourceCache;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tidepool_core::{json::encoded_size, Chunk, Error, Hash, JsonValue, Result};
use tidepool_storage::ChunkSource;

/// Default bound for the source-chunk cache, matching
/// [`tidepool_core::EngineConfig::memdag_cache_bytes`]'s default.
pub const DEFAULT_CACHE_BYTES: u64 = 100 * 1024 * 1024;

/// The in-memory overlay described in spec.md §4.1 as "Memdag
/// (LazyStore)".
pub struct Memdag {
    source: Arc<dyn ChunkSource>,
    temp_chunks: DashMap<Hash, Chunk>,
    cache: Mutex<SourceCache>,
    heads: RwLock<HashMap<String, Hash>>,
}

impl Memdag {
    /// Builds a memdag over `source` with the given cache budget.
    pub fn new(source: Arc<dyn ChunkSource>, cache_bytes: u64) -> Self {
        Self {
            source,
            temp_chunks: DashMap::new(),
            cache: Mutex::new(SourceCache::new(cache_bytes)),
            heads: RwLock::new(HashMap::new()),
        }
    }

    /// `hash` names a chunk created locally and not yet persisted.
    pub fn is_mem_only_chunk_hash(&self, hash: &Hash) -> bool {
        hash.is_temp()
    }

    /// Fetches a chunk: temp-owned chunks first, then the source cache,
    /// falling back to the source (and caching the result) on a miss.
    pub fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>> {
        if let Some(entry) = self.temp_chunks.get(hash) {
            return Ok(Some(entry.clone()));
        }
        {
            let cache = self.cache.lock();
            if let Some(chunk) = cache.get(hash) {
                return Ok(Some(chunk));
            }
        }
        match self.source.get_chunk(hash)? {
            Some(chunk) => {
                let size = encoded_size(chunk.data()) + chunk.refs().len() * tidepool_core::HASH_LEN;
                self.cache.lock().insert(hash.clone(), chunk.clone(), size as u64);
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// Fetches a chunk, translating a miss into [`Error::ChunkNotFound`].
    pub fn must_get_chunk(&self, hash: &Hash) -> Result<Chunk> {
        self.get_chunk(hash)?
            .ok_or_else(|| Error::ChunkNotFound(hash.clone()))
    }

    /// Mints and stores a new temp-owned chunk, returning it.
    pub fn put_temp_chunk(&self, data: JsonValue, refs: Vec<Hash>) -> Chunk {
        let hash = Hash::new_uuid();
        let chunk = Chunk::new_with_hash(hash.clone(), data, refs);
        self.temp_chunks.insert(hash, chunk.clone());
        chunk
    }

    /// Directly seeds the source cache with an already-persisted chunk,
    /// bypassing temp ownership entirely. Used by refresh (spec.md
    /// §4.2) when pulling perdag state back into the memdag.
    pub fn warm_cache(&self, chunk: Chunk) {
        let size = encoded_size(chunk.data()) + chunk.refs().len() * tidepool_core::HASH_LEN;
        self.cache.lock().insert(chunk.hash().clone(), chunk, size as u64);
    }

    /// Runs `f` with source-cache evictions and `chunks_persisted`
    /// deletions deferred until it returns, then applies whatever was
    /// deferred. Reentrant: nested calls just bump a counter.
    ///
    /// Spec.md §4.2's refresh algorithm needs this so that chunks it is
    /// actively walking don't get evicted or deleted out from under it
    /// mid-traversal.
    pub fn with_suspended_source_cache_evicts_and_deletes<T>(&self, f: impl FnOnce() -> T) -> T {
        self.cache.lock().suspend_evicts();
        let result = f();
        self.cache.lock().resume_evicts();
        result
    }

    /// Call after a persist has durably written `hashes` to the perdag:
    /// releases their temp ownership here, since the perdag is now
    /// their source of truth.
    pub fn chunks_persisted(&self, hashes: &[Hash]) {
        for hash in hashes {
            self.temp_chunks.remove(hash);
        }
    }

    /// Number of chunks still temp-owned (test/diagnostic use).
    pub fn temp_chunk_count(&self) -> usize {
        self.temp_chunks.len()
    }

    /// Resolves a named in-memory head.
    pub fn get_head(&self, name: &str) -> Option<Hash> {
        self.heads.read().get(name).cloned()
    }

    /// Sets a named in-memory head. Unlike the perdag, the memdag keeps
    /// no refcounts — its entire state is ephemeral and reclaimed on
    /// close, so there is nothing to GC here.
    pub fn set_head(&self, name: &str, hash: Hash) {
        self.heads.write().insert(name.to_string(), hash);
    }

    /// Removes a named in-memory head.
    pub fn remove_head(&self, name: &str) -> Option<Hash> {
        self.heads.write().remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidepool_storage::{kv::MemKvStore, perdag::Perdag};

    fn new_memdag() -> (Arc<Perdag<MemKvStore>>, Memdag) {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        let memdag = Memdag::new(perdag.clone(), DEFAULT_CACHE_BYTES);
        (perdag, memdag)
    }

    #[test]
    fn temp_chunk_is_mem_only_and_readable() {
        let (_perdag, memdag) = new_memdag();
        let chunk = memdag.put_temp_chunk(json!({"v": 1}), vec![]);
        assert!(memdag.is_mem_only_chunk_hash(chunk.hash()));
        assert_eq!(memdag.get_chunk(chunk.hash()).unwrap().unwrap().hash(), chunk.hash());
    }

    #[test]
    fn source_chunk_is_fetched_and_cached() {
        let (perdag, memdag) = new_memdag();
        let chunk = perdag.create_chunk(json!({"v": 1}), vec![]);
        perdag
            .with_write(|tx| {
                tx.put_chunk(&chunk)?;
                tx.set_head("main", chunk.hash().clone())
            })
            .unwrap();
        assert!(!memdag.is_mem_only_chunk_hash(chunk.hash()));
        let fetched = memdag.get_chunk(chunk.hash()).unwrap().unwrap();
        assert_eq!(fetched.hash(), chunk.hash());
    }

    #[test]
    fn chunks_persisted_drops_temp_ownership() {
        let (_perdag, memdag) = new_memdag();
        let chunk = memdag.put_temp_chunk(json!({"v": 1}), vec![]);
        assert_eq!(memdag.temp_chunk_count(), 1);
        memdag.chunks_persisted(&[chunk.hash().clone()]);
        assert_eq!(memdag.temp_chunk_count(), 0);
    }

    #[test]
    fn heads_are_independent_of_perdag() {
        let (_perdag, memdag) = new_memdag();
        assert_eq!(memdag.get_head("main"), None);
        let hash = Hash::new_uuid();
        memdag.set_head("main", hash.clone());
        assert_eq!(memdag.get_head("main"), Some(hash));
        memdag.remove_head("main");
        assert_eq!(memdag.get_head("main"), None);
    }
}
