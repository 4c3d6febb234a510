//! The persistent content-addressed chunk DAG (spec.md C3).
//!
//! A [`Perdag`] is a typed layer over a [`KvStore`]: chunks live under a
//! `c/` key prefix, named heads under `h/`, and per-chunk refcounts
//! under `r/`. Moving a head recomputes reachability transactionally —
//! a chunk whose refcount reaches zero is deleted, and its own
//! references are decremented in turn, so GC is exact rather than
//! tracing.

use crate::kv::{KvRead, KvStore, KvWrite};
use crate::Result;
use serde::{Deserialize, Serialize};
use tidepool_core::{Chunk, Error, Hash, JsonValue};

fn chunk_key(hash: &Hash) -> Vec<u8> {
    format!("c/{hash}").into_bytes()
}

fn head_key(name: &str) -> Vec<u8> {
    format!("h/{name}").into_bytes()
}

fn refcount_key(hash: &Hash) -> Vec<u8> {
    format!("r/{hash}").into_bytes()
}

#[derive(Serialize, Deserialize)]
struct StoredChunk {
    data: JsonValue,
    refs: Vec<Hash>,
}

fn encode_chunk(chunk: &Chunk) -> Vec<u8> {
    serde_json::to_vec(&StoredChunk {
        data: chunk.data().clone(),
        refs: chunk.refs().to_vec(),
    })
    .expect("chunk always serializes")
}

fn decode_chunk(hash: &Hash, bytes: &[u8]) -> Result<Chunk> {
    let stored: StoredChunk = serde_json::from_slice(bytes).map_err(|e| {
        Error::Corrupt(format!("chunk {hash} has unreadable payload: {e}"))
    })?;
    Ok(Chunk::new_with_hash(hash.clone(), stored.data, stored.refs))
}

fn decode_refcount(bytes: Option<Vec<u8>>) -> u64 {
    match bytes {
        Some(b) if b.len() == 8 => {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&b);
            u64::from_be_bytes(arr)
        }
        _ => 0,
    }
}

fn encode_refcount(n: u64) -> Vec<u8> {
    n.to_be_bytes().to_vec()
}

/// Abstraction the memdag depends on to fetch chunks it doesn't own and
/// to mint content-addressed chunks; implemented by [`Perdag`].
pub trait ChunkSource: Send + Sync {
    /// Fetches a chunk by hash, or `None` if it does not exist.
    fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>>;

    /// Computes the content hash of `data` and builds a [`Chunk`] for it,
    /// without writing anything.
    fn create_chunk(&self, data: JsonValue, refs: Vec<Hash>) -> Chunk {
        Chunk::new_content_addressed(data, refs)
    }
}

/// A snapshot read transaction over a [`Perdag`].
pub struct PerdagReadTx<'a, R: KvRead> {
    kv: &'a R,
}

impl<'a, R: KvRead> PerdagReadTx<'a, R> {
    /// Fetches a chunk by hash.
    pub fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>> {
        match self.kv.get(&chunk_key(hash)) {
            Some(bytes) => Ok(Some(decode_chunk(hash, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetches a chunk, translating a miss into [`Error::ChunkNotFound`].
    pub fn must_get_chunk(&self, hash: &Hash) -> Result<Chunk> {
        self.get_chunk(hash)?
            .ok_or_else(|| Error::ChunkNotFound(hash.clone()))
    }

    /// Resolves a named head to its current hash.
    pub fn get_head(&self, name: &str) -> Result<Option<Hash>> {
        match self.kv.get(&head_key(name)) {
            Some(bytes) => {
                let s = String::from_utf8(bytes)
                    .map_err(|e| Error::Corrupt(format!("head {name} is not UTF-8: {e}")))?;
                Ok(Some(Hash::parse(&s).map_err(|e| {
                    Error::Corrupt(format!("head {name} has invalid hash: {e}"))
                })?))
            }
            None => Ok(None),
        }
    }

    /// Current refcount recorded for `hash` (0 if absent).
    pub fn refcount(&self, hash: &Hash) -> u64 {
        decode_refcount(self.kv.get(&refcount_key(hash)))
    }
}

/// A write transaction over a [`Perdag`].
///
/// Chunk writes are idempotent (writing an existing hash is a no-op);
/// head moves are validated and GC'd when the transaction's closure
/// returns successfully.
pub struct PerdagWriteTx<'a, W: KvWrite> {
    kv: &'a mut W,
    head_moves: Vec<(String, Option<Hash>, Option<Hash>)>,
}

impl<'a, W: KvWrite> PerdagWriteTx<'a, W> {
    fn new(kv: &'a mut W) -> Self {
        Self {
            kv,
            head_moves: Vec::new(),
        }
    }

    /// Fetches a chunk by hash.
    pub fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>> {
        match self.kv.get(&chunk_key(hash)) {
            Some(bytes) => Ok(Some(decode_chunk(hash, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Resolves a named head to its current hash.
    pub fn get_head(&self, name: &str) -> Result<Option<Hash>> {
        match self.kv.get(&head_key(name)) {
            Some(bytes) => {
                let s = String::from_utf8(bytes)
                    .map_err(|e| Error::Corrupt(format!("head {name} is not UTF-8: {e}")))?;
                Ok(Some(Hash::parse(&s).map_err(|e| {
                    Error::Corrupt(format!("head {name} has invalid hash: {e}"))
                })?))
            }
            None => Ok(None),
        }
    }

    /// Writes a chunk. Idempotent: writing an already-present hash is a
    /// no-op.
    pub fn put_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        let key = chunk_key(chunk.hash());
        if self.kv.has(&key) {
            return Ok(());
        }
        self.kv.put(key, encode_chunk(chunk));
        Ok(())
    }

    /// Moves `name` to point at `hash`. The chunk must already exist
    /// (either pre-existing, or written earlier in this same
    /// transaction via [`Self::put_chunk`]) or this fails with
    /// [`Error::Corrupt`] — spec.md §4.1 failure semantics.
    pub fn set_head(&mut self, name: &str, hash: Hash) -> Result<()> {
        if !self.kv.has(&chunk_key(&hash)) {
            return Err(Error::Corrupt(format!(
                "set_head({name}): chunk {hash} was not written in this transaction"
            )));
        }
        let old = self.get_head(name)?;
        self.kv.put(head_key(name), hash.to_string().into_bytes());
        self.head_moves.push((name.to_string(), old, Some(hash)));
        Ok(())
    }

    /// Removes a head entirely (used to discard the `sync` branch).
    pub fn remove_head(&mut self, name: &str) -> Result<Option<Hash>> {
        let old = self.get_head(name)?;
        self.kv.del(&head_key(name));
        if old.is_some() {
            self.head_moves.push((name.to_string(), old.clone(), None));
        }
        Ok(old)
    }

    fn refcount(&self, hash: &Hash) -> u64 {
        decode_refcount(self.kv.get(&refcount_key(hash)))
    }

    fn set_refcount(&mut self, hash: &Hash, n: u64) {
        self.kv.put(refcount_key(hash), encode_refcount(n));
    }

    /// Recursively increments `hash`'s refcount; the first time it
    /// transitions from 0 to positive, recurses into its own refs (it
    /// has become a referrer of them).
    fn increment(&mut self, hash: &Hash) -> Result<()> {
        let before = self.refcount(hash);
        self.set_refcount(hash, before + 1);
        if before == 0 {
            let chunk = self.get_chunk(hash)?;
            if let Some(chunk) = chunk {
                for child in chunk.refs().to_vec() {
                    self.increment(&child)?;
                }
            }
        }
        Ok(())
    }

    /// Recursively decrements `hash`'s refcount; when it reaches zero
    /// the chunk is deleted and its own refs are decremented in turn.
    fn decrement(&mut self, hash: &Hash) -> Result<()> {
        let before = self.refcount(hash);
        if before == 0 {
            return Ok(());
        }
        let after = before - 1;
        if after == 0 {
            let chunk = self.get_chunk(hash)?;
            self.kv.del(&refcount_key(hash));
            self.kv.del(&chunk_key(hash));
            if let Some(chunk) = chunk {
                for child in chunk.refs().to_vec() {
                    self.decrement(&child)?;
                }
            }
        } else {
            self.set_refcount(hash, after);
        }
        Ok(())
    }

    /// Applies the GC pass described in spec.md §4.1 step 2 for every
    /// head moved during this transaction.
    fn finalize(mut self) -> Result<()> {
        let moves = std::mem::take(&mut self.head_moves);
        for (_, old, new) in moves {
            if new != old {
                if let Some(h) = &new {
                    self.increment(h)?;
                }
                if let Some(h) = &old {
                    self.decrement(h)?;
                }
            }
        }
        Ok(())
    }
}

/// The persistent, durable chunk DAG.
pub struct Perdag<K: KvStore> {
    kv: K,
}

impl<K: KvStore> Perdag<K> {
    /// Wraps a [`KvStore`] as a perdag.
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// Computes the content hash of `data` without writing anything.
    pub fn create_chunk(&self, data: JsonValue, refs: Vec<Hash>) -> Chunk {
        Chunk::new_content_addressed(data, refs)
    }

    /// Runs `f` against a read-only snapshot.
    pub fn with_read<T>(&self, f: impl FnOnce(&PerdagReadTx<'_, K::Read>) -> T) -> T {
        self.kv.with_read(|kv| f(&PerdagReadTx { kv }))
    }

    /// Runs `f` against a write transaction. If `f` returns `Ok`, chunk
    /// writes and head moves are committed and reachability/GC is
    /// recomputed; if `f` returns `Err`, nothing is applied.
    pub fn with_write<T>(
        &self,
        f: impl FnOnce(&mut PerdagWriteTx<'_, K::Write>) -> Result<T>,
    ) -> Result<T> {
        self.kv.with_write(|kv| {
            let mut tx = PerdagWriteTx::new(kv);
            let result = f(&mut tx)?;
            tx.finalize()?;
            Ok(result)
        })
    }

    /// Drops this perdag handle. A no-op for [`crate::kv::MemKvStore`];
    /// present so a real on-disk backend has a place to flush/close
    /// file handles.
    pub fn close(&self) {}

    /// Current refcount of `hash` (0 if absent); test/diagnostic use.
    pub fn refcount(&self, hash: &Hash) -> u64 {
        self.with_read(|tx| tx.refcount(hash))
    }
}

impl<K: KvStore> ChunkSource for Perdag<K> {
    fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>> {
        self.with_read(|tx| tx.get_chunk(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKvStore;
    use serde_json::json;

    fn new_perdag() -> Perdag<MemKvStore> {
        Perdag::new(MemKvStore::new())
    }

    #[test]
    fn put_chunk_then_set_head_is_visible() {
        let dag = new_perdag();
        let chunk = dag.create_chunk(json!({"v": 1}), vec![]);
        let hash = chunk.hash().clone();
        dag.with_write(|tx| {
            tx.put_chunk(&chunk)?;
            tx.set_head("main", hash.clone())?;
            Ok(())
        })
        .unwrap();
        dag.with_read(|tx| {
            assert_eq!(tx.get_head("main").unwrap(), Some(hash.clone()));
            assert_eq!(tx.get_chunk(&hash).unwrap().unwrap().hash(), &hash);
        });
        assert_eq!(dag.refcount(&hash), 1);
    }

    #[test]
    fn set_head_to_unwritten_chunk_is_corrupt() {
        let dag = new_perdag();
        let phantom = Hash::of(b"never written");
        let res = dag.with_write(|tx| tx.set_head("main", phantom));
        assert!(matches!(res, Err(Error::Corrupt(_))));
    }

    #[test]
    fn moving_head_away_deletes_unreferenced_chunk() {
        let dag = new_perdag();
        let chunk_a = dag.create_chunk(json!({"v": "a"}), vec![]);
        let hash_a = chunk_a.hash().clone();
        dag.with_write(|tx| {
            tx.put_chunk(&chunk_a)?;
            tx.set_head("main", hash_a.clone())
        })
        .unwrap();

        let chunk_b = dag.create_chunk(json!({"v": "b"}), vec![]);
        let hash_b = chunk_b.hash().clone();
        dag.with_write(|tx| {
            tx.put_chunk(&chunk_b)?;
            tx.set_head("main", hash_b.clone())
        })
        .unwrap();

        assert_eq!(dag.refcount(&hash_a), 0);
        dag.with_read(|tx| {
            assert!(tx.get_chunk(&hash_a).unwrap().is_none());
        });
    }

    #[test]
    fn shared_child_survives_until_last_referrer_goes() {
        let dag = new_perdag();
        let child = dag.create_chunk(json!({"leaf": true}), vec![]);
        let child_hash = child.hash().clone();
        let parent1 = dag.create_chunk(json!({"p": 1}), vec![child_hash.clone()]);
        let parent1_hash = parent1.hash().clone();

        dag.with_write(|tx| {
            tx.put_chunk(&child)?;
            tx.put_chunk(&parent1)?;
            tx.set_head("a", parent1_hash.clone())
        })
        .unwrap();

        let parent2 = dag.create_chunk(json!({"p": 2}), vec![child_hash.clone()]);
        let parent2_hash = parent2.hash().clone();
        dag.with_write(|tx| {
            tx.put_chunk(&parent2)?;
            tx.set_head("b", parent2_hash.clone())
        })
        .unwrap();

        assert_eq!(dag.refcount(&child_hash), 2);

        // Moving head "a" away should not delete the shared child.
        let leaf2 = dag.create_chunk(json!({"other": true}), vec![]);
        let leaf2_hash = leaf2.hash().clone();
        dag.with_write(|tx| {
            tx.put_chunk(&leaf2)?;
            tx.set_head("a", leaf2_hash.clone())
        })
        .unwrap();
        assert_eq!(dag.refcount(&child_hash), 1);
        dag.with_read(|tx| {
            assert!(tx.get_chunk(&child_hash).unwrap().is_some());
        });

        // Moving head "b" away now should delete it.
        dag.with_write(|tx| {
            tx.put_chunk(&leaf2)?;
            tx.set_head("b", leaf2_hash.clone())
        })
        .unwrap();
        assert_eq!(dag.refcount(&child_hash), 0);
    }

    #[test]
    fn chunk_not_found_on_missing_read() {
        let dag = new_perdag();
        let phantom = Hash::of(b"missing");
        dag.with_read(|tx| {
            assert!(matches!(
                tx.must_get_chunk(&phantom),
                Err(Error::ChunkNotFound(_))
            ));
        });
    }
}
