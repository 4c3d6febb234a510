//! Persist: copy a memdag head's mem-only chunk closure into the perdag
//! (spec.md §4.7, C10 "Persist").
//!
//! Temp chunks are minted with a UUID-derived hash (spec.md §9 REDESIGN
//! FLAGS #2: "the current path uses UUID-based temp hashes that are
//! persisted as-is") — persisting never rehashes content the way a
//! strictly content-addressed store would. A chunk's hash at creation
//! is the hash it keeps forever, mem-only or not; persisting is just
//! copying the still-mem-only chunks in a hash's closure into the
//! perdag's `KvStore` under that same hash, then telling the memdag it
//! can drop temp ownership of them (spec.md §4.7 step 4:
//! `chunksPersisted(gatheredHashes)`).

use tidepool_core::{Chunk, Hash, MutatorRegistry, Result};
use tidepool_concurrency::Memdag;
use tidepool_storage::{KvStore, Perdag};

/// Post-order walk of the temp-owned subgraph reachable from `root`,
/// stopping at any chunk that's already persisted (its own subgraph is
/// necessarily persisted too, by the same invariant applied earlier).
fn collect_temp_subgraph(memdag: &Memdag, root: &Hash) -> Result<Vec<Chunk>> {
    fn visit(
        memdag: &Memdag,
        hash: &Hash,
        seen: &mut std::collections::HashSet<Hash>,
        order: &mut Vec<Chunk>,
    ) -> Result<()> {
        if !memdag.is_mem_only_chunk_hash(hash) || seen.contains(hash) {
            return Ok(());
        }
        seen.insert(hash.clone());
        let chunk = memdag.must_get_chunk(hash)?;
        for child in chunk.refs() {
            visit(memdag, child, seen, order)?;
        }
        order.push(chunk);
        Ok(())
    }
    let mut seen = std::collections::HashSet::new();
    let mut order = Vec::new();
    visit(memdag, root, &mut seen, &mut order)?;
    Ok(order)
}

/// Copies every still-mem-only chunk reachable from `hash` (the commit
/// chain back through `basisHash`, each commit's value tree, and any
/// index roots) into `perdag`, under their existing hashes, and retires
/// their temp ownership in `memdag`.
///
/// Idempotent: a no-op if `hash` is already durable. Any other caller
/// that's about to hand a still-mem-only hash to durable state (a
/// [`tidepool_core::ClientGroupRecord::head_hash`] or
/// [`tidepool_core::ClientRecord::head_hash`]) should route through
/// this first — [`persist`] is just the steady-state case of the same
/// requirement.
pub fn persist_closure<K: KvStore>(perdag: &Perdag<K>, memdag: &Memdag, hash: &Hash) -> Result<()> {
    if !memdag.is_mem_only_chunk_hash(hash) {
        return Ok(());
    }
    let subgraph = collect_temp_subgraph(memdag, hash)?;
    if subgraph.is_empty() {
        return Ok(());
    }
    perdag.with_write(|tx| {
        for chunk in &subgraph {
            tx.put_chunk(chunk)?;
        }
        Ok(())
    })?;
    let persisted: Vec<Hash> = subgraph.iter().map(|c| c.hash().clone()).collect();
    memdag.chunks_persisted(&persisted);
    Ok(())
}

/// Persists `head_name`'s entire mem-only closure into the perdag and
/// moves the perdag's own named head to match, leaving the memdag head
/// untouched (its hash doesn't change — only where the chunks it names
/// live does).
///
/// A no-op, returning the current head unchanged, if it's already
/// fully durable.
pub fn persist<K: KvStore>(
    perdag: &Perdag<K>,
    memdag: &Memdag,
    head_name: &str,
    _registry: &MutatorRegistry,
) -> Result<Hash> {
    let head_hash = match memdag.get_head(head_name) {
        Some(h) => h,
        None => {
            return Err(tidepool_core::Error::InvalidOperation(format!(
                "no such head: {head_name}"
            )))
        }
    };

    if !memdag.is_mem_only_chunk_hash(&head_hash) {
        return Ok(head_hash);
    }

    let subgraph = collect_temp_subgraph(memdag, &head_hash)?;
    perdag.with_write(|tx| {
        for chunk in &subgraph {
            tx.put_chunk(chunk)?;
        }
        tx.set_head(head_name, head_hash.clone())
    })?;
    let persisted: Vec<Hash> = subgraph.iter().map(|c| c.hash().clone()).collect();
    memdag.chunks_persisted(&persisted);

    Ok(head_hash)
}
