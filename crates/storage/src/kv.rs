//! `KVStore` abstraction: an ordered byte-key store with atomic read and
//! write transactions (spec.md C2).
//!
//! This is deliberately a thin seam — the engine never depends on a
//! particular on-disk format. [`MemKvStore`] is the one concrete
//! implementation shipped here, used by default and throughout the test
//! suite; an embedder swaps in a real persistence layer by implementing
//! [`KvStore`] themselves.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};

/// A consistent, point-in-time view of the store.
pub trait KvRead {
    /// Looks up a key's value.
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// True if `key` is present.
    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    /// Returns all `(key, value)` pairs with the given prefix, in
    /// ascending byte-key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// A read view that can also be mutated; mutations are only visible to
/// others once the enclosing [`KvStore::with_write`] closure returns
/// `Ok`.
pub trait KvWrite: KvRead {
    /// Writes `key`, overwriting any existing value.
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Deletes `key`, returning whether it was present.
    fn del(&mut self, key: &[u8]) -> bool;
}

/// An ordered byte-key store with atomic read/write transactions.
///
/// Transactions are scoped by closure rather than an explicit
/// begin/commit handle: `with_read`/`with_write` return whatever the
/// closure returns, and `with_write` only applies the closure's
/// mutations if it returns `Ok`.
pub trait KvStore: Send + Sync {
    /// A point-in-time read snapshot.
    type Read: KvRead;
    /// A mutable view scoped to one write transaction.
    type Write: KvWrite;

    /// Runs `f` against a read-only snapshot.
    fn with_read<R>(&self, f: impl FnOnce(&Self::Read) -> R) -> R;

    /// Runs `f` against a fresh write view. Writers are serialized: at
    /// most one `with_write` call is in flight at a time per store.
    /// If `f` returns `Err`, none of its mutations are applied.
    fn with_write<R>(&self, f: impl FnOnce(&mut Self::Write) -> crate::Result<R>) -> crate::Result<R>;
}

/// A snapshot of [`MemKvStore`] at a point in time.
#[derive(Clone)]
pub struct MemSnapshot {
    data: Arc<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl KvRead for MemSnapshot {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// A scratch copy mutated during one write transaction; swapped into the
/// store atomically on success.
pub struct MemWriteScratch {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl KvRead for MemWriteScratch {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl KvWrite for MemWriteScratch {
    fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.data.insert(key, value);
    }

    fn del(&mut self, key: &[u8]) -> bool {
        self.data.remove(key).is_some()
    }
}

/// An in-memory, copy-on-write `KVStore`.
///
/// Writers are serialized by an internal mutex; a write transaction
/// mutates a private scratch copy of the map and is only published
/// (via an `Arc` swap) if its closure returns `Ok`. Readers always see a
/// fully-formed, previously-committed snapshot.
pub struct MemKvStore {
    data: RwLock<Arc<BTreeMap<Vec<u8>, Vec<u8>>>>,
    write_lock: Mutex<()>,
    writes_committed: AtomicU64,
}

impl MemKvStore {
    /// An empty store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Arc::new(BTreeMap::new())),
            write_lock: Mutex::new(()),
            writes_committed: AtomicU64::new(0),
        }
    }

    /// Number of write transactions committed so far (test/diagnostic
    /// use).
    pub fn writes_committed(&self) -> u64 {
        self.writes_committed.load(Ordering::Relaxed)
    }
}

impl Default for MemKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemKvStore {
    type Read = MemSnapshot;
    type Write = MemWriteScratch;

    fn with_read<R>(&self, f: impl FnOnce(&Self::Read) -> R) -> R {
        let snapshot = MemSnapshot {
            data: self.data.read().clone(),
        };
        f(&snapshot)
    }

    fn with_write<R>(
        &self,
        f: impl FnOnce(&mut Self::Write) -> crate::Result<R>,
    ) -> crate::Result<R> {
        let _guard = self.write_lock.lock();
        let base = self.data.read().clone();
        let mut scratch = MemWriteScratch {
            data: (*base).clone(),
        };
        let result = f(&mut scratch)?;
        *self.data.write() = Arc::new(scratch.data);
        self.writes_committed.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_is_visible() {
        let store = MemKvStore::new();
        store
            .with_write(|w| {
                w.put(b"a".to_vec(), b"1".to_vec());
                Ok(())
            })
            .unwrap();
        store.with_read(|r| {
            assert_eq!(r.get(b"a"), Some(b"1".to_vec()));
        });
    }

    #[test]
    fn failed_write_does_not_apply() {
        let store = MemKvStore::new();
        let res: crate::Result<()> = store.with_write(|w| {
            w.put(b"a".to_vec(), b"1".to_vec());
            Err(tidepool_core::Error::InvalidOperation("boom".into()))
        });
        assert!(res.is_err());
        store.with_read(|r| {
            assert_eq!(r.get(b"a"), None);
        });
    }

    #[test]
    fn scan_prefix_is_ordered() {
        let store = MemKvStore::new();
        store
            .with_write(|w| {
                w.put(b"k/2".to_vec(), b"b".to_vec());
                w.put(b"k/1".to_vec(), b"a".to_vec());
                w.put(b"other".to_vec(), b"x".to_vec());
                Ok(())
            })
            .unwrap();
        store.with_read(|r| {
            let entries = r.scan_prefix(b"k/");
            assert_eq!(
                entries,
                vec![
                    (b"k/1".to_vec(), b"a".to_vec()),
                    (b"k/2".to_vec(), b"b".to_vec()),
                ]
            );
        });
    }
}
