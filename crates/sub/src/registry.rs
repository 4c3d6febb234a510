//! Query-dependency tracking and diff dispatch for change subscriptions
//! (spec.md §4.2 "`diff(oldTree, newTree)` ... used for subscription
//! dispatch", component C13).
//!
//! A subscription's *body* is an arbitrary closure reading through a
//! [`TrackedReadTx`]; [`SubscriptionRegistry::subscribe`] runs it once
//! up front (over the given head) to capture its initial value and
//! [`ReadSet`], then delivers that value to the caller's `on_data`
//! callback. Every later [`SubscriptionRegistry::dispatch`] call —
//! driven by whatever [`tidepool_durability::WriteTxResult`] a mutator
//! invocation or rebase produced — reruns only the subscriptions whose
//! recorded reads intersect the new diff, and redelivers only the ones
//! whose value actually changed (deep-equality, spec.md §9 "the only
//! operation is deep equality").

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tidepool_btree::DiffOp;
use tidepool_concurrency::Memdag;
use tidepool_core::{JsonValue, Result};
use tidepool_durability::ReadTx;

use crate::read_set::ReadSet;
use crate::tracked::TrackedReadTx;

/// Identifies one registered subscription; stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// A subscription body: reads through `tx` and returns the value the
/// subscriber cares about. Run fresh on every dispatch whose diff
/// intersects the body's previously recorded reads.
pub type SubscriptionBody = dyn Fn(&mut TrackedReadTx) -> Result<JsonValue> + Send + Sync;

/// Called with a subscription's newly computed value whenever it
/// changes (including the initial call from [`SubscriptionRegistry::subscribe`]).
pub type OnData = dyn Fn(&JsonValue) + Send + Sync;

struct Subscription {
    head_name: String,
    body: Arc<SubscriptionBody>,
    on_data: Arc<OnData>,
    reads: ReadSet,
    last_value: JsonValue,
}

/// Tracks every live subscription against one memdag and dispatches
/// diffs to the ones they depend on.
///
/// Holds its memdag by `Arc` rather than by reference so it can be
/// owned alongside the memdag itself inside a long-lived facade
/// without running into self-referential borrows.
pub struct SubscriptionRegistry {
    memdag: Arc<Memdag>,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
}

impl SubscriptionRegistry {
    /// An empty registry over `memdag`.
    pub fn new(memdag: Arc<Memdag>) -> Self {
        Self {
            memdag,
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new subscription: runs `body` once against
    /// `head_name`'s current state, records its [`ReadSet`], and
    /// delivers the initial value to `on_data` before returning.
    pub fn subscribe(
        &self,
        head_name: &str,
        body: Arc<SubscriptionBody>,
        on_data: Arc<OnData>,
    ) -> Result<SubscriptionId> {
        let read_tx = ReadTx::open(&self.memdag, head_name)?;
        let mut reads = ReadSet::new();
        let value = {
            let mut tracked = TrackedReadTx::new(&read_tx, &mut reads);
            body(&mut tracked)?
        };
        on_data(&value);

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.lock().insert(
            id,
            Subscription {
                head_name: head_name.to_string(),
                body,
                on_data,
                reads,
                last_value: value,
            },
        );
        Ok(id)
    }

    /// Removes a subscription; a no-op if `id` is already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().remove(&id);
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// True if no subscriptions are registered.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }

    /// Reruns every subscription on `head_name` whose recorded reads
    /// intersect `diff` (the primary-tree diff) or, for a named index,
    /// `index_diffs`; redelivers to `on_data` only those whose value
    /// actually changed, and refreshes their stored [`ReadSet`] from the
    /// rerun so later dispatches track the body's current dependencies.
    pub fn dispatch(
        &self,
        head_name: &str,
        diff: &[DiffOp],
        index_diffs: &HashMap<String, Vec<DiffOp>>,
    ) -> Result<()> {
        if diff.is_empty() && index_diffs.is_empty() {
            return Ok(());
        }

        // Collect the candidate ids first so the rerun below doesn't
        // hold the registry lock (a body may itself want to inspect
        // subscription state through some embedder hook).
        let candidates: Vec<SubscriptionId> = {
            let subs = self.subscriptions.lock();
            subs.iter()
                .filter(|(_, s)| s.head_name == head_name)
                .filter(|(_, s)| {
                    s.reads.intersects(diff)
                        || index_diffs
                            .iter()
                            .any(|(name, d)| s.reads.intersects_index(name, d))
                })
                .map(|(id, _)| *id)
                .collect()
        };
        if candidates.is_empty() {
            return Ok(());
        }

        let read_tx = ReadTx::open(&self.memdag, head_name)?;
        for id in candidates {
            let (body, on_data, last_value) = {
                let subs = self.subscriptions.lock();
                match subs.get(&id) {
                    Some(s) => (s.body.clone(), s.on_data.clone(), s.last_value.clone()),
                    None => continue, // unsubscribed between collection and rerun
                }
            };
            let mut reads = ReadSet::new();
            let new_value = {
                let mut tracked = TrackedReadTx::new(&read_tx, &mut reads);
                body(&mut tracked)?
            };
            let changed = new_value != last_value;

            let mut subs = self.subscriptions.lock();
            if let Some(sub) = subs.get_mut(&id) {
                sub.reads = reads;
                if changed {
                    sub.last_value = new_value.clone();
                }
            }
            drop(subs);

            if changed {
                on_data(&new_value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tidepool_core::{ClientId, MutationContext, Mutator};
    use tidepool_durability::commit::genesis_snapshot;
    use tidepool_durability::transaction::WriteTx;
    use tidepool_storage::{kv::MemKvStore, perdag::Perdag};

    struct PutMutator;
    impl Mutator for PutMutator {
        fn apply(&self, ctx: &mut dyn MutationContext, args: JsonValue) -> Result<()> {
            ctx.put(args["key"].as_str().unwrap(), args["value"].clone())
        }
    }

    fn new_memdag() -> Arc<Memdag> {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        Arc::new(Memdag::new(perdag, tidepool_concurrency::DEFAULT_CACHE_BYTES))
    }

    #[test]
    fn subscribe_delivers_initial_value_immediately() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);

        let registry = SubscriptionRegistry::new(memdag.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        registry
            .subscribe(
                "main",
                Arc::new(|tx: &mut TrackedReadTx| tx.get("a")),
                Arc::new(move |v: &JsonValue| seen2.lock().push(v.clone())),
            )
            .unwrap();

        assert_eq!(*seen.lock(), vec![JsonValue::Null]);
    }

    #[test]
    fn dispatch_redelivers_only_when_dependent_key_changed() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);
        let client = ClientId::new();

        let registry = SubscriptionRegistry::new(memdag.clone());
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_a2 = seen_a.clone();
        registry
            .subscribe(
                "main",
                Arc::new(|tx: &mut TrackedReadTx| tx.get("a")),
                Arc::new(move |v: &JsonValue| seen_a2.lock().push(v.clone())),
            )
            .unwrap();

        let seen_b = Arc::new(Mutex::new(Vec::new()));
        let seen_b2 = seen_b.clone();
        registry
            .subscribe(
                "main",
                Arc::new(|tx: &mut TrackedReadTx| tx.get("b")),
                Arc::new(move |v: &JsonValue| seen_b2.lock().push(v.clone())),
            )
            .unwrap();

        // Write "b" only; the "a" subscription's read set doesn't
        // intersect this diff, so it must not be rerun or redelivered.
        let mut tx =
            WriteTx::open(&memdag, "main", client, "put", json!({"key": "b", "value": 1}), 0).unwrap();
        tx.run(&PutMutator).unwrap();
        let result = tx.commit_to("main").unwrap();
        registry
            .dispatch("main", &result.diff, &result.index_diffs)
            .unwrap();

        assert_eq!(seen_a.lock().len(), 1, "unrelated key must not redeliver");
        assert_eq!(*seen_b.lock(), vec![JsonValue::Null, json!(1)]);
    }

    #[test]
    fn unsubscribe_stops_future_dispatch() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);
        let client = ClientId::new();

        let registry = SubscriptionRegistry::new(memdag.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let id = registry
            .subscribe(
                "main",
                Arc::new(|tx: &mut TrackedReadTx| tx.get("a")),
                Arc::new(move |v: &JsonValue| seen2.lock().push(v.clone())),
            )
            .unwrap();
        registry.unsubscribe(id);
        assert!(registry.is_empty());

        let mut tx =
            WriteTx::open(&memdag, "main", client, "put", json!({"key": "a", "value": 1}), 0).unwrap();
        tx.run(&PutMutator).unwrap();
        let result = tx.commit_to("main").unwrap();
        registry
            .dispatch("main", &result.diff, &result.index_diffs)
            .unwrap();

        assert_eq!(seen.lock().len(), 1, "unsubscribed body must never rerun");
    }
}
