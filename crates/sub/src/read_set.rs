//! Tracks the keys, primary-tree scans, and index scans one
//! subscription body touched while it ran, so a later commit's diff
//! can be checked for intersection without rerunning every
//! subscription (spec.md §4.2: `diff(oldTree, newTree)` "used for
//! subscription dispatch").

use std::collections::HashSet;
use tidepool_btree::DiffOp;

#[derive(Debug, Clone, PartialEq, Eq)]
struct IndexScanFrom {
    index_name: String,
    from_secondary: String,
}

/// What one subscription body read the last time it ran.
///
/// An empty read set (the subscription hasn't run yet, or its last run
/// failed before reading anything) is never considered to intersect a
/// diff — [`SubscriptionRegistry::subscribe`] runs the body once up
/// front precisely so this case doesn't arise in steady state.
#[derive(Debug, Clone, Default)]
pub struct ReadSet {
    keys: HashSet<String>,
    scans_from: Vec<String>,
    index_scans: Vec<IndexScanFrom>,
}

impl ReadSet {
    /// An empty read set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a single-key read (`get`/`has`).
    pub fn record_get(&mut self, key: &str) {
        self.keys.insert(key.to_string());
    }

    /// Records an unbounded primary-tree scan starting at `from_key`.
    pub fn record_scan(&mut self, from_key: &str) {
        self.scans_from.push(from_key.to_string());
    }

    /// Records an unbounded secondary-index scan on `index_name`
    /// starting at `from_secondary`.
    pub fn record_index_scan(&mut self, index_name: &str, from_secondary: &str) {
        self.index_scans.push(IndexScanFrom {
            index_name: index_name.to_string(),
            from_secondary: from_secondary.to_string(),
        });
    }

    /// True if any op in `diff` falls within a key or scan range this
    /// read set recorded against the primary tree.
    pub fn intersects(&self, diff: &[DiffOp]) -> bool {
        diff.iter().any(|op| {
            let key = op.key();
            self.keys.contains(key) || self.scans_from.iter().any(|from| key >= from.as_str())
        })
    }

    /// True if any op in `index_name`'s diff falls within a scan range
    /// this read set recorded against that index.
    ///
    /// Index diff keys are the index's own encoded `(secondary,
    /// primary)` entries, which sort by secondary key first — so a
    /// scan recorded from `from_secondary` is conservatively treated
    /// as touched by any change whose encoded key orders at or after
    /// `from_secondary` (the NUL separator in the real encoding only
    /// ever makes the encoded key compare *greater* than its bare
    /// secondary prefix, so this never misses a true dependency).
    pub fn intersects_index(&self, index_name: &str, diff: &[DiffOp]) -> bool {
        self.index_scans
            .iter()
            .filter(|s| s.index_name == index_name)
            .any(|s| diff.iter().any(|op| op.key() >= s.from_secondary.as_str()))
    }

    /// True if nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.scans_from.is_empty() && self.index_scans.is_empty()
    }
}
