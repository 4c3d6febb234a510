//! Tree-to-tree diff (spec.md §4.2 "`diff(oldTree, newTree)`"), used
//! both for subscription dispatch and to compute the diffs returned by
//! `maybeEndPull`/persist/refresh.

use crate::read::BTreeRead;
use crate::store::NodeStore;
use serde::{Serialize, Deserialize};
use tidepool_core::{Hash, JsonValue, Result};

/// One key-level change between two tree roots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiffOp {
    /// `key` is present in the new tree but not the old.
    Add {
        /// The added key.
        key: String,
        /// Its new value.
        new_value: JsonValue,
    },
    /// `key` is present in the old tree but not the new.
    Del {
        /// The removed key.
        key: String,
        /// Its old value.
        old_value: JsonValue,
    },
    /// `key` is present in both trees with a different value.
    Change {
        /// The changed key.
        key: String,
        /// Its value before.
        old_value: JsonValue,
        /// Its value after.
        new_value: JsonValue,
    },
}

impl DiffOp {
    /// The key this op concerns.
    pub fn key(&self) -> &str {
        match self {
            DiffOp::Add { key, .. } | DiffOp::Del { key, .. } | DiffOp::Change { key, .. } => key,
        }
    }
}

/// Computes the ordered diff between the trees rooted at `old` and
/// `new`. Identical roots short-circuit to an empty diff without
/// touching the store.
pub fn diff(store: &impl NodeStore, old: &Hash, new: &Hash) -> Result<Vec<DiffOp>> {
    if old == new {
        return Ok(Vec::new());
    }
    let old_entries = BTreeRead::new(store, old.clone()).scan("")?;
    let new_entries = BTreeRead::new(store, new.clone()).scan("")?;

    let mut ops = Vec::new();
    let mut i = 0;
    let mut j = 0;
    while i < old_entries.len() && j < new_entries.len() {
        let (ok, ov) = &old_entries[i];
        let (nk, nv) = &new_entries[j];
        match ok.as_str().cmp(nk.as_str()) {
            std::cmp::Ordering::Less => {
                ops.push(DiffOp::Del {
                    key: ok.clone(),
                    old_value: ov.clone(),
                });
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                ops.push(DiffOp::Add {
                    key: nk.clone(),
                    new_value: nv.clone(),
                });
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                if ov != nv {
                    ops.push(DiffOp::Change {
                        key: ok.clone(),
                        old_value: ov.clone(),
                        new_value: nv.clone(),
                    });
                }
                i += 1;
                j += 1;
            }
        }
    }
    for (k, v) in &old_entries[i..] {
        ops.push(DiffOp::Del {
            key: k.clone(),
            old_value: v.clone(),
        });
    }
    for (k, v) in &new_entries[j..] {
        ops.push(DiffOp::Add {
            key: k.clone(),
            new_value: v.clone(),
        });
    }
    Ok(ops)
}
