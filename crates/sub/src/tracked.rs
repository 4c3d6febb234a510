//! A read transaction wrapper that records every key, scan, and index
//! scan a subscription body touches into a [`ReadSet`], so the next
//! commit's diff can be checked for intersection before rerunning it.

use tidepool_core::{JsonValue, Result};
use tidepool_durability::ReadTx;

use crate::read_set::ReadSet;

/// Passed to a subscription's body in place of a bare [`ReadTx`]; reads
/// through it update the body's [`ReadSet`] as a side effect.
pub struct TrackedReadTx<'a, 'r> {
    inner: &'a ReadTx<'a>,
    reads: &'r mut ReadSet,
}

impl<'a, 'r> TrackedReadTx<'a, 'r> {
    pub(crate) fn new(inner: &'a ReadTx<'a>, reads: &'r mut ReadSet) -> Self {
        Self { inner, reads }
    }

    /// Reads `key`'s current value, recording the dependency.
    pub fn get(&mut self, key: &str) -> Result<Option<JsonValue>> {
        self.reads.record_get(key);
        self.inner.get(key)
    }

    /// True if `key` is present, recording the dependency.
    pub fn has(&mut self, key: &str) -> Result<bool> {
        self.reads.record_get(key);
        self.inner.has(key)
    }

    /// Scans the primary tree from `from_key`, recording the range
    /// dependency.
    pub fn scan(&mut self, from_key: &str) -> Result<Vec<(String, JsonValue)>> {
        self.reads.record_scan(from_key);
        self.inner.scan(from_key)
    }

    /// Scans a secondary index from an encoded start point, recording
    /// the range dependency.
    pub fn scan_index(
        &mut self,
        index_name: &str,
        from_secondary: &str,
        from_primary: &str,
        exclusive: bool,
    ) -> Result<Vec<(String, String, JsonValue)>> {
        self.reads.record_index_scan(index_name, from_secondary);
        self.inner
            .scan_index(index_name, from_secondary, from_primary, exclusive)
    }
}
