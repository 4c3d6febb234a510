//! Read/write/index transactions over a named memdag head (spec.md
//! §4.4, C7).

use std::collections::HashMap;
use tidepool_btree::{diff, BTreeRead, BTreeWrite, DiffOp};
use tidepool_concurrency::Memdag;
use tidepool_core::{
    ClientId, CommitData, Error, IndexDefinition, IndexRecord, JsonValue, MutationContext,
    MutationId, Mutator, Result,
};

use crate::commit::Commit;

/// A snapshot-consistent read view over whatever commit a head pointed
/// at when the transaction was opened.
pub struct ReadTx<'a> {
    memdag: &'a Memdag,
    commit: Commit,
}

impl<'a> ReadTx<'a> {
    /// Opens a read transaction over `head_name`'s current commit.
    pub fn open(memdag: &'a Memdag, head_name: &str) -> Result<Self> {
        let commit = Commit::from_head(head_name, memdag)?
            .ok_or_else(|| Error::InvalidOperation(format!("no such head: {head_name}")))?;
        Ok(Self { memdag, commit })
    }

    /// The commit this view is pinned to.
    pub fn commit(&self) -> &Commit {
        &self.commit
    }

    /// Reads `key`'s current value from the primary tree.
    pub fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        BTreeRead::new(self.memdag, self.commit.data().value_hash().clone()).get(key)
    }

    /// True if `key` is present.
    pub fn has(&self, key: &str) -> Result<bool> {
        BTreeRead::new(self.memdag, self.commit.data().value_hash().clone()).has(key)
    }

    /// True if the primary tree has no entries.
    pub fn is_empty(&self) -> Result<bool> {
        BTreeRead::new(self.memdag, self.commit.data().value_hash().clone()).is_empty()
    }

    /// Scans the primary tree from `from_key`, in UTF-8 key order
    /// (spec.md §4.4 "primary scans are UTF-8 ordered by key").
    pub fn scan(&self, from_key: &str) -> Result<Vec<(String, JsonValue)>> {
        BTreeRead::new(self.memdag, self.commit.data().value_hash().clone()).scan(from_key)
    }

    /// Scans a secondary index from an encoded `(secondary_key,
    /// primary_key)` start point, ordered by secondary key with
    /// primary key as tie-break (spec.md §4.4).
    ///
    /// `exclusive` mirrors `start.exclusive`: when true, an entry
    /// exactly equal to `from` is skipped.
    pub fn scan_index(
        &self,
        index_name: &str,
        from_secondary: &str,
        from_primary: &str,
        exclusive: bool,
    ) -> Result<Vec<(String, String, JsonValue)>> {
        let record = self
            .commit
            .data()
            .indexes()
            .iter()
            .find(|r| r.definition.name == index_name)
            .ok_or_else(|| Error::InvalidOperation(format!("no such index: {index_name}")))?;
        let from = crate::index::encode_index_key(from_secondary, from_primary);
        let raw = BTreeRead::new(self.memdag, record.value_hash.clone()).scan(&from)?;
        let mut out = Vec::with_capacity(raw.len());
        for (encoded, value) in raw {
            if exclusive && encoded == from {
                continue;
            }
            let (secondary, primary) = crate::index::decode_index_key(&encoded);
            out.push((secondary, primary, value));
        }
        Ok(out)
    }
}

struct IndexState {
    definition: IndexDefinition,
    root: tidepool_core::Hash,
    basis_root: tidepool_core::Hash,
}

/// One mutator invocation: opens a new commit on top of the current
/// head, runs the mutator against `self` as a [`MutationContext`],
/// flushes the primary tree and every secondary index, and produces a
/// new local commit plus its diff (spec.md §4.4 `WriteTx`).
pub struct WriteTx<'a> {
    memdag: &'a Memdag,
    client_id: ClientId,
    basis_hash: tidepool_core::Hash,
    basis_value_hash: tidepool_core::Hash,
    mutation_id: MutationId,
    mutator_name: String,
    mutator_args: JsonValue,
    original_hash: Option<tidepool_core::Hash>,
    timestamp: i64,
    value_root: tidepool_core::Hash,
    indexes: Vec<IndexState>,
}

/// What committing a [`WriteTx`] produced.
pub struct WriteTxResult {
    /// The new commit's hash (already installed as `head_name`'s head).
    pub head_hash: tidepool_core::Hash,
    /// Key-level changes to the primary tree.
    pub diff: Vec<DiffOp>,
    /// Key-level changes to each secondary index that changed, keyed
    /// by index name.
    pub index_diffs: HashMap<String, Vec<DiffOp>>,
}

impl<'a> WriteTx<'a> {
    /// Opens a write transaction for a fresh mutator invocation on
    /// `head_name`, assigning it the next mutation id for `client_id`.
    pub fn open(
        memdag: &'a Memdag,
        head_name: &str,
        client_id: ClientId,
        mutator_name: impl Into<String>,
        mutator_args: JsonValue,
        timestamp: i64,
    ) -> Result<Self> {
        let basis = Commit::from_head(head_name, memdag)?
            .ok_or_else(|| Error::InvalidOperation(format!("no such head: {head_name}")))?;
        let mutation_id = basis.data().mutation_id(client_id) + 1;
        Ok(Self::from_basis(
            memdag,
            &basis,
            client_id,
            mutation_id,
            mutator_name,
            mutator_args,
            timestamp,
            None,
        ))
    }

    /// Opens a write transaction replaying an existing local commit
    /// (`original`) on top of a new basis `onto` — spec.md §4.6
    /// "Rebase one mutation onto syncHead". Preserves the original
    /// mutation id and records `original.hash()` for diagnostics.
    pub fn open_for_rebase(
        memdag: &'a Memdag,
        onto: &Commit,
        original: &Commit,
        client_id: ClientId,
        mutator_name: impl Into<String>,
        mutator_args: JsonValue,
        timestamp: i64,
        mutation_id: MutationId,
    ) -> Self {
        Self::from_basis(
            memdag,
            onto,
            client_id,
            mutation_id,
            mutator_name,
            mutator_args,
            timestamp,
            Some(original.hash().clone()),
        )
    }

    fn from_basis(
        memdag: &'a Memdag,
        basis: &Commit,
        client_id: ClientId,
        mutation_id: MutationId,
        mutator_name: impl Into<String>,
        mutator_args: JsonValue,
        timestamp: i64,
        original_hash: Option<tidepool_core::Hash>,
    ) -> Self {
        let indexes = basis
            .data()
            .indexes()
            .iter()
            .map(|r| IndexState {
                definition: r.definition.clone(),
                root: r.value_hash.clone(),
                basis_root: r.value_hash.clone(),
            })
            .collect();
        Self {
            memdag,
            client_id,
            basis_hash: basis.hash().clone(),
            basis_value_hash: basis.data().value_hash().clone(),
            mutation_id,
            mutator_name: mutator_name.into(),
            mutator_args,
            original_hash,
            timestamp,
            value_root: basis.data().value_hash().clone(),
            indexes,
        }
    }

    /// This transaction's assigned mutation id.
    pub fn mutation_id(&self) -> MutationId {
        self.mutation_id
    }

    /// Runs `mutator` against this transaction, passing its recorded
    /// args. If the mutator is no longer registered, the caller should
    /// skip this and go straight to [`Self::commit_to`] — spec.md §4.6:
    /// "If the mutator is no longer registered, treat as a no-op".
    pub fn run(&mut self, mutator: &dyn Mutator) -> Result<()> {
        let args = self.mutator_args.clone();
        mutator.apply(self, args)
    }

    /// Builds the new local commit, installs it as `head_name`'s head,
    /// and returns the resulting diffs.
    pub fn commit_to(self, head_name: &str) -> Result<WriteTxResult> {
        let commit_data = CommitData::Local {
            basis_hash: self.basis_hash.clone(),
            client_id: self.client_id,
            mutation_id: self.mutation_id,
            mutator_name: self.mutator_name.clone(),
            mutator_args: self.mutator_args.clone(),
            original_hash: self.original_hash.clone(),
            timestamp: self.timestamp,
            value_hash: self.value_root.clone(),
            indexes: self
                .indexes
                .iter()
                .map(|s| IndexRecord {
                    definition: s.definition.clone(),
                    value_hash: s.root.clone(),
                })
                .collect(),
        };
        let chunk = Commit::new_chunk(self.memdag, commit_data);
        let head_hash = chunk.hash().clone();
        self.memdag.set_head(head_name, head_hash.clone());

        let diff = diff(self.memdag, &self.basis_value_hash, &self.value_root)?;
        let mut index_diffs = HashMap::new();
        for idx in &self.indexes {
            if idx.root != idx.basis_root {
                let d = diff(self.memdag, &idx.basis_root, &idx.root)?;
                if !d.is_empty() {
                    index_diffs.insert(idx.definition.name.clone(), d);
                }
            }
        }
        Ok(WriteTxResult {
            head_hash,
            diff,
            index_diffs,
        })
    }

    fn update_indexes_for_put(
        &mut self,
        primary_key: &str,
        old_value: Option<&JsonValue>,
        new_value: &JsonValue,
    ) -> Result<()> {
        for idx in &mut self.indexes {
            if !primary_key.starts_with(idx.definition.key_prefix.as_str()) {
                continue;
            }
            let mut w = BTreeWrite::new(self.memdag, idx.root.clone());
            if let Some(old_value) = old_value {
                if let Some(old_secondary) = crate::index::secondary_key_for(old_value, &idx.definition) {
                    w.del(&crate::index::encode_index_key(&old_secondary, primary_key))?;
                }
            }
            if let Some(new_secondary) = crate::index::secondary_key_for(new_value, &idx.definition) {
                w.put(
                    &crate::index::encode_index_key(&new_secondary, primary_key),
                    new_value.clone(),
                )?;
            }
            idx.root = w.flush()?;
        }
        Ok(())
    }

    fn update_indexes_for_del(&mut self, primary_key: &str, old_value: &JsonValue) -> Result<()> {
        for idx in &mut self.indexes {
            if !primary_key.starts_with(idx.definition.key_prefix.as_str()) {
                continue;
            }
            if let Some(old_secondary) = crate::index::secondary_key_for(old_value, &idx.definition) {
                let mut w = BTreeWrite::new(self.memdag, idx.root.clone());
                w.del(&crate::index::encode_index_key(&old_secondary, primary_key))?;
                idx.root = w.flush()?;
            }
        }
        Ok(())
    }
}

impl<'a> MutationContext for WriteTx<'a> {
    fn get(&self, key: &str) -> Result<Option<JsonValue>> {
        BTreeRead::new(self.memdag, self.value_root.clone()).get(key)
    }

    fn has(&self, key: &str) -> Result<bool> {
        BTreeRead::new(self.memdag, self.value_root.clone()).has(key)
    }

    fn put(&mut self, key: &str, value: JsonValue) -> Result<()> {
        let old = self.get(key)?;
        let mut w = BTreeWrite::new(self.memdag, self.value_root.clone());
        w.put(key, value.clone())?;
        self.value_root = w.flush()?;
        self.update_indexes_for_put(key, old.as_ref(), &value)
    }

    fn del(&mut self, key: &str) -> Result<bool> {
        let old = self.get(key)?;
        let mut w = BTreeWrite::new(self.memdag, self.value_root.clone());
        let found = w.del(key)?;
        self.value_root = w.flush()?;
        if let Some(old_value) = &old {
            self.update_indexes_for_del(key, old_value)?;
        }
        Ok(found)
    }
}

/// Prefix recorded as `mutator_name` on the special local commit an
/// index change produces, so push (§4.5) can recognize and skip these
/// commits rather than replaying them against the server as ordinary
/// mutations.
pub const INDEX_MUTATOR_PREFIX: &str = "_index:";

/// True if `mutator_name` names an index-change commit rather than an
/// application mutation.
pub fn is_index_change(mutator_name: &str) -> bool {
    mutator_name.starts_with(INDEX_MUTATOR_PREFIX)
}

/// Creates or drops a secondary index by producing a new local commit
/// that carries the updated `indexes` array but leaves the primary
/// value tree untouched (spec.md §4.4 `IndexTx`, DD31's representation
/// of what legacy SDD modeled as a standalone `IndexChangeCommit`; see
/// DESIGN.md Open Question 1).
pub struct IndexTx;

impl IndexTx {
    /// Adds a new secondary index, backfilling it from every existing
    /// primary entry matching `definition.key_prefix`.
    pub fn create_index(
        memdag: &Memdag,
        head_name: &str,
        client_id: ClientId,
        timestamp: i64,
        definition: IndexDefinition,
    ) -> Result<WriteTxResult> {
        let basis = Commit::from_head(head_name, memdag)?
            .ok_or_else(|| Error::InvalidOperation(format!("no such head: {head_name}")))?;
        if basis
            .data()
            .indexes()
            .iter()
            .any(|r| r.definition.name == definition.name)
        {
            return Err(Error::InvalidOperation(format!(
                "index already exists: {}",
                definition.name
            )));
        }

        let primary = BTreeRead::new(memdag, basis.data().value_hash().clone()).scan("")?;
        let mut w = BTreeWrite::new(memdag, tidepool_btree::empty_root(memdag));
        for (key, value) in &primary {
            if !key.starts_with(definition.key_prefix.as_str()) {
                continue;
            }
            if let Some(secondary) = crate::index::secondary_key_for(value, &definition) {
                w.put(&crate::index::encode_index_key(&secondary, key), value.clone())?;
            }
        }
        let index_root = w.flush()?;
        let index_diff = diff(memdag, &tidepool_btree::empty_root(memdag), &index_root)?;

        let mut indexes = basis.data().indexes().to_vec();
        indexes.push(IndexRecord {
            definition: definition.clone(),
            value_hash: index_root,
        });
        let mutation_id = basis.data().mutation_id(client_id) + 1;
        let data = CommitData::Local {
            basis_hash: basis.hash().clone(),
            client_id,
            mutation_id,
            mutator_name: format!("{INDEX_MUTATOR_PREFIX}create:{}", definition.name),
            mutator_args: serde_json::to_value(&definition)?,
            original_hash: None,
            timestamp,
            value_hash: basis.data().value_hash().clone(),
            indexes,
        };
        let chunk = Commit::new_chunk(memdag, data);
        let head_hash = chunk.hash().clone();
        memdag.set_head(head_name, head_hash.clone());

        let mut index_diffs = HashMap::new();
        if !index_diff.is_empty() {
            index_diffs.insert(definition.name, index_diff);
        }
        Ok(WriteTxResult {
            head_hash,
            diff: Vec::new(),
            index_diffs,
        })
    }

    /// Removes a secondary index.
    pub fn drop_index(
        memdag: &Memdag,
        head_name: &str,
        client_id: ClientId,
        timestamp: i64,
        index_name: &str,
    ) -> Result<WriteTxResult> {
        let basis = Commit::from_head(head_name, memdag)?
            .ok_or_else(|| Error::InvalidOperation(format!("no such head: {head_name}")))?;
        let removed = basis
            .data()
            .indexes()
            .iter()
            .find(|r| r.definition.name == index_name)
            .ok_or_else(|| Error::InvalidOperation(format!("no such index: {index_name}")))?
            .clone();
        let indexes: Vec<IndexRecord> = basis
            .data()
            .indexes()
            .iter()
            .filter(|r| r.definition.name != index_name)
            .cloned()
            .collect();

        let mutation_id = basis.data().mutation_id(client_id) + 1;
        let data = CommitData::Local {
            basis_hash: basis.hash().clone(),
            client_id,
            mutation_id,
            mutator_name: format!("{INDEX_MUTATOR_PREFIX}drop:{index_name}"),
            mutator_args: serde_json::json!({ "name": index_name }),
            original_hash: None,
            timestamp,
            value_hash: basis.data().value_hash().clone(),
            indexes,
        };
        let chunk = Commit::new_chunk(memdag, data);
        let head_hash = chunk.hash().clone();
        memdag.set_head(head_name, head_hash.clone());

        let mut index_diffs = HashMap::new();
        let removed_diff = diff(memdag, &removed.value_hash, &tidepool_btree::empty_root(memdag))?;
        if !removed_diff.is_empty() {
            index_diffs.insert(index_name.to_string(), removed_diff);
        }
        Ok(WriteTxResult {
            head_hash,
            diff: Vec::new(),
            index_diffs,
        })
    }
}
