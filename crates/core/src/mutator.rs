//! Mutator registry.
//!
//! spec.md §1 places application mutator functions out of scope, invoked
//! "via an opaque mutator registry". [`MutationContext`] is the narrow
//! surface a mutator needs; `tidepool-durability`'s `WriteTx` implements
//! it, keeping this crate free of a dependency on the transaction layer.

use crate::error::Result;
use crate::json::JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// The subset of a write transaction a mutator is allowed to touch.
pub trait MutationContext {
    /// Reads a key's current value.
    fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    /// True if `key` is present.
    fn has(&self, key: &str) -> Result<bool>;

    /// Writes `key`.
    fn put(&mut self, key: &str, value: JsonValue) -> Result<()>;

    /// Deletes `key`, returning whether it was present.
    fn del(&mut self, key: &str) -> Result<bool>;
}

/// An application mutator: a named function applying one logical write
/// to the keyspace.
pub trait Mutator: Send + Sync {
    /// Applies this mutator's effect to `ctx` given `args`.
    fn apply(&self, ctx: &mut dyn MutationContext, args: JsonValue) -> Result<()>;
}

/// Maps mutator names (as recorded on local commits) to their
/// implementation.
///
/// During rebase (§4.6), a mutation whose mutator is no longer
/// registered is treated as a no-op rather than an error — see
/// `tidepool_durability::pull::rebase`.
#[derive(Clone, Default)]
pub struct MutatorRegistry {
    mutators: HashMap<String, Arc<dyn Mutator>>,
}

impl MutatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mutator under `name`, replacing any previous
    /// registration.
    pub fn register(&mut self, name: impl Into<String>, mutator: Arc<dyn Mutator>) {
        self.mutators.insert(name.into(), mutator);
    }

    /// Looks up a mutator by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Mutator>> {
        self.mutators.get(name).cloned()
    }

    /// All registered mutator names, sorted — recorded on a client
    /// group to detect compatible-definition reuse during `initClient`.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mutators.keys().cloned().collect();
        names.sort();
        names
    }
}
