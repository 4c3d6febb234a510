//! Opaque JSON values.
//!
//! Values pass through the engine without being interpreted: the only
//! operations the engine performs on them are deep equality (subscription
//! dedup), serialized-size measurement (B+Tree balancing), and cloning.
//! `serde_json::Value` already gives us a tagged null/bool/number/string/
//! array/object union with structural equality, so we use it directly
//! rather than inventing a parallel representation.

use serde_json::Value;

/// Alias used throughout the engine for an opaque, application-defined
/// JSON value (mutator args, cookies, user data, index definitions, ...).
pub type JsonValue = Value;

/// Measures the serialized size of a JSON value in bytes.
///
/// Called once when a B+Tree entry is constructed; the result is cached
/// on the entry rather than recomputed on every read (see
/// `tidepool_btree::node::Entry`).
pub fn encoded_size(value: &JsonValue) -> usize {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len())
        .unwrap_or(0)
}
