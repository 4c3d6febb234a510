//! Secondary index key encoding and derivation (spec.md §4.4 "Secondary
//! indexes").
//!
//! An index's B+Tree is keyed by the concatenation of the derived
//! secondary key and the primary key, joined by a NUL byte. NUL can't
//! appear in either half (JSON strings are valid Unicode text, and
//! primary keys are ordinary UTF-8 strings), so the joined key sorts
//! first by secondary key and, within ties, by primary key.

use tidepool_core::{IndexDefinition, JsonValue};

/// Joins a derived secondary key and a primary key into one index B+Tree
/// key.
pub fn encode_index_key(secondary_key: &str, primary_key: &str) -> String {
    let mut encoded = String::with_capacity(secondary_key.len() + 1 + primary_key.len());
    encoded.push_str(secondary_key);
    encoded.push('\0');
    encoded.push_str(primary_key);
    encoded
}

/// Splits an encoded index key back into `(secondary_key, primary_key)`.
pub fn decode_index_key(encoded: &str) -> (String, String) {
    match encoded.split_once('\0') {
        Some((secondary, primary)) => (secondary.to_string(), primary.to_string()),
        None => (encoded.to_string(), String::new()),
    }
}

/// Derives the secondary key for `value` under `definition`, by walking
/// `json_pointer` into it and rendering the result as a string.
///
/// Returns `None` when the pointer is missing and `definition.allow_empty`
/// is false, signaling the caller should skip this value rather than
/// index it — spec.md: "if `allowEmpty` is false, entries missing the
/// path are skipped, not an error".
pub fn secondary_key_for(value: &JsonValue, definition: &IndexDefinition) -> Option<String> {
    match value.pointer(&definition.json_pointer) {
        Some(found) => Some(json_value_to_index_key(found)),
        None if definition.allow_empty => Some(String::new()),
        None => None,
    }
}

fn json_value_to_index_key(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_decode_roundtrips() {
        let encoded = encode_index_key("smith", "user/1");
        assert_eq!(encoded, "smith\0user/1");
        assert_eq!(
            decode_index_key(&encoded),
            ("smith".to_string(), "user/1".to_string())
        );
    }

    #[test]
    fn secondary_key_reads_json_pointer() {
        let def = IndexDefinition {
            name: "by_name".into(),
            json_pointer: "/name".into(),
            key_prefix: String::new(),
            allow_empty: false,
        };
        let value = json!({"name": "Carol"});
        assert_eq!(secondary_key_for(&value, &def), Some("Carol".to_string()));
    }

    #[test]
    fn missing_pointer_skips_unless_allow_empty() {
        let def = IndexDefinition {
            name: "by_name".into(),
            json_pointer: "/name".into(),
            key_prefix: String::new(),
            allow_empty: false,
        };
        let value = json!({"other": 1});
        assert_eq!(secondary_key_for(&value, &def), None);

        let def_allow = IndexDefinition {
            allow_empty: true,
            ..def
        };
        assert_eq!(secondary_key_for(&value, &def_allow), Some(String::new()));
    }
}
