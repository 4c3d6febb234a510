//! Cookie ordering.
//!
//! A cookie is an opaque, application-defined JSON value establishing the
//! server's view identity. spec.md §4.3/§4.6 defer comparison to a
//! caller-supplied comparator; we define the trait plus two defaults
//! covering the common shapes (numeric and lexical-string cookies).

use crate::json::JsonValue;
use std::cmp::Ordering;

/// Total order over cookies, supplied by the embedder.
///
/// `null` is conventionally the minimum cookie (the state before any
/// snapshot has ever been pulled).
pub trait CookieOrder: Send + Sync {
    /// Compares two cookies.
    fn compare(&self, a: &JsonValue, b: &JsonValue) -> Ordering;

    /// Convenience: `a < b`.
    fn is_older(&self, a: &JsonValue, b: &JsonValue) -> bool {
        self.compare(a, b) == Ordering::Less
    }
}

/// Orders cookies that are JSON numbers (or `null`, treated as the
/// minimum). This is the engine's default.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumericCookieOrder;

impl CookieOrder for NumericCookieOrder {
    fn compare(&self, a: &JsonValue, b: &JsonValue) -> Ordering {
        match (a, b) {
            (JsonValue::Null, JsonValue::Null) => Ordering::Equal,
            (JsonValue::Null, _) => Ordering::Less,
            (_, JsonValue::Null) => Ordering::Greater,
            (JsonValue::Number(x), JsonValue::Number(y)) => {
                let xf = x.as_f64().unwrap_or(f64::NAN);
                let yf = y.as_f64().unwrap_or(f64::NAN);
                xf.partial_cmp(&yf).unwrap_or(Ordering::Equal)
            }
            _ => Ordering::Equal,
        }
    }
}

/// Orders cookies that are JSON strings (or `null`), via byte-wise
/// lexical comparison.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalCookieOrder;

impl CookieOrder for LexicalCookieOrder {
    fn compare(&self, a: &JsonValue, b: &JsonValue) -> Ordering {
        match (a, b) {
            (JsonValue::Null, JsonValue::Null) => Ordering::Equal,
            (JsonValue::Null, _) => Ordering::Less,
            (_, JsonValue::Null) => Ordering::Greater,
            (JsonValue::String(x), JsonValue::String(y)) => x.as_bytes().cmp(y.as_bytes()),
            _ => Ordering::Equal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_order_treats_null_as_minimum() {
        let o = NumericCookieOrder;
        assert!(o.is_older(&JsonValue::Null, &json!(1)));
        assert_eq!(o.compare(&json!(1), &json!(1)), Ordering::Equal);
        assert_eq!(o.compare(&json!(1), &json!(2)), Ordering::Less);
    }

    #[test]
    fn lexical_order_compares_bytes() {
        let o = LexicalCookieOrder;
        assert_eq!(o.compare(&json!("c1"), &json!("c2")), Ordering::Less);
    }
}
