//! Content-addressed and temporary chunk identifiers.
//!
//! Mirrors the hash scheme described in the data model: a 44-character
//! opaque identifier, either derived from chunk content (perdag chunks) or
//! from a locally-generated UUID plus a monotonic counter (memdag temp
//! chunks). Two legacy 32/36-character forms are accepted on read so that
//! chunks written by an older format can still be dereferenced.
//!
//! The leading tag byte (`c` for content, `t` for temp) is an
//! implementation choice, not part of the spec; see DESIGN.md for the
//! rationale.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Total length of a current-format hash string.
pub const HASH_LEN: usize = 44;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn base36_padded(mut n: u64, width: usize) -> String {
    let mut digits = Vec::with_capacity(width);
    if n == 0 {
        digits.push(b'0');
    }
    while n > 0 {
        digits.push(BASE36_ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    while digits.len() < width {
        digits.push(b'0');
    }
    digits.reverse();
    String::from_utf8(digits).expect("base36 alphabet is ASCII")
}

/// Opaque content-address for a [`crate::chunk::Chunk`].
///
/// Equal content always produces an equal [`Hash`] (see [`Hash::of`]);
/// temp hashes (see [`Hash::new_uuid`]) are process-local and never
/// collide with a content hash.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(String);

/// Error returned when a string does not look like a valid hash.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HashParseError {
    /// The string's length didn't match any known hash format (44, 36, or 32).
    #[error("invalid hash length {0}")]
    InvalidLength(usize),
    /// The string contained characters outside the expected alphabet.
    #[error("invalid hash characters in {0:?}")]
    InvalidCharacters(String),
}

impl Hash {
    /// The sentinel hash denoting "no chunk" (e.g. an absent `basisHash`).
    pub fn empty() -> Self {
        Self("0".repeat(HASH_LEN))
    }

    /// Computes the content hash of a chunk's serialized data.
    ///
    /// Deterministic: identical bytes always produce an identical [`Hash`].
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        Self(format!("c{}", &hex[..HASH_LEN - 1]))
    }

    /// Generates a fresh temp hash, used by the memdag for chunks that have
    /// not yet been persisted.
    ///
    /// Combines a UUID v4 (so two processes never collide) with a
    /// monotonically increasing counter (so two temp hashes generated in
    /// the same process in the same instant still differ).
    pub fn new_uuid() -> Self {
        let uuid = Uuid::new_v4().simple().to_string();
        debug_assert_eq!(uuid.len(), 32);
        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("t{}{}", uuid, base36_padded(counter, 11)))
    }

    /// Parses a hash from its string form, accepting the current 44-char
    /// format as well as the two legacy formats.
    pub fn parse(s: &str) -> Result<Self, HashParseError> {
        match s.len() {
            HASH_LEN => {
                if s.starts_with('c') || s.starts_with('t') {
                    if s[1..].chars().all(|c| c.is_ascii_hexdigit()) || s == "0".repeat(HASH_LEN) {
                        Ok(Self(s.to_string()))
                    } else {
                        Err(HashParseError::InvalidCharacters(s.to_string()))
                    }
                } else if s.chars().all(|c| c == '0') {
                    Ok(Self(s.to_string()))
                } else {
                    Err(HashParseError::InvalidCharacters(s.to_string()))
                }
            }
            32 => {
                if s.chars().all(|c| c.is_ascii_hexdigit()) {
                    Ok(Self(s.to_string()))
                } else {
                    Err(HashParseError::InvalidCharacters(s.to_string()))
                }
            }
            36 => {
                if Uuid::parse_str(s).is_ok() {
                    Ok(Self(s.to_string()))
                } else {
                    Err(HashParseError::InvalidCharacters(s.to_string()))
                }
            }
            other => Err(HashParseError::InvalidLength(other)),
        }
    }

    /// True if this hash was generated locally by the memdag and has not
    /// (yet) been persisted to the perdag.
    pub fn is_temp(&self) -> bool {
        self.0.len() == HASH_LEN && self.0.starts_with('t')
    }

    /// True if this is the `emptyHash` sentinel.
    pub fn is_empty(&self) -> bool {
        self.0.chars().all(|c| c == '0')
    }

    /// Borrows the underlying string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_deterministic() {
        let a = Hash::of(b"hello world");
        let b = Hash::of(b"hello world");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), HASH_LEN);
        assert!(!a.is_temp());
    }

    #[test]
    fn different_content_differs() {
        assert_ne!(Hash::of(b"a"), Hash::of(b"b"));
    }

    #[test]
    fn temp_hashes_are_unique_and_tagged() {
        let a = Hash::new_uuid();
        let b = Hash::new_uuid();
        assert_ne!(a, b);
        assert!(a.is_temp());
        assert!(b.is_temp());
        assert_eq!(a.as_str().len(), HASH_LEN);
    }

    #[test]
    fn empty_hash_roundtrips() {
        let e = Hash::empty();
        assert!(e.is_empty());
        assert_eq!(Hash::parse(e.as_str()).unwrap(), e);
    }

    #[test]
    fn legacy_formats_parse() {
        let legacy32 = "0123456789abcdef0123456789abcdef";
        assert!(Hash::parse(legacy32).is_ok());
        let legacy36 = "01234567-89ab-cdef-0123-456789abcdef";
        assert!(Hash::parse(legacy36).is_ok());
    }

    #[test]
    fn rejects_bad_length() {
        assert_eq!(
            Hash::parse("short"),
            Err(HashParseError::InvalidLength(5))
        );
    }
}
