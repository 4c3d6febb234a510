//! Error taxonomy (spec.md §7).
//!
//! `Error` is the single error type threaded through every crate in the
//! workspace; each variant corresponds to one row of the §7 error table.
//! Background loops (heartbeat, GC, mutation recovery) log-and-swallow
//! these per the propagation policy rather than surfacing them to the
//! caller — see `tidepool-sync`'s scheduler.

use crate::hash::Hash;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// The unified error type for the sync engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Dereferencing a hash absent from the DAG (§7).
    #[error("chunk not found: {0}")]
    ChunkNotFound(Hash),

    /// The client/client-group this instance represents has been
    /// garbage-collected, locally or on the server (§7).
    #[error("client state not found: {reason}")]
    ClientStateNotFound {
        /// Human-readable reason (e.g. "unknown on server").
        reason: String,
    },

    /// The server pushed a mutation id that did not immediately follow
    /// the expected value.
    #[error("invalid push: unexpected mutation id (expected {expected}, got {actual})")]
    InvalidPush {
        /// The mutation id the engine expected next.
        expected: u64,
        /// The mutation id actually supplied.
        actual: u64,
    },

    /// The server rejected the schema or protocol version in use.
    #[error("version not supported: {version_type:?}")]
    VersionNotSupported {
        /// Which version was rejected, if the server said.
        version_type: Option<VersionType>,
    },

    /// Push failed due to a network error or non-200 response.
    #[error("push error: {0}")]
    Push(String),

    /// Pull failed due to a network error or non-200 response.
    #[error("pull error: {0}")]
    Pull(String),

    /// A commit's shape was invalid, or a head referred to a chunk that
    /// was never written.
    #[error("corrupt: {0}")]
    Corrupt(String),

    /// JSON (de)serialization failure of chunk data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all for invariant violations not covered by a more specific
    /// variant (invalid arguments, programmer error, etc.).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Which version the server rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionType {
    /// The pull protocol version.
    Pull,
    /// The application schema version.
    Schema,
}

impl Error {
    /// §7: a `ChunkNotFoundError` whose hash matches a client's head is
    /// reinterpreted as "this client was garbage collected".
    pub fn as_client_state_not_found(&self) -> Option<Error> {
        match self {
            Error::ChunkNotFound(h) => Some(Error::ClientStateNotFound {
                reason: format!("chunk {h} referenced by client is missing (client GC'd)"),
            }),
            _ => None,
        }
    }

    /// True if this error should be treated as "we are offline" by
    /// `wrapInOnlineCheck` (§5 Online check).
    pub fn is_offline_error(&self) -> bool {
        matches!(self, Error::Push(_) | Error::Pull(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_not_found_converts_to_client_state_not_found() {
        let e = Error::ChunkNotFound(Hash::empty());
        assert!(e.as_client_state_not_found().is_some());
    }

    #[test]
    fn push_and_pull_errors_are_offline() {
        assert!(Error::Push("x".into()).is_offline_error());
        assert!(Error::Pull("x".into()).is_offline_error());
        assert!(!Error::Corrupt("x".into()).is_offline_error());
    }
}
