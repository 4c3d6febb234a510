//! Wire envelope types for the push/pull HTTP/JSON contract (spec.md §6).
//!
//! The network transport itself is out of scope (spec.md §1: "The
//! network transport (`puller`, `pusher`) — the core only consumes the
//! HTTP/JSON contract"); grounded on the request/response envelope
//! split in `crates/wire/src/json/envelope.rs`, these are the typed
//! shapes a concrete `Puller`/`Pusher` sends and receives. Unlike that
//! teacher module (which hand-writes its JSON encoder), these derive
//! `serde` directly — consistent with the rest of the workspace, where
//! every chunk and commit is already a `serde_json`-backed type and the
//! wire format must round-trip through the same JSON the server speaks.

use serde::{Deserialize, Serialize};
use tidepool_core::{ClientGroupId, ClientId, JsonValue, MutationId};

/// One pending local mutation as sent to the server (spec.md §6 push
/// request `mutations[]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushMutation {
    /// Client that produced this mutation.
    pub client_id: ClientId,
    /// The client's mutation id.
    pub id: MutationId,
    /// Registered mutator name.
    pub name: String,
    /// Mutator arguments, opaque JSON.
    pub args: JsonValue,
    /// Mutator-entry wall-clock time, in milliseconds since epoch.
    pub timestamp: i64,
}

/// Push request body (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    /// Wire protocol version for push requests.
    pub push_version: u32,
    /// The profile (browser/install) this replica belongs to.
    pub profile_id: String,
    /// The client group pushing these mutations (DD31).
    pub client_group_id: ClientGroupId,
    /// The pending mutations, oldest first.
    pub mutations: Vec<PushMutation>,
    /// Opaque application schema version.
    pub schema_version: String,
}

/// Error codes a push response may report (spec.md §6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PushResponseError {
    /// The client group is unknown to the server.
    ClientStateNotFound,
    /// The server rejects the schema or protocol version.
    VersionNotSupported,
}

/// Which version a `VersionNotSupported` response rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireVersionType {
    /// The pull protocol version.
    Pull,
    /// The application schema version.
    Schema,
}

/// Push response body (spec.md §6: "200 OK, optional body").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResponse {
    /// Set when the push was rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PushResponseError>,
    /// Present only alongside `VersionNotSupported`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_type: Option<WireVersionType>,
}

/// Pull request body (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    /// Wire protocol version for pull requests.
    pub pull_version: u32,
    /// The profile (browser/install) this replica belongs to.
    pub profile_id: String,
    /// The client requesting the pull.
    pub client_id: ClientId,
    /// The client's group (DD31).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_group_id: Option<ClientGroupId>,
    /// The memdag base snapshot's cookie as of this request.
    pub cookie: JsonValue,
    /// Opaque application schema version.
    pub schema_version: String,
}

/// One `put`/`del`/`clear` operation in a pull response patch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    /// Sets `key` to `value`.
    Put {
        /// The key to set.
        key: String,
        /// The new value.
        value: JsonValue,
    },
    /// Removes `key`.
    Del {
        /// The key to remove.
        key: String,
    },
    /// Removes every key.
    Clear,
}

/// A successful pull response body (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponseOk {
    /// The server's new cookie.
    pub cookie: JsonValue,
    /// Per-client acknowledged mutation ids as of this cookie (DD31).
    pub last_mutation_id_changes: std::collections::BTreeMap<ClientId, MutationId>,
    /// The patch to apply on top of the previous cookie's state.
    pub patch: Vec<PatchOp>,
}

/// The full space of pull responses (spec.md §6: success, or
/// `{"error":"ClientStateNotFound"}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PullResponse {
    /// `{"error":"ClientStateNotFound"}`.
    Error {
        /// Always `ClientStateNotFound` for a pull (spec.md §6).
        error: PushResponseError,
    },
    /// A successful pull.
    Ok(PullResponseOk),
}

/// Accounting info returned alongside a push/pull outcome so the
/// embedder can drive online/auth bookkeeping (spec.md §4.5 step 7).
#[derive(Debug, Clone, Default)]
pub struct HttpRequestInfo {
    /// HTTP status code of the underlying request.
    pub http_status_code: u16,
    /// Error message, if the request itself failed below the
    /// application layer (DNS, TLS, timeout, ...).
    pub error_message: Option<String>,
}

/// What a [`Pusher`] invocation returns.
pub struct PusherResult {
    /// Transport-level accounting.
    pub http_request_info: HttpRequestInfo,
    /// The application-level response body, if the transport
    /// succeeded.
    pub response: Option<PushResponse>,
}

/// What a [`Puller`] invocation returns.
pub struct PullerResult {
    /// Transport-level accounting.
    pub http_request_info: HttpRequestInfo,
    /// The application-level response body, if the transport
    /// succeeded.
    pub response: Option<PullResponse>,
}

/// The network collaborator that posts a [`PushRequest`] (spec.md §1,
/// §4.5). Deliberately out of scope for this crate's core algorithm;
/// [`crate::push::push`] only consumes this trait.
pub trait Pusher: Send + Sync {
    /// Posts `request`, with `auth` as the current bearer credential.
    fn push(&self, request: &PushRequest, auth: &str) -> tidepool_core::Result<PusherResult>;
}

/// The network collaborator that posts a [`PullRequest`] (spec.md §1,
/// §4.6).
pub trait Puller: Send + Sync {
    /// Posts `request`, with `auth` as the current bearer credential.
    fn pull(&self, request: &PullRequest, auth: &str) -> tidepool_core::Result<PullerResult>;
}

/// A [`Pusher`] that always reports "nothing to do" — the engine's
/// default when no server is configured, and the stand-in used by
/// every test in this workspace that doesn't care about the wire
/// format.
pub struct NullPusher;

impl Pusher for NullPusher {
    fn push(&self, _request: &PushRequest, _auth: &str) -> tidepool_core::Result<PusherResult> {
        Ok(PusherResult {
            http_request_info: HttpRequestInfo {
                http_status_code: 200,
                error_message: None,
            },
            response: Some(PushResponse::default()),
        })
    }
}

/// A [`Puller`] that always reports "no changes" at whatever cookie the
/// request carried.
pub struct NullPuller;

impl Puller for NullPuller {
    fn pull(&self, request: &PullRequest, _auth: &str) -> tidepool_core::Result<PullerResult> {
        Ok(PullerResult {
            http_request_info: HttpRequestInfo {
                http_status_code: 200,
                error_message: None,
            },
            response: Some(PullResponse::Ok(PullResponseOk {
                cookie: request.cookie.clone(),
                last_mutation_id_changes: std::collections::BTreeMap::new(),
                patch: Vec::new(),
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_request_roundtrips_through_json() {
        let req = PushRequest {
            push_version: 1,
            profile_id: "p1".into(),
            client_group_id: ClientGroupId::new(),
            mutations: vec![PushMutation {
                client_id: ClientId::new(),
                id: 1,
                name: "createTodo".into(),
                args: json!({"id": 1}),
                timestamp: 1000,
            }],
            schema_version: "1".into(),
        };
        let json = serde_json::to_value(&req).unwrap();
        let back: PushRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back.mutations.len(), 1);
        assert_eq!(back.mutations[0].name, "createTodo");
    }

    #[test]
    fn pull_response_error_variant_parses() {
        let raw = json!({"error": "clientStateNotFound"});
        let resp: PullResponse = serde_json::from_value(raw).unwrap();
        assert!(matches!(
            resp,
            PullResponse::Error {
                error: PushResponseError::ClientStateNotFound
            }
        ));
    }

    #[test]
    fn pull_response_ok_variant_parses() {
        let raw = json!({
            "cookie": "c2",
            "lastMutationIdChanges": {},
            "patch": [{"op": "put", "key": "a", "value": 1}]
        });
        let resp: PullResponse = serde_json::from_value(raw).unwrap();
        match resp {
            PullResponse::Ok(ok) => assert_eq!(ok.patch.len(), 1),
            _ => panic!("expected Ok variant"),
        }
    }

    #[test]
    fn null_pusher_reports_no_error() {
        let pusher = NullPusher;
        let req = PushRequest {
            push_version: 1,
            profile_id: "p".into(),
            client_group_id: ClientGroupId::new(),
            mutations: vec![],
            schema_version: "1".into(),
        };
        let result = pusher.push(&req, "token").unwrap();
        assert_eq!(result.http_request_info.http_status_code, 200);
        assert!(result.response.unwrap().error.is_none());
    }
}
