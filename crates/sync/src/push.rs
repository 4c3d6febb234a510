//! Push: collect pending local mutations and post them (spec.md §4.5,
//! C8).

use tidepool_concurrency::Memdag;
use tidepool_core::{ClientGroupId, ClientId, Result};
use tidepool_durability::local_mutations;

use crate::wire::{PushMutation, PushRequest, PushResponse, PushResponseError, Pusher, WireVersionType};

/// What [`push`] learned after a successful round trip.
pub enum PushOutcome {
    /// No pending mutations; the pusher was never invoked (spec.md
    /// §4.5 step 2).
    NothingToPush,
    /// The server accepted the mutations (or reported nothing went
    /// wrong it needs the caller to react to).
    Accepted {
        /// Transport-level status, for the caller's online/auth
        /// accounting.
        http_status_code: u16,
    },
    /// The server doesn't recognize this client group; the caller
    /// should disable it (spec.md §4.5 step 5, §8 S6).
    ClientGroupDisabled,
    /// The server rejected the schema or protocol version (spec.md
    /// §4.5 step 6).
    UpdateNeeded {
        /// Which version was rejected, if the server said.
        version_type: Option<tidepool_core::VersionType>,
    },
}

/// Runs one push cycle for `client_id` against `head_name`'s current
/// memdag state (spec.md §4.5).
///
/// Reads local mutations above the base snapshot oldest-first, and
/// if there are any, posts them via `pusher`. Never mutates the
/// memdag: push is a pure read followed by a network call (spec.md §9
/// Open Question 3 — "push is a read-only snapshot of memdag").
pub fn push(
    memdag: &Memdag,
    head_name: &str,
    client_id: ClientId,
    client_group_id: ClientGroupId,
    profile_id: &str,
    schema_version: &str,
    push_version: u32,
    pusher: &dyn Pusher,
    auth: &str,
) -> Result<PushOutcome> {
    let head_hash = match memdag.get_head(head_name) {
        Some(h) => h,
        None => {
            return Err(tidepool_core::Error::InvalidOperation(format!(
                "no such head: {head_name}"
            )))
        }
    };

    let mut locals = local_mutations(&head_hash, memdag)?;
    locals.reverse(); // oldest first, per spec.md §4.5 step 1
    if locals.is_empty() {
        return Ok(PushOutcome::NothingToPush);
    }

    // A memdag head chain may carry mutations from more than one client
    // in the same group (e.g. mutation recovery walks a sibling
    // database's client-group head, not just one client's); push only
    // ever reports on behalf of the single client it was invoked for.
    let mutations: Vec<PushMutation> = locals
        .iter()
        .filter_map(|commit| match commit.data() {
            tidepool_core::CommitData::Local {
                client_id: mutation_client,
                mutation_id,
                mutator_name,
                mutator_args,
                timestamp,
                ..
            } => {
                if *mutation_client != client_id || tidepool_durability::transaction::is_index_change(mutator_name)
                {
                    // Index-change commits are a local bookkeeping
                    // device, not a server-visible mutation.
                    None
                } else {
                    Some(PushMutation {
                        client_id: *mutation_client,
                        id: *mutation_id,
                        name: mutator_name.clone(),
                        args: mutator_args.clone(),
                        timestamp: *timestamp,
                    })
                }
            }
            tidepool_core::CommitData::Snapshot { .. } => None,
        })
        .collect();

    if mutations.is_empty() {
        return Ok(PushOutcome::NothingToPush);
    }

    let request = PushRequest {
        push_version,
        profile_id: profile_id.to_string(),
        client_group_id,
        mutations,
        schema_version: schema_version.to_string(),
    };

    let result = pusher.push(&request, auth)?;
    let status = result.http_request_info.http_status_code;
    let response = result.response.unwrap_or_default();
    match (response.error, response.version_type) {
        (Some(PushResponseError::ClientStateNotFound), _) => {
            tracing::error!(client_group_id = %client_group_id, "client group is unknown on server");
            Ok(PushOutcome::ClientGroupDisabled)
        }
        (Some(PushResponseError::VersionNotSupported), version_type) => Ok(PushOutcome::UpdateNeeded {
            version_type: version_type.map(version_type_from_wire),
        }),
        (None, _) => Ok(PushOutcome::Accepted {
            http_status_code: status,
        }),
    }
}

/// Maps a wire-level [`WireVersionType`] to the core error taxonomy's
/// [`tidepool_core::VersionType`] (kept as a free function since both
/// push and pull need it and neither owns the other).
pub fn version_type_from_wire(wire: WireVersionType) -> tidepool_core::VersionType {
    match wire {
        WireVersionType::Pull => tidepool_core::VersionType::Pull,
        WireVersionType::Schema => tidepool_core::VersionType::Schema,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tidepool_core::{JsonValue, MutationContext, Mutator};
    use tidepool_durability::commit::genesis_snapshot;
    use tidepool_durability::transaction::WriteTx;
    use tidepool_storage::{kv::MemKvStore, perdag::Perdag};

    struct PutMutator;
    impl Mutator for PutMutator {
        fn apply(&self, ctx: &mut dyn MutationContext, args: JsonValue) -> Result<()> {
            ctx.put(args["key"].as_str().unwrap(), args["value"].clone())
        }
    }

    struct RecordingPusher {
        seen: Mutex<Vec<PushRequest>>,
        error: Option<PushResponseError>,
    }

    impl Pusher for RecordingPusher {
        fn push(&self, request: &PushRequest, _auth: &str) -> Result<crate::wire::PusherResult> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(crate::wire::PusherResult {
                http_request_info: crate::wire::HttpRequestInfo {
                    http_status_code: 200,
                    error_message: None,
                },
                response: Some(PushResponse {
                    error: self.error,
                    version_type: None,
                }),
            })
        }
    }

    fn new_memdag() -> Memdag {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        Memdag::new(perdag, tidepool_concurrency::DEFAULT_CACHE_BYTES)
    }

    #[test]
    fn push_with_no_mutations_skips_pusher() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);

        let pusher = RecordingPusher {
            seen: Mutex::new(Vec::new()),
            error: None,
        };
        let outcome = push(
            &memdag,
            "main",
            ClientId::new(),
            ClientGroupId::new(),
            "profile",
            "1",
            1,
            &pusher,
            "token",
        )
        .unwrap();
        assert!(matches!(outcome, PushOutcome::NothingToPush));
        assert!(pusher.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn push_sends_mutations_in_order_with_ids() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);
        let client = ClientId::new();

        for (key, value) in [("a", 1), ("b", 2), ("c", 3)] {
            let mut tx = WriteTx::open(
                &memdag,
                "main",
                client,
                "put",
                json!({"key": key, "value": value}),
                0,
            )
            .unwrap();
            tx.run(&PutMutator).unwrap();
            tx.commit_to("main").unwrap();
        }

        let pusher = RecordingPusher {
            seen: Mutex::new(Vec::new()),
            error: None,
        };
        let outcome = push(
            &memdag,
            "main",
            client,
            ClientGroupId::new(),
            "profile",
            "1",
            1,
            &pusher,
            "token",
        )
        .unwrap();
        assert!(matches!(outcome, PushOutcome::Accepted { .. }));

        let sent = pusher.seen.lock().unwrap();
        let request = &sent[0];
        assert_eq!(request.mutations.len(), 3);
        let ids: Vec<_> = request.mutations.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn client_state_not_found_disables_group() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);
        let client = ClientId::new();
        let mut tx = WriteTx::open(&memdag, "main", client, "put", json!({"key": "a", "value": 1}), 0)
            .unwrap();
        tx.run(&PutMutator).unwrap();
        tx.commit_to("main").unwrap();

        let pusher = RecordingPusher {
            seen: Mutex::new(Vec::new()),
            error: Some(PushResponseError::ClientStateNotFound),
        };
        let outcome = push(
            &memdag,
            "main",
            client,
            ClientGroupId::new(),
            "profile",
            "1",
            1,
            &pusher,
            "token",
        )
        .unwrap();
        assert!(matches!(outcome, PushOutcome::ClientGroupDisabled));
    }

    #[test]
    fn version_not_supported_surfaces_the_servers_version_type() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);
        let client = ClientId::new();
        let mut tx = WriteTx::open(&memdag, "main", client, "put", json!({"key": "a", "value": 1}), 0)
            .unwrap();
        tx.run(&PutMutator).unwrap();
        tx.commit_to("main").unwrap();

        struct VersionRejectingPusher;
        impl Pusher for VersionRejectingPusher {
            fn push(&self, _request: &PushRequest, _auth: &str) -> Result<crate::wire::PusherResult> {
                Ok(crate::wire::PusherResult {
                    http_request_info: crate::wire::HttpRequestInfo {
                        http_status_code: 200,
                        error_message: None,
                    },
                    response: Some(PushResponse {
                        error: Some(PushResponseError::VersionNotSupported),
                        version_type: Some(WireVersionType::Schema),
                    }),
                })
            }
        }

        let outcome = push(
            &memdag,
            "main",
            client,
            ClientGroupId::new(),
            "profile",
            "1",
            1,
            &VersionRejectingPusher,
            "token",
        )
        .unwrap();
        match outcome {
            PushOutcome::UpdateNeeded { version_type } => {
                assert_eq!(version_type, Some(tidepool_core::VersionType::Schema));
            }
            _ => panic!("expected UpdateNeeded"),
        }
    }
}
