//! Mutation recovery: drive unacknowledged mutations in *other* local
//! databases through push/pull on behalf of their owning clients
//! (spec.md §4.9, C12).
//!
//! This never touches the calling instance's own state (spec.md §8 S5:
//! "No changes to this instance's own state") — everything here reads
//! and writes only the sibling's [`Perdag`], through a throwaway
//! [`Memdag`] built just for the recovery pass.

use std::sync::Arc;
use tidepool_concurrency::Memdag;
use tidepool_core::{ClientGroupId, Error, Result};
use tidepool_storage::{KvStore, Perdag};

use crate::pull::{begin_pull, BeginPullOutcome};
use crate::push::{push, PushOutcome};
use crate::registry::{get_client_groups, set_client_groups};
use crate::wire::{Puller, Pusher};

/// 10 MiB, spec.md §4.9 step a's bound on the temporary recovery store.
pub const RECOVERY_CACHE_BYTES: u64 = 10 * 1024 * 1024;

/// One other local database this instance can see (spec.md §4.9: "each
/// *other* IndexedDB-like database advertised by the environment that
/// matches this Replicache `name`").
pub struct SiblingDatabase<K: KvStore> {
    /// The database's logical name, for diagnostics.
    pub name: String,
    /// Its perdag. Recovery never opens the sibling's own memdag; it
    /// only ever builds a fresh, throwaway one over this.
    pub perdag: Arc<Perdag<K>>,
}

/// What happened to one client group during a recovery pass.
#[derive(Debug)]
pub enum RecoveryOutcome {
    /// Nothing to do: no pending mutations.
    NothingPending,
    /// The server acknowledged up through this mutation id.
    Advanced {
        /// The group recovered.
        client_group_id: ClientGroupId,
        /// The new acknowledged mutation id ceiling.
        last_server_ackd_mutation_id: u64,
    },
    /// The server (or local group state) reported `ClientStateNotFound`;
    /// the group was deleted from the sibling's registry.
    Deleted(ClientGroupId),
    /// Push or pull failed; logged and skipped (spec.md §4.9: "Errors
    /// are logged; recovery never propagates to the owning instance").
    Failed {
        /// The group that failed to recover.
        client_group_id: ClientGroupId,
        /// What went wrong.
        error: String,
    },
}

/// Tally of one [`recover_mutations`] pass.
#[derive(Debug, Default)]
pub struct RecoverySummary {
    /// Per-group outcomes, in the order groups were visited.
    pub outcomes: Vec<RecoveryOutcome>,
}

/// Runs one mutation-recovery pass (spec.md §4.9) over `siblings`,
/// pushing and pulling on behalf of every client group with pending
/// (unacknowledged) mutations, using this instance's own
/// `pusher`/`puller`/`auth`.
///
/// Callers are expected to guard this with their own `online` check and
/// re-entrancy flag, and to call it on a 5-minute tick — both are
/// scheduling concerns owned by the embedding facade, not this
/// function (spec.md §5).
#[allow(clippy::too_many_arguments)]
pub fn recover_mutations<K: KvStore>(
    siblings: &[SiblingDatabase<K>],
    profile_id: &str,
    schema_version: &str,
    push_version: u32,
    pull_version: u32,
    pusher: &dyn Pusher,
    puller: &dyn Puller,
    auth: &str,
) -> RecoverySummary {
    let mut summary = RecoverySummary::default();
    for sibling in siblings {
        recover_one_database(
            sibling,
            profile_id,
            schema_version,
            push_version,
            pull_version,
            pusher,
            puller,
            auth,
            &mut summary,
        );
    }
    summary
}

#[allow(clippy::too_many_arguments)]
fn recover_one_database<K: KvStore>(
    sibling: &SiblingDatabase<K>,
    profile_id: &str,
    schema_version: &str,
    push_version: u32,
    pull_version: u32,
    pusher: &dyn Pusher,
    puller: &dyn Puller,
    auth: &str,
    summary: &mut RecoverySummary,
) {
    let groups = match get_client_groups(&sibling.perdag) {
        Ok(g) => g,
        Err(e) => {
            tracing::error!(database = %sibling.name, error = %e, "recovery: failed to read client groups");
            return;
        }
    };

    for (&group_id, group) in groups.iter() {
        if group.disabled {
            continue;
        }
        let pending_client = group
            .mutation_ids
            .iter()
            .find(|(c, mid)| *mid > group.last_server_ackd_mutation_ids.get(*c))
            .map(|(c, _)| *c);
        let Some(client_id) = pending_client else {
            summary.outcomes.push(RecoveryOutcome::NothingPending);
            continue;
        };

        let memdag = Memdag::new(sibling.perdag.clone(), RECOVERY_CACHE_BYTES);
        memdag.set_head("main", group.head_hash.clone());

        let outcome = match push(
            &memdag,
            "main",
            client_id,
            group_id,
            profile_id,
            schema_version,
            push_version,
            pusher,
            auth,
        ) {
            Ok(PushOutcome::NothingToPush) => RecoveryOutcome::NothingPending,
            Ok(PushOutcome::ClientGroupDisabled) => {
                delete_group(&sibling.perdag, group_id, summary);
                continue;
            }
            Ok(PushOutcome::UpdateNeeded { version_type }) => RecoveryOutcome::Failed {
                client_group_id: group_id,
                error: format!("server rejected version: {version_type:?}"),
            },
            Ok(PushOutcome::Accepted { .. }) => {
                match begin_pull(
                    &memdag,
                    "main",
                    client_id,
                    group_id,
                    profile_id,
                    schema_version,
                    pull_version,
                    puller,
                    auth,
                ) {
                    Ok(BeginPullOutcome::ClientStateNotFound) => {
                        delete_group(&sibling.perdag, group_id, summary);
                        continue;
                    }
                    Ok(BeginPullOutcome::Applied { sync_head, .. }) => {
                        match advance_ack(&memdag, &sibling.perdag, group_id, client_id, &sync_head)
                        {
                            Ok(new_ackd) => RecoveryOutcome::Advanced {
                                client_group_id: group_id,
                                last_server_ackd_mutation_id: new_ackd,
                            },
                            Err(e) => RecoveryOutcome::Failed {
                                client_group_id: group_id,
                                error: e.to_string(),
                            },
                        }
                    }
                    Err(e) => RecoveryOutcome::Failed {
                        client_group_id: group_id,
                        error: e.to_string(),
                    },
                }
            }
            Err(e) => RecoveryOutcome::Failed {
                client_group_id: group_id,
                error: e.to_string(),
            },
        };
        if let RecoveryOutcome::Failed { client_group_id, error } = &outcome {
            tracing::error!(database = %sibling.name, client_group_id = %client_group_id, %error, "recovery: push/pull failed");
        }
        summary.outcomes.push(outcome);
    }
}

/// Reads the server's acknowledged mutation id for `client_id` off the
/// sync-branch snapshot `begin_pull` just wrote, then raises (never
/// lowers, never exceeds the server's own report — spec.md §8 property
/// 8) the sibling's recorded `lastServerAckdMutationIDs` to match.
/// Discards the sync branch: recovery never adopts the patch into the
/// sibling's own `main` (spec.md §8 S5 — no changes beyond the ack).
fn advance_ack<K: KvStore>(
    memdag: &Memdag,
    perdag: &Perdag<K>,
    group_id: ClientGroupId,
    client_id: tidepool_core::ClientId,
    sync_head: &tidepool_core::Hash,
) -> Result<u64> {
    let snapshot = tidepool_durability::commit::Commit::from_hash(sync_head, memdag)?;
    let ackd = match snapshot.data() {
        tidepool_core::CommitData::Snapshot {
            last_mutation_ids, ..
        } => last_mutation_ids.get(client_id),
        tidepool_core::CommitData::Local { .. } => {
            return Err(Error::Corrupt(
                "recovery: sync head is not a snapshot".into(),
            ))
        }
    };
    memdag.remove_head(crate::pull::SYNC_HEAD);

    let mut groups = get_client_groups(perdag)?;
    let mut record = groups
        .get(group_id)
        .cloned()
        .ok_or_else(|| Error::ClientStateNotFound {
            reason: format!("client group {group_id} vanished mid-recovery"),
        })?;
    let current = record.last_server_ackd_mutation_ids.get(client_id);
    let new_value = ackd.max(current);
    record.last_server_ackd_mutation_ids.set(client_id, new_value);
    groups.insert(group_id, record);
    set_client_groups(perdag, &groups)?;
    Ok(new_value)
}

fn delete_group<K: KvStore>(
    perdag: &Perdag<K>,
    group_id: ClientGroupId,
    summary: &mut RecoverySummary,
) {
    match get_client_groups(perdag) {
        Ok(mut groups) => {
            groups.remove(&group_id);
            if let Err(e) = set_client_groups(perdag, &groups) {
                summary.outcomes.push(RecoveryOutcome::Failed {
                    client_group_id: group_id,
                    error: e.to_string(),
                });
                return;
            }
            summary.outcomes.push(RecoveryOutcome::Deleted(group_id));
        }
        Err(e) => summary.outcomes.push(RecoveryOutcome::Failed {
            client_group_id: group_id,
            error: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tidepool_core::{ClientId, JsonValue, MutationContext, Mutator, MutatorRegistry};
    use tidepool_durability::transaction::WriteTx;
    use tidepool_storage::kv::MemKvStore;

    use crate::registry::init_client;
    use crate::wire::{PullResponse, PullResponseOk, PullerResult, PushResponse, PusherResult, HttpRequestInfo};

    struct PutMutator;
    impl Mutator for PutMutator {
        fn apply(&self, ctx: &mut dyn MutationContext, args: JsonValue) -> Result<()> {
            ctx.put(args["key"].as_str().unwrap(), args["value"].clone())
        }
    }

    struct ScriptedPuller {
        last_mutation_id: u64,
    }

    impl Puller for ScriptedPuller {
        fn pull(&self, req: &crate::wire::PullRequest, _auth: &str) -> Result<PullerResult> {
            Ok(PullerResult {
                http_request_info: HttpRequestInfo {
                    http_status_code: 200,
                    error_message: None,
                },
                response: Some(PullResponse::Ok(PullResponseOk {
                    cookie: json!(1),
                    last_mutation_id_changes: vec![(req.client_id, self.last_mutation_id)]
                        .into_iter()
                        .collect(),
                    patch: vec![],
                })),
            })
        }
    }

    #[test]
    fn recovery_advances_ack_without_touching_pending_mutations_elsewhere() {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        let memdag = Memdag::new(perdag.clone(), tidepool_concurrency::DEFAULT_CACHE_BYTES);
        let mut registry = MutatorRegistry::new();
        registry.register("put", Arc::new(PutMutator));

        let (client, group, _) = init_client(&perdag, &memdag, &["put".to_string()], &[], 0).unwrap();
        for (key, value) in [("a", 1), ("b", 2)] {
            let mut tx =
                WriteTx::open(&memdag, "main", client, "put", json!({"key": key, "value": value}), 0)
                    .unwrap();
            tx.run(&PutMutator).unwrap();
            tx.commit_to("main").unwrap();
        }
        crate::persist::persist(&perdag, &memdag, "main", group, &registry).unwrap();

        let mut groups = get_client_groups(&perdag).unwrap();
        let group_record = groups.get(group).unwrap().clone();
        assert_eq!(group_record.mutation_ids.get(client), 2);
        assert_eq!(group_record.last_server_ackd_mutation_ids.get(client), 0);
        drop(groups);

        struct RecordingPusher(Mutex<u32>);
        impl Pusher for RecordingPusher {
            fn push(&self, _req: &crate::wire::PushRequest, _auth: &str) -> Result<PusherResult> {
                *self.0.lock().unwrap() += 1;
                Ok(PusherResult {
                    http_request_info: HttpRequestInfo {
                        http_status_code: 200,
                        error_message: None,
                    },
                    response: Some(PushResponse {
                        error: None,
                        version_type: None,
                    }),
                })
            }
        }

        let pusher = RecordingPusher(Mutex::new(0));
        let puller = ScriptedPuller { last_mutation_id: 2 };

        let sibling = SiblingDatabase {
            name: "sibling".to_string(),
            perdag: perdag.clone(),
        };
        let summary = recover_mutations(
            &[sibling],
            "profile",
            "1",
            1,
            1,
            &pusher,
            &puller,
            "token",
        );

        assert_eq!(*pusher.0.lock().unwrap(), 1);
        assert!(matches!(
            summary.outcomes[0],
            RecoveryOutcome::Advanced {
                last_server_ackd_mutation_id: 2,
                ..
            }
        ));

        let groups = get_client_groups(&perdag).unwrap();
        assert_eq!(groups.get(group).unwrap().last_server_ackd_mutation_ids.get(client), 2);
        assert_eq!(groups.get(group).unwrap().mutation_ids.get(client), 2);
        assert!(memdag.get_head(SYNC_HEAD_FOR_TEST).is_none());
    }

    const SYNC_HEAD_FOR_TEST: &str = crate::pull::SYNC_HEAD;

    #[test]
    fn client_state_not_found_deletes_group() {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        let memdag = Memdag::new(perdag.clone(), tidepool_concurrency::DEFAULT_CACHE_BYTES);
        let mut registry = MutatorRegistry::new();
        registry.register("put", Arc::new(PutMutator));
        let (client, group, _) = init_client(&perdag, &memdag, &["put".to_string()], &[], 0).unwrap();
        let mut tx = WriteTx::open(&memdag, "main", client, "put", json!({"key": "a", "value": 1}), 0)
            .unwrap();
        tx.run(&PutMutator).unwrap();
        tx.commit_to("main").unwrap();
        crate::persist::persist(&perdag, &memdag, "main", group, &registry).unwrap();

        struct RejectingPusher;
        impl Pusher for RejectingPusher {
            fn push(&self, _req: &crate::wire::PushRequest, _auth: &str) -> Result<PusherResult> {
                Ok(PusherResult {
                    http_request_info: HttpRequestInfo {
                        http_status_code: 200,
                        error_message: None,
                    },
                    response: Some(PushResponse {
                        error: Some(crate::wire::PushResponseError::ClientStateNotFound),
                        version_type: None,
                    }),
                })
            }
        }
        struct UnusedPuller;
        impl Puller for UnusedPuller {
            fn pull(&self, _req: &crate::wire::PullRequest, _auth: &str) -> Result<PullerResult> {
                unreachable!("push rejected the group before any pull happens")
            }
        }

        let sibling = SiblingDatabase {
            name: "sibling".to_string(),
            perdag: perdag.clone(),
        };
        let summary = recover_mutations(
            &[sibling],
            "profile",
            "1",
            1,
            1,
            &RejectingPusher,
            &UnusedPuller,
            "token",
        );
        assert!(matches!(summary.outcomes[0], RecoveryOutcome::Deleted(g) if g == group));
        assert!(get_client_groups(&perdag).unwrap().get(group).is_none());
    }
}
