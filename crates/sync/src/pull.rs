//! Pull, rebase, and `maybeEndPull` (spec.md §4.6, C9).
//!
//! `beginPull` applies the server's patch on a separate `sync` branch
//! so the main branch is never touched by a pull that turns out to be
//! stale; `maybe_end_pull` then either fast-forwards (no pending local
//! mutations to replay) or hands the caller the mutations it must
//! rebase one at a time via [`tidepool_durability::rebase_mutations`]
//! before calling `maybe_end_pull` again.

use tidepool_concurrency::Memdag;
use tidepool_core::{ClientGroupId, ClientId, CommitData, CookieOrder, Error, Hash, MutationIdMap, MutatorRegistry, Result};
use tidepool_durability::commit::{base_snapshot_from_hash, compare_cookies_for_snapshots, local_mutations_greater_than, Commit};
use tidepool_durability::rebase::rebase_mutations;

use crate::wire::{PatchOp, PullRequest, PullResponse, PullResponseOk, Puller, PushResponseError};

/// Name of the transient branch a pull's candidate snapshot lives on
/// until `maybe_end_pull` either discards it (stale) or folds it into
/// `main` (spec.md §4.6 step 4b, "sync head").
pub const SYNC_HEAD: &str = "sync";

/// What [`begin_pull`] produced.
pub enum BeginPullOutcome {
    /// The server doesn't recognize this client (spec.md §4.6 step 3).
    ClientStateNotFound,
    /// A candidate snapshot was written to [`SYNC_HEAD`]; hand its hash
    /// to [`maybe_end_pull`].
    Applied {
        /// Transport-level status.
        http_status_code: u16,
        /// The new sync-branch snapshot's hash.
        sync_head: Hash,
    },
}

/// spec.md §4.6 `beginPull`: posts a pull request for `client_id`'s
/// current cookie and, on success, applies the response patch onto a
/// fresh snapshot on [`SYNC_HEAD`].
pub fn begin_pull(
    memdag: &Memdag,
    head_name: &str,
    client_id: ClientId,
    client_group_id: ClientGroupId,
    profile_id: &str,
    schema_version: &str,
    pull_version: u32,
    puller: &dyn Puller,
    auth: &str,
) -> Result<BeginPullOutcome> {
    let head_hash = memdag
        .get_head(head_name)
        .ok_or_else(|| Error::InvalidOperation(format!("no such head: {head_name}")))?;
    let base = base_snapshot_from_hash(&head_hash, memdag)?;
    let cookie = match base.data() {
        CommitData::Snapshot { cookie, .. } => cookie.clone(),
        CommitData::Local { .. } => unreachable!("base_snapshot_from_hash always returns a snapshot"),
    };

    let request = PullRequest {
        pull_version,
        profile_id: profile_id.to_string(),
        client_id,
        client_group_id: Some(client_group_id),
        cookie,
        schema_version: schema_version.to_string(),
    };
    let result = puller.pull(&request, auth)?;
    let status = result.http_request_info.http_status_code;
    let response = result
        .response
        .ok_or_else(|| Error::Pull("puller returned no response body".into()))?;

    let ok = match response {
        PullResponse::Error {
            error: PushResponseError::ClientStateNotFound,
        } => return Ok(BeginPullOutcome::ClientStateNotFound),
        PullResponse::Error { .. } => {
            return Err(Error::Pull("unexpected pull error response".into()))
        }
        PullResponse::Ok(ok) => ok,
    };

    let sync_snapshot_hash = apply_patch(memdag, &base, &ok)?;
    memdag.set_head(SYNC_HEAD, sync_snapshot_hash.clone());

    Ok(BeginPullOutcome::Applied {
        http_status_code: status,
        sync_head: sync_snapshot_hash,
    })
}

/// Applies a pull response's patch on top of `base`'s value tree,
/// producing a new (temp-owned) snapshot commit (spec.md §4.6 step 4a).
fn apply_patch(memdag: &Memdag, base: &Commit, response: &PullResponseOk) -> Result<Hash> {
    let mut w = tidepool_btree::BTreeWrite::new(memdag, base.data().value_hash().clone());
    for op in &response.patch {
        match op {
            PatchOp::Put { key, value } => {
                w.put(key, value.clone())?;
            }
            PatchOp::Del { key } => {
                w.del(key)?;
            }
            PatchOp::Clear => w.clear(),
        }
    }
    let value_hash = w.flush()?;

    let mut last_mutation_ids = MutationIdMap::new();
    for (client, mid) in &response.last_mutation_id_changes {
        last_mutation_ids.set(*client, *mid);
    }
    // Any client this response didn't mention keeps its prior
    // acknowledged id (spec.md §3: "lastMutationIDs ... per client").
    if let CommitData::Snapshot {
        last_mutation_ids: prior,
        ..
    } = base.data()
    {
        for (client, mid) in prior.iter() {
            if response.last_mutation_id_changes.get(&client).is_none() {
                last_mutation_ids.set(client, mid);
            }
        }
    }

    let data = CommitData::Snapshot {
        basis_hash: None,
        last_mutation_ids,
        cookie: response.cookie.clone(),
        value_hash,
        indexes: base.data().indexes().to_vec(),
    };
    let chunk = Commit::new_chunk(memdag, data);
    Ok(chunk.hash().clone())
}

/// What [`maybe_end_pull`] decided.
pub enum MaybeEndPullOutcome {
    /// The sync branch's snapshot was older than (or equal to) the
    /// current main-branch base snapshot; the pull is stale and has
    /// been discarded (spec.md §4.6 step 1).
    Stale,
    /// The sync branch folded cleanly onto main; here are the
    /// resulting diffs (spec.md §4.6 step 3).
    Ended {
        /// New main-branch head hash.
        head_hash: Hash,
        /// Primary-tree diff.
        diff: Vec<tidepool_btree::DiffOp>,
        /// Per-index diffs, keyed by index name.
        index_diffs: std::collections::HashMap<String, Vec<tidepool_btree::DiffOp>>,
    },
    /// Local mutations still sit on top of main that must be rebased
    /// onto `sync_head` before calling this again (spec.md §4.6 step
    /// 4).
    ReplayNeeded {
        /// The mutations to rebase, oldest first.
        mutations: Vec<Commit>,
    },
}

/// spec.md §4.6 `maybeEndPull`.
pub fn maybe_end_pull(
    memdag: &Memdag,
    head_name: &str,
    sync_head: &Hash,
    client_id: ClientId,
    cookie_order: &dyn CookieOrder,
) -> Result<MaybeEndPullOutcome> {
    let sync_snapshot = Commit::from_hash(sync_head, memdag)?;
    let main_head_hash = memdag
        .get_head(head_name)
        .ok_or_else(|| Error::InvalidOperation(format!("no such head: {head_name}")))?;
    let main_base = base_snapshot_from_hash(&main_head_hash, memdag)?;

    if compare_cookies_for_snapshots(&sync_snapshot, &main_base, cookie_order)?.is_lt() {
        memdag.remove_head(SYNC_HEAD);
        return Ok(MaybeEndPullOutcome::Stale);
    }

    let floor = match sync_snapshot.data() {
        CommitData::Snapshot {
            last_mutation_ids, ..
        } => last_mutation_ids.clone(),
        CommitData::Local { .. } => {
            return Err(Error::InvalidOperation(
                "maybe_end_pull: sync head is not a snapshot".into(),
            ))
        }
    };
    let mut pending = local_mutations_greater_than(&main_head_hash, &floor, memdag)?;
    pending.reverse(); // oldest first

    if pending.is_empty() {
        let old_base_value = main_base.data().value_hash().clone();
        let new_value = sync_snapshot.data().value_hash().clone();
        let diff = tidepool_btree::diff(memdag, &old_base_value, &new_value)?;

        let mut index_diffs = std::collections::HashMap::new();
        for record in sync_snapshot.data().indexes() {
            let before = main_base
                .data()
                .indexes()
                .iter()
                .find(|r| r.definition.name == record.definition.name)
                .map(|r| r.value_hash.clone())
                .unwrap_or_else(|| tidepool_btree::empty_root(memdag));
            if before != record.value_hash {
                let d = tidepool_btree::diff(memdag, &before, &record.value_hash)?;
                if !d.is_empty() {
                    index_diffs.insert(record.definition.name.clone(), d);
                }
            }
        }

        memdag.set_head(head_name, sync_head.clone());
        memdag.remove_head(SYNC_HEAD);
        let _ = client_id;
        return Ok(MaybeEndPullOutcome::Ended {
            head_hash: sync_head.clone(),
            diff,
            index_diffs,
        });
    }

    Ok(MaybeEndPullOutcome::ReplayNeeded { mutations: pending })
}

/// Rebases `mutations` (oldest first, as returned by
/// [`MaybeEndPullOutcome::ReplayNeeded`]) onto `sync_head` and leaves
/// `head_name`'s memdag head pointed at the result — the caller should
/// call [`maybe_end_pull`] again afterward (spec.md §4.6: "caller will
/// rebase each mutation and call maybeEndPull again").
pub fn rebase_onto_sync_head(
    memdag: &Memdag,
    head_name: &str,
    sync_head: &Hash,
    mutations: &[Commit],
    registry: &MutatorRegistry,
) -> Result<Hash> {
    let onto = Commit::from_hash(sync_head, memdag)?;
    rebase_mutations(memdag, &onto, mutations, registry, head_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tidepool_core::{JsonValue, MutationContext, Mutator, NumericCookieOrder};
    use tidepool_durability::commit::genesis_snapshot;
    use tidepool_durability::transaction::{ReadTx, WriteTx};
    use tidepool_storage::{kv::MemKvStore, perdag::Perdag};

    struct PutMutator;
    impl Mutator for PutMutator {
        fn apply(&self, ctx: &mut dyn MutationContext, args: JsonValue) -> Result<()> {
            ctx.put(args["key"].as_str().unwrap(), args["value"].clone())
        }
    }

    struct ScriptedPuller {
        cookie: JsonValue,
        last_mutation_id_changes: std::collections::BTreeMap<ClientId, tidepool_core::MutationId>,
        patch: Vec<PatchOp>,
    }

    impl Puller for ScriptedPuller {
        fn pull(&self, _req: &PullRequest, _auth: &str) -> Result<crate::wire::PullerResult> {
            Ok(crate::wire::PullerResult {
                http_request_info: crate::wire::HttpRequestInfo {
                    http_status_code: 200,
                    error_message: None,
                },
                response: Some(PullResponse::Ok(PullResponseOk {
                    cookie: self.cookie.clone(),
                    last_mutation_id_changes: self.last_mutation_id_changes.clone(),
                    patch: self.patch.clone(),
                })),
            })
        }
    }

    fn new_memdag() -> Memdag {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        Memdag::new(perdag, tidepool_concurrency::DEFAULT_CACHE_BYTES)
    }

    /// spec.md §8 S3: pull rebases local mutations.
    #[test]
    fn pull_rebases_local_mutation_on_top_of_server_patch() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);
        let client = ClientId::new();
        let group = ClientGroupId::new();

        let mut tx = WriteTx::open(&memdag, "main", client, "put", json!({"key": "a", "value": 1}), 0)
            .unwrap();
        tx.run(&PutMutator).unwrap();
        tx.commit_to("main").unwrap();

        let puller = ScriptedPuller {
            cookie: json!(2),
            last_mutation_id_changes: [(client, 4)].into_iter().collect(),
            patch: vec![
                PatchOp::Put {
                    key: "a".into(),
                    value: json!(2),
                },
                PatchOp::Put {
                    key: "b".into(),
                    value: json!(9),
                },
            ],
        };

        let outcome =
            begin_pull(&memdag, "main", client, group, "profile", "1", 1, &puller, "tok").unwrap();
        let sync_head = match outcome {
            BeginPullOutcome::Applied { sync_head, .. } => sync_head,
            _ => panic!("expected Applied"),
        };

        let order = NumericCookieOrder;
        let outcome = maybe_end_pull(&memdag, "main", &sync_head, client, &order).unwrap();
        let mutations = match outcome {
            MaybeEndPullOutcome::ReplayNeeded { mutations } => mutations,
            _ => panic!("expected ReplayNeeded since m1 (mid=1) > floor(0)"),
        };
        assert_eq!(mutations.len(), 1);

        let mut registry = MutatorRegistry::new();
        registry.register("put", Arc::new(PutMutator));
        rebase_onto_sync_head(&memdag, "main", &sync_head, &mutations, &registry).unwrap();

        let outcome = maybe_end_pull(&memdag, "main", &sync_head, client, &order).unwrap();
        match outcome {
            MaybeEndPullOutcome::Ended { diff, .. } => {
                assert_eq!(diff.len(), 2);
            }
            _ => panic!("expected Ended after rebasing the only pending mutation"),
        }

        let read = ReadTx::open(&memdag, "main").unwrap();
        assert_eq!(read.get("a").unwrap(), Some(json!(1)));
        assert_eq!(read.get("b").unwrap(), Some(json!(9)));
        assert_eq!(read.commit().data().mutation_id(client), 4);
    }

    #[test]
    fn stale_pull_is_discarded() {
        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);
        let client = ClientId::new();

        // Main has already advanced past cookie 5 by the time this
        // (older) sync snapshot is evaluated.
        let newer = Commit::new_chunk(
            &memdag,
            CommitData::Snapshot {
                basis_hash: None,
                last_mutation_ids: MutationIdMap::new(),
                cookie: json!(5),
                value_hash: tidepool_btree::empty_root(&memdag),
                indexes: vec![],
            },
        );
        memdag.set_head("main", newer.hash().clone());

        let stale = Commit::new_chunk(
            &memdag,
            CommitData::Snapshot {
                basis_hash: None,
                last_mutation_ids: MutationIdMap::new(),
                cookie: json!(1),
                value_hash: tidepool_btree::empty_root(&memdag),
                indexes: vec![],
            },
        );
        memdag.set_head(SYNC_HEAD, stale.hash().clone());

        let order = NumericCookieOrder;
        let outcome =
            maybe_end_pull(&memdag, "main", stale.hash(), client, &order).unwrap();
        assert!(matches!(outcome, MaybeEndPullOutcome::Stale));
        assert_eq!(memdag.get_head(SYNC_HEAD), None);
    }

    #[test]
    fn client_state_not_found_is_surfaced() {
        struct NotFoundPuller;
        impl Puller for NotFoundPuller {
            fn pull(&self, _req: &PullRequest, _auth: &str) -> Result<crate::wire::PullerResult> {
                Ok(crate::wire::PullerResult {
                    http_request_info: crate::wire::HttpRequestInfo {
                        http_status_code: 200,
                        error_message: None,
                    },
                    response: Some(PullResponse::Error {
                        error: PushResponseError::ClientStateNotFound,
                    }),
                })
            }
        }

        let memdag = new_memdag();
        let genesis_hash = genesis_snapshot(&memdag).hash().clone();
        memdag.set_head("main", genesis_hash);
        let outcome = begin_pull(
            &memdag,
            "main",
            ClientId::new(),
            ClientGroupId::new(),
            "profile",
            "1",
            1,
            &NotFoundPuller,
            "tok",
        )
        .unwrap();
        assert!(matches!(outcome, BeginPullOutcome::ClientStateNotFound));
    }
}
