//! [`Replica`]: the facade wiring every per-layer crate together into
//! one handle an embedder opens once per logical database (spec.md
//! §1, §5).

use std::sync::Arc;

use parking_lot::RwLock;
use tidepool_concurrency::Memdag;
use tidepool_core::{
    ClientGroupId, ClientId, CookieOrder, EngineConfig, Error, Hash, IndexDefinition,
    MutatorRegistry, NumericCookieOrder, Result,
};
use tidepool_durability::transaction::{IndexTx, ReadTx, WriteTx, WriteTxResult};
use tidepool_storage::{KvStore, Perdag};
use tidepool_sub::{OnData, SubscriptionBody, SubscriptionId, SubscriptionRegistry};
use tidepool_sync::wire::{NullPuller, NullPusher, Puller, Pusher};
use tidepool_sync::{
    registry as client_registry, BeginPullOutcome, MaybeEndPullOutcome, PushOutcome,
    RecoverySummary, SiblingDatabase,
};

/// Name of the head every mutation, push, pull, persist, and refresh
/// operates against. A single-head replica is all spec.md describes;
/// nothing here stops an embedder from opening several `Replica`s
/// sharing one [`Perdag`] if they want independent mutable branches.
const MAIN_HEAD: &str = "main";

/// A single logical client of the synchronized storage engine.
///
/// Owns a [`Memdag`] overlaying a [`Perdag`], this client's
/// [`ClientId`]/[`ClientGroupId`] registration, its configured
/// mutators and secondary indexes, and its live subscriptions. Every
/// mutating or syncing operation goes through `&self` — internal
/// mutability is handled by the lower layers' own locks (spec.md §5:
/// "a single write lock ... a single persist/pull lock"), so a
/// `Replica` is safe to share behind an `Arc` across threads/tasks.
pub struct Replica<K: KvStore> {
    perdag: Arc<Perdag<K>>,
    memdag: Arc<Memdag>,
    config: EngineConfig,
    registry: MutatorRegistry,
    index_definitions: RwLock<Vec<IndexDefinition>>,
    client_id: ClientId,
    client_group_id: ClientGroupId,
    cookie_order: Arc<dyn CookieOrder>,
    pusher: Arc<dyn Pusher>,
    puller: Arc<dyn Puller>,
    auth: RwLock<String>,
    subscriptions: SubscriptionRegistry,
}

impl<K: KvStore> Replica<K> {
    /// Opens a replica over `perdag`: runs `initClient` (spec.md
    /// §4.8), builds the memdag overlay, and sets the main head to
    /// whatever client group it was joined to, forked from, or
    /// created fresh.
    ///
    /// `registry.names()` and `index_definitions` together form this
    /// client's "definitions"; `initClient` uses them to decide
    /// whether an existing client group can be reused.
    pub fn open(
        perdag: Arc<Perdag<K>>,
        config: EngineConfig,
        registry: MutatorRegistry,
        index_definitions: Vec<IndexDefinition>,
        now_ms: i64,
    ) -> Result<Self> {
        Self::open_with_transport(
            perdag,
            config,
            registry,
            index_definitions,
            Arc::new(NullPusher),
            Arc::new(NullPuller),
            Arc::new(NumericCookieOrder),
            now_ms,
        )
    }

    /// [`Self::open`], overriding the default no-op transport and
    /// cookie comparator — what an embedder with a real sync server
    /// calls.
    #[allow(clippy::too_many_arguments)]
    pub fn open_with_transport(
        perdag: Arc<Perdag<K>>,
        config: EngineConfig,
        registry: MutatorRegistry,
        index_definitions: Vec<IndexDefinition>,
        pusher: Arc<dyn Pusher>,
        puller: Arc<dyn Puller>,
        cookie_order: Arc<dyn CookieOrder>,
        now_ms: i64,
    ) -> Result<Self> {
        let memdag = Arc::new(Memdag::new(perdag.clone(), config.memdag_cache_bytes));
        let mutator_names = registry.names();
        let (client_id, client_group_id, _) = client_registry::init_client(
            &perdag,
            &memdag,
            &mutator_names,
            &index_definitions,
            now_ms,
        )?;

        Ok(Self {
            perdag,
            memdag: memdag.clone(),
            config,
            registry,
            index_definitions: RwLock::new(index_definitions),
            client_id,
            client_group_id,
            cookie_order,
            pusher,
            puller,
            auth: RwLock::new(String::new()),
            subscriptions: SubscriptionRegistry::new(memdag),
        })
    }

    /// This replica's client id.
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// This replica's client group id.
    pub fn client_group_id(&self) -> ClientGroupId {
        self.client_group_id
    }

    /// Replaces the bearer credential sent with push/pull requests.
    pub fn set_auth(&self, token: impl Into<String>) {
        *self.auth.write() = token.into();
    }

    /// A read-only, snapshot-consistent view over the current main
    /// head. The returned [`ReadTx`] is pinned to whatever commit
    /// `main` pointed at when this was called, even if a concurrent
    /// mutation moves the head afterward.
    pub fn read(&self) -> Result<ReadTx<'_>> {
        ReadTx::open(&self.memdag, MAIN_HEAD)
    }

    /// Runs `mutator_name` (looked up in this replica's registry)
    /// against `args`, commits the resulting local mutation to the
    /// main head, and dispatches the commit's diff to every
    /// subscription that depends on it (spec.md §4.4, §4.2).
    pub fn mutate(
        &self,
        mutator_name: &str,
        args: tidepool_core::JsonValue,
        now_ms: i64,
    ) -> Result<WriteTxResult> {
        let mutator = self.registry.get(mutator_name).ok_or_else(|| {
            Error::InvalidOperation(format!("no such mutator: {mutator_name}"))
        })?;
        let mut tx = WriteTx::open(
            &self.memdag,
            MAIN_HEAD,
            self.client_id,
            mutator_name,
            args,
            now_ms,
        )?;
        tx.run(mutator.as_ref())?;
        let result = tx.commit_to(MAIN_HEAD)?;
        self.subscriptions
            .dispatch(MAIN_HEAD, &result.diff, &result.index_diffs)?;
        Ok(result)
    }

    /// Adds a secondary index, backfilling it from the current main
    /// head (spec.md §4.4 `IndexTx`).
    pub fn create_index(&self, definition: IndexDefinition, now_ms: i64) -> Result<WriteTxResult> {
        let result =
            IndexTx::create_index(&self.memdag, MAIN_HEAD, self.client_id, now_ms, definition.clone())?;
        self.subscriptions
            .dispatch(MAIN_HEAD, &result.diff, &result.index_diffs)?;
        self.index_definitions.write().push(definition);
        Ok(result)
    }

    /// Removes a secondary index.
    pub fn drop_index(&self, index_name: &str, now_ms: i64) -> Result<WriteTxResult> {
        let result = IndexTx::drop_index(&self.memdag, MAIN_HEAD, self.client_id, now_ms, index_name)?;
        self.index_definitions
            .write()
            .retain(|d| d.name != index_name);
        Ok(result)
    }

    /// Registers `body` to run once immediately (delivering its
    /// result to `on_data`) and again whenever a commit, pull, or
    /// rebase changes something it read (spec.md §4.2).
    pub fn subscribe(
        &self,
        body: Arc<SubscriptionBody>,
        on_data: Arc<OnData>,
    ) -> Result<SubscriptionId> {
        self.subscriptions.subscribe(MAIN_HEAD, body, on_data)
    }

    /// Cancels a subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id)
    }

    /// Runs one push cycle (spec.md §4.5): posts pending local
    /// mutations, oldest first, through this replica's configured
    /// pusher.
    pub fn push(&self) -> Result<PushOutcome> {
        tidepool_sync::push(
            &self.memdag,
            MAIN_HEAD,
            self.client_id,
            self.client_group_id,
            &self.config.profile_id,
            &self.config.schema_version,
            self.config.push_version,
            self.pusher.as_ref(),
            &self.auth.read(),
        )
    }

    /// Runs one pull cycle (spec.md §4.6): `beginPull`, then
    /// `maybeEndPull` in a loop, rebasing any pending local mutations
    /// onto the sync branch until it either goes stale or folds onto
    /// `main`. Dispatches subscriptions against the resulting diff
    /// when it folds.
    pub fn pull(&self) -> Result<MaybeEndPullOutcome> {
        let outcome = tidepool_sync::begin_pull(
            &self.memdag,
            MAIN_HEAD,
            self.client_id,
            self.client_group_id,
            &self.config.profile_id,
            &self.config.schema_version,
            self.config.pull_version,
            self.puller.as_ref(),
            &self.auth.read(),
        )?;
        let mut sync_head = match outcome {
            BeginPullOutcome::ClientStateNotFound => {
                return Err(Error::ClientStateNotFound {
                    reason: "server reported ClientStateNotFound during pull".to_string(),
                })
            }
            BeginPullOutcome::Applied { sync_head, .. } => sync_head,
        };

        loop {
            match tidepool_sync::maybe_end_pull(
                &self.memdag,
                MAIN_HEAD,
                &sync_head,
                self.client_id,
                self.cookie_order.as_ref(),
            )? {
                MaybeEndPullOutcome::Stale => return Ok(MaybeEndPullOutcome::Stale),
                MaybeEndPullOutcome::Ended {
                    head_hash,
                    diff,
                    index_diffs,
                } => {
                    self.subscriptions.dispatch(MAIN_HEAD, &diff, &index_diffs)?;
                    return Ok(MaybeEndPullOutcome::Ended {
                        head_hash,
                        diff,
                        index_diffs,
                    });
                }
                MaybeEndPullOutcome::ReplayNeeded { mutations } => {
                    sync_head = tidepool_sync::rebase_onto_sync_head(
                        &self.memdag,
                        MAIN_HEAD,
                        &sync_head,
                        &mutations,
                        &self.registry,
                    )?;
                }
            }
        }
    }

    /// Moves `main`'s base snapshot into the perdag and folds the
    /// result back into this client group's registry record (spec.md
    /// §4.7 "Persist").
    pub fn persist(&self) -> Result<Hash> {
        tidepool_sync::persist(
            &self.perdag,
            &self.memdag,
            MAIN_HEAD,
            self.client_group_id,
            &self.registry,
        )
    }

    /// Pulls the client group's perdag head into the memdag and
    /// rebases pending local mutations onto it (spec.md §4.7
    /// "Refresh").
    pub fn refresh(&self) -> Result<Hash> {
        tidepool_sync::refresh(
            &self.perdag,
            &self.memdag,
            MAIN_HEAD,
            self.client_id,
            &self.registry,
        )
    }

    /// Updates this client's liveness record (spec.md §4.8).
    pub fn heartbeat(&self, now_ms: i64) -> Result<()> {
        client_registry::heartbeat(&self.perdag, self.client_id, now_ms)
    }

    /// Runs one GC sweep: clients whose heartbeat is older than
    /// `config.client_ttl`, then client groups left unreferenced with
    /// no pending mutations (spec.md §4.8).
    pub fn gc(&self, now_ms: i64) -> Result<(Vec<ClientId>, Vec<ClientGroupId>)> {
        let stale_clients = client_registry::gc_clients(
            &self.perdag,
            now_ms,
            self.config.client_ttl.as_millis() as i64,
        )?;
        let stale_groups = client_registry::gc_client_groups(&self.perdag)?;
        Ok((stale_clients, stale_groups))
    }

    /// Drives unacknowledged mutations in sibling local databases
    /// through push/pull on their owning clients' behalf, never
    /// touching this replica's own state (spec.md §4.9).
    pub fn recover_mutations(&self, siblings: &[SiblingDatabase<K>]) -> RecoverySummary {
        tidepool_sync::recover_mutations(
            siblings,
            &self.config.profile_id,
            &self.config.schema_version,
            self.config.push_version,
            self.config.pull_version,
            self.pusher.as_ref(),
            self.puller.as_ref(),
            &self.auth.read(),
        )
    }

    /// This replica's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// This replica's currently configured secondary indexes.
    pub fn index_definitions(&self) -> Vec<IndexDefinition> {
        self.index_definitions.read().clone()
    }
}
