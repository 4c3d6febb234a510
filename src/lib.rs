//! A client-side synchronized storage engine for offline-first
//! applications: content-addressed storage, transactional mutators,
//! server sync, and change subscriptions, wired into one `Replica`
//! (spec.md §1-§9).
//!
//! This crate is the thin facade over the per-layer crates
//! (`tidepool-core`, `tidepool-storage`, `tidepool-concurrency`,
//! `tidepool-btree`, `tidepool-durability`, `tidepool-sync`,
//! `tidepool-sub`) — it owns no algorithm of its own beyond wiring
//! them together and the background-task scheduling spec.md §5
//! describes, matching the facade/substrate split the per-crate layer
//! was grounded on.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod replica;
mod scheduler;

pub use replica::Replica;
pub use scheduler::Scheduler;

pub use tidepool_core::{
    ClientGroupId, ClientId, CookieOrder, EngineConfig, Error, Hash, IndexDefinition, JsonValue,
    LexicalCookieOrder, MutationContext, Mutator, MutatorRegistry, NumericCookieOrder, Result,
};
pub use tidepool_durability::WriteTxResult;
pub use tidepool_storage::{KvStore, MemKvStore, Perdag};
pub use tidepool_sub::{OnData, SubscriptionBody, SubscriptionId};
pub use tidepool_sync::{
    BeginPullOutcome, MaybeEndPullOutcome, NullPuller, NullPusher, PullerResult, PushOutcome,
    Puller, Pusher, PusherResult, RecoveryOutcome, RecoverySummary, SiblingDatabase,
};
