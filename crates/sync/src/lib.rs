//! Push, pull/rebase, client registry + GC, and mutation recovery
//! (spec.md §4.5-§4.9, §6, components C8, C9, C11, C12).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod persist;
pub mod pull;
pub mod push;
pub mod recovery;
pub mod refresh;
pub mod registry;
pub mod wire;

pub use persist::persist;
pub use refresh::refresh;
pub use pull::{begin_pull, maybe_end_pull, rebase_onto_sync_head, BeginPullOutcome, MaybeEndPullOutcome, SYNC_HEAD};
pub use push::{push, version_type_from_wire, PushOutcome};
pub use recovery::{recover_mutations, RecoveryOutcome, RecoverySummary, SiblingDatabase};
pub use registry::{
    gc_client_groups, gc_clients, get_client_groups, get_clients, heartbeat, init_client,
    set_client_groups, set_clients, InitClientResult,
};
pub use wire::{
    HttpRequestInfo, NullPuller, NullPusher, PatchOp, PullRequest, PullResponse, PullResponseOk,
    PullerResult, Puller, PushMutation, PushRequest, PushResponse, PushResponseError,
    PusherResult, Pusher, WireVersionType,
};
