//! Background task scheduling (spec.md §5): heartbeats, client/group
//! GC, and mutation recovery all run on their own timer, independent
//! of whatever the caller's own read/write traffic is doing.
//!
//! Grounded on the teacher's plain `std::thread` concurrency style
//! (no async runtime anywhere in this workspace) — each loop is one
//! named thread blocked on `thread::sleep`, stopped by flipping an
//! `AtomicBool` the loop checks every tick rather than by a condvar,
//! since these intervals are minutes long and a tick of slack on
//! shutdown doesn't matter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tidepool_storage::KvStore;
use tidepool_sync::SiblingDatabase;

use crate::replica::Replica;

/// Owns the background threads for one [`Replica`]: heartbeat, client
/// GC, and mutation recovery, each on the interval its
/// [`tidepool_core::EngineConfig`] names. Dropping (or calling
/// [`Scheduler::stop`]) signals every loop to exit and joins them.
pub struct Scheduler {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Starts the heartbeat and client/group GC loops for `replica`.
    /// Mutation recovery is started separately via
    /// [`Self::spawn_mutation_recovery`] since it needs a sibling-
    /// database list the facade can't discover on its own (spec.md
    /// §4.9: "advertised by the environment").
    pub fn spawn<K: KvStore + 'static>(replica: Arc<Replica<K>>, now_ms: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let now_ms = Arc::new(now_ms);

        let heartbeat_interval = replica.config().heartbeat_interval;
        let heartbeat_thread = {
            let replica = replica.clone();
            let stop = stop.clone();
            let now_ms = now_ms.clone();
            spawn_loop("tidepool-heartbeat", heartbeat_interval, stop, move || {
                if let Err(e) = replica.heartbeat(now_ms()) {
                    tracing::error!(error = %e, "heartbeat tick failed");
                }
            })
        };

        let gc_interval = replica.config().gc_interval;
        let gc_thread = {
            let replica = replica.clone();
            let stop = stop.clone();
            let now_ms = now_ms.clone();
            spawn_loop("tidepool-gc", gc_interval, stop, move || match replica.gc(now_ms()) {
                Ok((clients, groups)) => {
                    if !clients.is_empty() || !groups.is_empty() {
                        tracing::debug!(
                            stale_clients = clients.len(),
                            stale_groups = groups.len(),
                            "gc tick collected"
                        );
                    }
                }
                Err(e) => tracing::error!(error = %e, "gc tick failed"),
            })
        };

        Self {
            stop,
            threads: vec![heartbeat_thread, gc_thread],
        }
    }

    /// Starts the mutation-recovery loop (spec.md §4.9) against a
    /// fixed sibling list supplied up front. Runs on the interval
    /// named by `config.mutation_recovery_interval`.
    pub fn spawn_mutation_recovery<K: KvStore + 'static>(
        &mut self,
        replica: Arc<Replica<K>>,
        siblings: Vec<SiblingDatabase<K>>,
    ) {
        let interval = replica.config().mutation_recovery_interval;
        let stop = self.stop.clone();
        self.threads.push(spawn_loop(
            "tidepool-mutation-recovery",
            interval,
            stop,
            move || {
                let summary = replica.recover_mutations(&siblings);
                tracing::debug!(outcomes = summary.outcomes.len(), "mutation recovery tick");
            },
        ));
    }

    /// Signals every loop to exit and waits for them to finish.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

fn spawn_loop(
    name: &'static str,
    interval: Duration,
    stop: Arc<AtomicBool>,
    mut tick: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                tick();
            }
        })
        .expect("failed to spawn background thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use tidepool_core::{EngineConfig, JsonValue, MutationContext, Mutator, MutatorRegistry};
    use tidepool_storage::kv::MemKvStore;
    use tidepool_storage::perdag::Perdag;

    struct NoopMutator;
    impl Mutator for NoopMutator {
        fn apply(&self, _ctx: &mut dyn MutationContext, _args: JsonValue) -> tidepool_core::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn scheduler_stop_joins_threads_without_hanging() {
        let perdag = Arc::new(Perdag::new(MemKvStore::new()));
        let mut registry = MutatorRegistry::new();
        registry.register("noop", Arc::new(NoopMutator));
        let mut config = EngineConfig::new("test");
        config.heartbeat_interval = Duration::from_millis(10);
        config.gc_interval = Duration::from_millis(10);
        let replica = Arc::new(Replica::open(perdag, config, registry, Vec::new(), 0).unwrap());

        let now = Arc::new(AtomicI64::new(0));
        let now2 = now.clone();
        let scheduler = Scheduler::spawn(replica, move || now2.load(Ordering::Relaxed));
        std::thread::sleep(Duration::from_millis(25));
        scheduler.stop();
    }
}
