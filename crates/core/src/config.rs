//! Engine configuration.
//!
//! `EngineConfig` plays the role of `ReplicacheOptions` in the source
//! system: it is constructed once when a replica is opened and threaded
//! through every subsystem that needs a tunable. Defaults match the
//! values named explicitly in spec.md; everything else is a reasonable
//! default an embedder can override.

use std::time::Duration;

/// Tunables for a single replica instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Logical database name; used to find sibling local databases
    /// during mutation recovery (§4.9).
    pub name: String,
    /// The profile (browser/install) this replica belongs to, sent on
    /// every push/pull request (§6). Distinct from `name`: several
    /// logical databases in the same browser profile share one
    /// `profile_id` but recover mutations independently by `name`.
    pub profile_id: String,
    /// Opaque application schema version, sent on every push/pull.
    pub schema_version: String,
    /// Wire protocol version for push requests.
    pub push_version: u32,
    /// Wire protocol version for pull requests.
    pub pull_version: u32,
    /// Bound on the memdag's source-chunk cache (§4.1). Default 100 MiB.
    pub memdag_cache_bytes: u64,
    /// Bound on chunks gathered by refresh before falling back to
    /// on-demand fetch from the perdag (§4.7). Default 5 MiB.
    pub refresh_gather_bound_bytes: u64,
    /// How long to defer a scheduled persist past a local mutation
    /// before running it regardless of idleness (§5). Default 1 s.
    pub persist_timeout: Duration,
    /// Heartbeat interval for this client's liveness record (§4.8).
    /// Default 60 s.
    pub heartbeat_interval: Duration,
    /// Interval between client/client-group GC sweeps (§4.8).
    /// Default 5 min.
    pub gc_interval: Duration,
    /// A client is GC'd once its heartbeat is older than this.
    /// Default 14 days.
    pub client_ttl: Duration,
    /// Interval between mutation-recovery sweeps of sibling local
    /// databases (§4.9). Default 5 min.
    pub mutation_recovery_interval: Duration,
    /// Max auth-refresh retries on HTTP 401 (§7).
    pub max_reauth_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "tidepool".to_string(),
            profile_id: String::new(),
            schema_version: String::new(),
            push_version: 1,
            pull_version: 1,
            memdag_cache_bytes: 100 * 1024 * 1024,
            refresh_gather_bound_bytes: 5 * 1024 * 1024,
            persist_timeout: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(5 * 60),
            client_ttl: Duration::from_secs(14 * 24 * 60 * 60),
            mutation_recovery_interval: Duration::from_secs(5 * 60),
            max_reauth_retries: 8,
        }
    }
}

impl EngineConfig {
    /// Starts from defaults with the given logical database name.
    /// `profile_id` defaults to the same string; override it directly
    /// if several database names share one profile.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            profile_id: name.clone(),
            name,
            ..Default::default()
        }
    }
}
