//! Relay configuration loading.
//!
//! Environment variables are the sole config source, read once at boot.
//! Every option has a default suitable for a single local replica; a
//! multi-replica deployment sets `REPLICA_ID`, `DIRECTORY_MODE=shared` and
//! `DIRECTORY_URL`.

use relay_protocol::kinds;
use std::collections::HashMap;
use std::env;
use std::time::Duration;
use tracing::warn;

/// Whether the directory is backed by the external coordination service or
/// a process-local map (single replica, no forwarding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryMode {
    Shared,
    Disabled,
}

impl DirectoryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub replica_id: String,
    pub directory_mode: DirectoryMode,
    pub directory_url: Option<String>,
    pub ping_interval: Duration,
    pub cleanup_interval: Duration,
    pub outbound_queue_capacity: usize,
    /// host:port peers use to reach this replica; defaults to the
    /// `{replica_id}.internal:{port}` scheme when unset.
    pub advertise_addr: Option<String>,
    /// Accepted API keys; empty selects the permissive dev-mode hook.
    pub api_keys: Vec<String>,
    /// Per-kind request timeout overrides on top of the built-in defaults.
    pub kind_timeout_overrides: HashMap<String, Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 3010,
            replica_id: "local".to_owned(),
            directory_mode: DirectoryMode::Disabled,
            directory_url: None,
            ping_interval: Duration::from_millis(20_000),
            cleanup_interval: Duration::from_millis(15_000),
            outbound_queue_capacity: 256,
            advertise_addr: None,
            api_keys: Vec::new(),
            kind_timeout_overrides: HashMap::new(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let directory_mode = match env::var("DIRECTORY_MODE").as_deref() {
            Ok("shared") => DirectoryMode::Shared,
            Ok("disabled") | Err(_) => DirectoryMode::Disabled,
            Ok(other) => {
                warn!(mode = %other, "unknown DIRECTORY_MODE, falling back to disabled");
                DirectoryMode::Disabled
            }
        };
        Self {
            port: env_parse("PORT", defaults.port),
            replica_id: env::var("REPLICA_ID").unwrap_or(defaults.replica_id),
            directory_mode,
            directory_url: env::var("DIRECTORY_URL").ok(),
            ping_interval: Duration::from_millis(env_parse("PING_INTERVAL_MS", 20_000)),
            cleanup_interval: Duration::from_millis(env_parse("CLEANUP_INTERVAL_MS", 15_000)),
            outbound_queue_capacity: env_parse(
                "OUTBOUND_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            ),
            advertise_addr: env::var("ADVERTISE_ADDR").ok(),
            api_keys: env::var("API_KEYS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(ToOwned::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            kind_timeout_overrides: env::var("KIND_TIMEOUTS_MS")
                .ok()
                .map(|raw| parse_kind_timeouts(&raw))
                .unwrap_or_default(),
        }
    }

    /// The deadline for a pending request of `kind`.
    pub fn timeout_for(&self, kind: &str) -> Duration {
        if let Some(overridden) = self.kind_timeout_overrides.get(kind) {
            return *overridden;
        }
        default_kind_timeout(kind)
    }

    /// TTL for directory records; outlives one missed liveness sweep so a
    /// crashed replica's entries expire on their own.
    pub fn directory_ttl(&self) -> Duration {
        self.cleanup_interval * 2 + Duration::from_secs(5)
    }

    /// Idle threshold past which a client is evicted.
    pub fn eviction_threshold(&self) -> Duration {
        self.cleanup_interval * 2
    }

    /// The single documented reachable-peer scheme, used when the peer has
    /// not published an address in the directory.
    pub fn peer_fallback_addr(&self, replica_id: &str) -> String {
        format!("{replica_id}.internal:{}", self.port)
    }
}

fn default_kind_timeout(kind: &str) -> Duration {
    match kind {
        kinds::VIEW | kinds::DOWNLOAD => Duration::from_secs(20),
        kinds::UPLOAD => Duration::from_secs(30),
        _ => Duration::from_secs(10),
    }
}

/// `KIND_TIMEOUTS_MS` is a JSON object of kind -> milliseconds, e.g.
/// `{"search": 5000}`.  Unparseable input is ignored with a warning.
fn parse_kind_timeouts(raw: &str) -> HashMap<String, Duration> {
    match serde_json::from_str::<HashMap<String, u64>>(raw) {
        Ok(map) => map
            .into_iter()
            .map(|(kind, ms)| (kind, Duration::from_millis(ms)))
            .collect(),
        Err(e) => {
            warn!(error = %e, "ignoring unparseable KIND_TIMEOUTS_MS");
            HashMap::new()
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
