//! Daemon configuration
//!
//! `Config` is the one typed trait the core calls out to for every tunable:
//! cooldown, timeouts, backoff base/max, max messages, min-shared-contacts,
//! security profile. [`AppConfig`] is the concrete `clap`-parsed
//! implementation used by the binary; tests construct a bare struct
//! directly without going through argv.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Controls which optional message fields are disclosed on the wire and
/// how many messages an exchange round carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum SecurityProfile {
    /// Trust disabled, no PSI round, minimal disclosure. Used for the
    /// "simplified" Wi-Fi-Direct path.
    Minimal,
    /// Trust enabled, pseudonym disclosed, no location.
    Balanced,
    /// Trust enabled, pseudonym and location disclosed, larger batches.
    Open,
}

impl SecurityProfile {
    pub fn trust_enabled(self) -> bool {
        !matches!(self, SecurityProfile::Minimal)
    }

    pub fn include_pseudonym(self) -> bool {
        !matches!(self, SecurityProfile::Minimal)
    }

    pub fn include_latlang(self) -> bool {
        matches!(self, SecurityProfile::Open)
    }

    pub fn max_messages(self) -> usize {
        match self {
            SecurityProfile::Minimal => 5,
            SecurityProfile::Balanced => 20,
            SecurityProfile::Open => 50,
        }
    }
}

/// How the scheduler picks which visible peers to attempt each cycle
///.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum PeerSelectionMode {
    /// Attempt every visible peer every cycle.
    AllEachCycle,
    /// Least-recently-picked first; peers with no history are picked first.
    RoundRobin,
}

/// The external interface the exchange engine reads every tunable through
///. Kept as a trait, not a bare struct, so the daemon and
/// tests can supply different sources (CLI flags, a config file, fixed
/// test values) without the engine caring which.
pub trait Config: Send + Sync {
    fn cooldown_ms(&self) -> u64;
    fn session_timeout_ms(&self) -> u64;
    fn backoff_base_ms(&self) -> u64;
    fn backoff_max_ms(&self) -> u64;
    fn max_messages(&self) -> usize;
    fn min_shared_contacts(&self) -> u32;
    fn profile(&self) -> SecurityProfile;
    fn inbound_grace_ms(&self) -> u64;
    fn stale_threshold_ms(&self) -> u64;
    fn whole_cycle_deadline_ms(&self) -> u64;
    fn consecutive_failures_for_role_swap(&self) -> u32;
    fn data_dir(&self) -> &std::path::Path;
    fn peer_selection_mode(&self) -> PeerSelectionMode;
    fn scheduler_tick_ms(&self) -> u64;
    fn retention_tick_ms(&self) -> u64;
    fn max_tombstones(&self) -> usize;
    fn delete_outdated_enabled(&self) -> bool;
    fn delete_outdated_trust_threshold(&self) -> f64;
    fn delete_outdated_age_days(&self) -> u32;
}

/// murmurd: the Murmur mesh daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "murmurd")]
#[command(about = "Delay-tolerant opportunistic peer-to-peer messaging daemon")]
pub struct AppConfig {
    /// Data directory for persistent storage (keypair, messages, history).
    #[arg(short, long, default_value = "./data/murmurd", env = "MURMUR_DATA_DIR")]
    pub data_dir: PathBuf,

    /// TCP port the LAN transport listens on for exchange connections.
    #[arg(long, default_value_t = 41235, env = "MURMUR_TCP_PORT")]
    pub tcp_port: u16,

    /// Cooldown between outbound attempts with the same peer, in ms.
    #[arg(long, default_value_t = 60_000, env = "MURMUR_COOLDOWN_MS")]
    pub cooldown_ms: u64,

    /// Exchange session inactivity timeout, in ms.
    #[arg(long, default_value_t = 60_000)]
    pub session_timeout_ms: u64,

    /// Backoff base delay, in ms.
    #[arg(long, default_value_t = 1_000)]
    pub backoff_base_ms: u64,

    /// Backoff cap, in ms.
    #[arg(long, default_value_t = 60_000)]
    pub backoff_max_ms: u64,

    /// Minimum shared-friend count required to proceed past PSI
    ///.
    #[arg(long, default_value_t = 0)]
    pub min_shared_contacts: u32,

    /// Active security/disclosure profile.
    #[arg(long, value_enum, default_value_t = SecurityProfile::Balanced)]
    pub profile: SecurityProfile,

    /// Grace window during which an active inbound session defers outbound
    /// initiation, in ms.
    #[arg(long, default_value_t = 5_000)]
    pub inbound_grace_ms: u64,

    /// Peer staleness threshold, in ms.
    #[arg(long, default_value_t = 30_000)]
    pub stale_threshold_ms: u64,

    /// Whole-cycle dispatch deadline, in ms.
    #[arg(long, default_value_t = 45_000)]
    pub whole_cycle_deadline_ms: u64,

    /// Consecutive failures before role-swap.
    #[arg(long, default_value_t = 3)]
    pub consecutive_failures_for_role_swap: u32,

    /// How the scheduler picks which visible peers to attempt each cycle.
    #[arg(long, value_enum, default_value_t = PeerSelectionMode::RoundRobin)]
    pub peer_selection_mode: PeerSelectionMode,

    /// How often the scheduler wakes up to evaluate eligible peers, in ms.
    /// The ambient cadence a cooldown/backoff gate needs something to tick
    /// against.
    #[arg(long, default_value_t = 10_000)]
    pub scheduler_tick_ms: u64,

    /// How often the store retention pass runs, in ms.
    #[arg(long, default_value_t = 3_600_000)]
    pub retention_tick_ms: u64,

    /// Cap on the tombstone set; oldest entries evicted first past this.
    #[arg(long, default_value_t = 50_000)]
    pub max_tombstones: usize,

    /// Enable the trust-threshold-and-age retention pass on top of
    /// `cleanup_by_hearts`.
    #[arg(long, default_value_t = false)]
    pub delete_outdated_enabled: bool,

    /// Trust threshold below which `delete_outdated_enabled` removes aged
    /// messages.
    #[arg(long, default_value_t = 0.05)]
    pub delete_outdated_trust_threshold: f64,

    /// Age, in days, past which a below-threshold message is eligible for
    /// removal by `delete_outdated_enabled`.
    #[arg(long, default_value_t = 30)]
    pub delete_outdated_age_days: u32,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Log output format (json or pretty).
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config for AppConfig {
    fn cooldown_ms(&self) -> u64 {
        self.cooldown_ms
    }

    fn session_timeout_ms(&self) -> u64 {
        self.session_timeout_ms
    }

    fn backoff_base_ms(&self) -> u64 {
        self.backoff_base_ms
    }

    fn backoff_max_ms(&self) -> u64 {
        self.backoff_max_ms
    }

    fn max_messages(&self) -> usize {
        self.profile().max_messages()
    }

    fn min_shared_contacts(&self) -> u32 {
        self.min_shared_contacts
    }

    fn profile(&self) -> SecurityProfile {
        self.profile
    }

    fn inbound_grace_ms(&self) -> u64 {
        self.inbound_grace_ms
    }

    fn stale_threshold_ms(&self) -> u64 {
        self.stale_threshold_ms
    }

    fn whole_cycle_deadline_ms(&self) -> u64 {
        self.whole_cycle_deadline_ms
    }

    fn consecutive_failures_for_role_swap(&self) -> u32 {
        self.consecutive_failures_for_role_swap
    }

    fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    fn peer_selection_mode(&self) -> PeerSelectionMode {
        self.peer_selection_mode
    }

    fn scheduler_tick_ms(&self) -> u64 {
        self.scheduler_tick_ms
    }

    fn retention_tick_ms(&self) -> u64 {
        self.retention_tick_ms
    }

    fn max_tombstones(&self) -> usize {
        self.max_tombstones
    }

    fn delete_outdated_enabled(&self) -> bool {
        self.delete_outdated_enabled
    }

    fn delete_outdated_trust_threshold(&self) -> f64 {
        self.delete_outdated_trust_threshold
    }

    fn delete_outdated_age_days(&self) -> u32 {
        self.delete_outdated_age_days
    }
}

impl AppConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn whole_cycle_deadline(&self) -> Duration {
        Duration::from_millis(self.whole_cycle_deadline_ms)
    }
}

/// Persisted node state: the fields the daemon must recover identically
/// across restarts for `device_id` to stay stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Big-endian bytes of the DH-1024 secret scalar.
    pub keypair_secret: Vec<u8>,
    pub profile: SecurityProfile,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_profile_disables_trust_and_disclosure() {
        assert!(!SecurityProfile::Minimal.trust_enabled());
        assert!(!SecurityProfile::Minimal.include_pseudonym());
        assert!(!SecurityProfile::Minimal.include_latlang());
    }

    #[test]
    fn open_profile_discloses_everything() {
        assert!(SecurityProfile::Open.trust_enabled());
        assert!(SecurityProfile::Open.include_pseudonym());
        assert!(SecurityProfile::Open.include_latlang());
    }

    #[test]
    fn max_messages_scales_with_profile() {
        assert!(SecurityProfile::Open.max_messages() > SecurityProfile::Balanced.max_messages());
        assert!(SecurityProfile::Balanced.max_messages() > SecurityProfile::Minimal.max_messages());
    }
}
