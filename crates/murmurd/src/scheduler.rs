//! Exchange scheduler: decides when to attempt, whom to attempt with, and
//! who initiates.
//!
//! Exposed as one cycle method the daemon ticks on an interval, rather than
//! its own `tokio::spawn`ed loop, so the daemon binary owns the single
//! `tokio::time::interval` and the shutdown `select!`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use murmur_net::{PeerRecord, PeerRegistry, Transport, TransportKind};

use crate::adapters::Telemetry;
use crate::config::{Config, PeerSelectionMode};
use crate::error::ExchangeError;
use crate::exchange::{run_client_exchange, ExchangeResponder};
use crate::friends::FriendStore;
use crate::history::ExchangeHistory;
use crate::store::MessageStore;

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// How strongly a dispatch cycle overrides the normal gating.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Respect cooldown, backoff, and inbound deference.
    Normal,
    /// User-triggered "refresh now": bypass cooldown and backoff, but still
    /// defer to a live inbound session from the same peer.
    SoftForced,
    /// Bypass cooldown, backoff, and inbound deference entirely.
    Forced,
}

/// Deterministic initiator election:
/// `(x,y) = sort(a,b)`, `h = SHA-256(x||y)`, initiator is `x` if the high bit
/// of `h[0]` is 1, else `y`.
pub fn elect_initiator<'a>(a: &'a str, b: &'a str) -> &'a str {
    let (x, y) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(x.as_bytes());
    hasher.update(y.as_bytes());
    let digest = hasher.finalize();
    if digest[0] & 0x80 != 0 {
        x
    } else {
        y
    }
}

/// Whether `local_id` should initiate with `peer_id`, folding in the
/// role-swap rule: once `consecutive_failures` reaches `swap_threshold`, the
/// elected initiator flips so the other side gets a turn to drive.
pub fn should_initiate(local_id: &str, peer_id: &str, consecutive_failures: u32, swap_threshold: u32) -> bool {
    let elected_is_local = elect_initiator(local_id, peer_id) == local_id;
    if consecutive_failures >= swap_threshold {
        !elected_is_local
    } else {
        elected_is_local
    }
}

/// Per-cycle counters exposed to the external `Telemetry` adapter: "what
/// happened this cycle", kept separate from "who consumes it" so nothing in
/// the dispatch loop needs to call telemetry directly.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub candidates: u64,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub role_swaps: u64,
    pub deferred_for_inbound: u64,
    pub deferred_for_cooldown: u64,
    pub deferred_not_initiator: u64,
    pub messages_received: u64,
}

#[derive(Default)]
struct StatsInner {
    candidates: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    role_swaps: AtomicU64,
    deferred_for_inbound: AtomicU64,
    deferred_for_cooldown: AtomicU64,
    deferred_not_initiator: AtomicU64,
    messages_received: AtomicU64,
}

impl StatsInner {
    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            candidates: self.candidates.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            role_swaps: self.role_swaps.load(Ordering::Relaxed),
            deferred_for_inbound: self.deferred_for_inbound.load(Ordering::Relaxed),
            deferred_for_cooldown: self.deferred_for_cooldown.load(Ordering::Relaxed),
            deferred_not_initiator: self.deferred_not_initiator.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

/// Drives one outbound dispatch cycle across every configured transport.
/// Constructed once at daemon startup and owned by the
/// binary's main loop; every field is an `Arc` so cloning into a `JoinSet`
/// task is cheap and the scheduler itself never needs to be wrapped in one.
pub struct Scheduler {
    config: Arc<dyn Config>,
    friend_store: Arc<FriendStore>,
    message_store: Arc<MessageStore>,
    history: Arc<ExchangeHistory>,
    peer_registry: Arc<PeerRegistry>,
    responder: Arc<ExchangeResponder>,
    telemetry: Arc<dyn Telemetry>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    /// One permit per transport kind: "a concurrency guard prevents more
    /// than one in-flight exchange where the underlying link would
    /// otherwise contend".
    semaphores: HashMap<TransportKind, Arc<Semaphore>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<dyn Config>,
        friend_store: Arc<FriendStore>,
        message_store: Arc<MessageStore>,
        history: Arc<ExchangeHistory>,
        peer_registry: Arc<PeerRegistry>,
        responder: Arc<ExchangeResponder>,
        telemetry: Arc<dyn Telemetry>,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Self {
        let mut by_kind = HashMap::new();
        let mut semaphores = HashMap::new();
        for transport in transports {
            let kind = transport.kind();
            semaphores.entry(kind).or_insert_with(|| Arc::new(Semaphore::new(1)));
            by_kind.insert(kind, transport);
        }
        Self {
            config,
            friend_store,
            message_store,
            history,
            peer_registry,
            responder,
            telemetry,
            transports: by_kind,
            semaphores,
        }
    }

    /// Order candidate peers for this cycle per the configured
    /// [`PeerSelectionMode`]. Both modes
    /// return every peer with a reachable transport; round-robin only
    /// changes the order, since the cooldown/backoff gate and per-transport
    /// concurrency guard are what actually bound how many get dialed.
    fn select_peers(&self, now_ms: u64) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self
            .peer_registry
            .snapshot()
            .into_iter()
            .filter(|p| !p.is_stale(now_ms, self.config.stale_threshold_ms()))
            .filter(|p| p.public_id != self.friend_store.device_id())
            .collect();

        if self.config.peer_selection_mode() == PeerSelectionMode::RoundRobin {
            let history = &self.history;
            peers.sort_by_key(|p| history.get(&p.public_id).map(|r| r.last_picked).unwrap_or(0));
        }
        peers
    }

    /// Run one dispatch cycle: select peers, gate each one, and fan out the
    /// permitted attempts concurrently across transports, bounded by a
    /// whole-cycle deadline.
    pub async fn run_cycle(&self, mode: DispatchMode) -> SchedulerStats {
        let now = now_ms();
        self.responder.reap_expired(now, self.config.session_timeout_ms());
        self.peer_registry.prune_stale(self.config.stale_threshold_ms());

        let stats = Arc::new(StatsInner::default());
        let candidates = self.select_peers(now);
        stats.candidates.fetch_add(candidates.len() as u64, Ordering::Relaxed);

        let mut joins: JoinSet<()> = JoinSet::new();
        for peer in candidates {
            let Some(kind) = self.peer_registry.best_transport(&peer.public_id) else {
                continue;
            };
            let Some(transport) = self.transports.get(&kind).cloned() else {
                continue;
            };
            let Some(address) = peer.transports.get(&kind).map(|e| e.address.clone()) else {
                continue;
            };
            let Some(semaphore) = self.semaphores.get(&kind).cloned() else {
                continue;
            };

            let local_id = self.friend_store.device_id();
            let peer_id = peer.public_id.clone();
            let config = self.config.clone();
            let friend_store = self.friend_store.clone();
            let message_store = self.message_store.clone();
            let history = self.history.clone();
            let responder = self.responder.clone();
            let telemetry = self.telemetry.clone();
            let stats = stats.clone();

            joins.spawn(async move {
                    dispatch_one(
                        mode,
                        now,
                        &local_id,
                        &peer_id,
                        &address,
                        transport.as_ref(),
                        config.as_ref(),
                        &friend_store,
                        &message_store,
                        &history,
                        &responder,
                        telemetry.as_ref(),
                        &semaphore,
                        &stats,
                    )
                    .await;
            });
        }

        let deadline = Duration::from_millis(self.config.whole_cycle_deadline_ms());
        if tokio::time::timeout(deadline, async {
                while joins.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("exchange cycle exceeded whole-cycle deadline, abandoning remaining dispatches");
            joins.shutdown().await;
        }

        stats.snapshot()
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_one(
    mode: DispatchMode,
    now: u64,
    local_id: &str,
    peer_id: &str,
    address: &str,
    transport: &dyn Transport,
    config: &dyn Config,
    friend_store: &FriendStore,
    message_store: &MessageStore,
    history: &ExchangeHistory,
    responder: &ExchangeResponder,
    telemetry: &dyn Telemetry,
    semaphore: &Semaphore,
    stats: &StatsInner,
) {
    if mode != DispatchMode::Forced && responder.has_recent_inbound_activity(peer_id, now, config.inbound_grace_ms()) {
        debug!(peer_id, "deferring outbound, live inbound session");
        stats.deferred_for_inbound.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let record = match history.get(peer_id) {
        Ok(record) => record,
        Err(err) => {
            warn!(peer_id, %err, "failed to read exchange history");
            return;
        }
    };

    if !should_initiate(local_id, peer_id, record.consecutive_failures, config.consecutive_failures_for_role_swap()) {
        stats.deferred_not_initiator.fetch_add(1, Ordering::Relaxed);
        return;
    }
    if record.consecutive_failures >= config.consecutive_failures_for_role_swap() {
        stats.role_swaps.fetch_add(1, Ordering::Relaxed);
    }

    if mode == DispatchMode::Normal {
        let cooldown_elapsed = record.last_exchange_time == 0 || now.saturating_sub(record.last_exchange_time) >= config.cooldown_ms();
        let store_version = message_store.store_version().unwrap_or(0);
        let backoff_ok = history
        .can_attempt(peer_id, now, store_version, config.backoff_base_ms(), config.backoff_max_ms())
        .unwrap_or(true);
        if !cooldown_elapsed || !backoff_ok {
            stats.deferred_for_cooldown.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    let Ok(_permit) = semaphore.acquire().await else {
        return;
    };

    let store_version = message_store.store_version().unwrap_or(0);
    if let Err(err) = history.record_attempt(peer_id, now, store_version) {
        warn!(peer_id, %err, "failed to record exchange attempt");
    }
    stats.attempts.fetch_add(1, Ordering::Relaxed);
    let _ = history.touch_picked(peer_id, now);

    let outcome = run_client_exchange(transport, address, config, friend_store, message_store, now).await;
    match outcome {
        Ok(outcome) => {
            stats.successes.fetch_add(1, Ordering::Relaxed);
            stats.messages_received.fetch_add(outcome.messages_received as u64, Ordering::Relaxed);
            if let Err(err) = history.record_success(peer_id) {
                warn!(peer_id, %err, "failed to record exchange success");
            }
            telemetry.track(
                "exchange_completed",
                &[
                    ("peer", peer_id),
                    ("common_friends", &outcome.common_friends.to_string()),
                    ("messages_received", &outcome.messages_received.to_string()),
                ],
            );
        }
        Err(err) => {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            if let Err(history_err) = history.record_failure(peer_id) {
                warn!(peer_id, %history_err, "failed to record exchange failure");
            }
            let kind = exchange_error_kind(&err);
            telemetry.track("exchange_failed", &[("peer", peer_id), ("error", kind)]);
            debug!(peer_id, %err, "exchange attempt failed");
        }
    }
}

fn exchange_error_kind(err: &ExchangeError) -> &'static str {
    match err {
        ExchangeError::InvalidInput(_) => "invalid_input",
        ExchangeError::Crypto(_) => "crypto",
        ExchangeError::Transport(_) => "transport",
        ExchangeError::ProtocolAbort(_) => "protocol_abort",
        ExchangeError::Timeout => "timeout",
        ExchangeError::ResourceExhausted(_) => "resource_exhausted",
        ExchangeError::Internal(_) => "internal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Initiator election is deterministic and symmetric regardless of
    /// argument order.
    #[test]
    fn election_is_deterministic_and_order_independent() {
        let a = "device-aaaa";
        let b = "device-bbbb";
        let first = elect_initiator(a, b);
        let second = elect_initiator(b, a);
        assert_eq!(first, second);
        assert!(first == a || first == b);
    }

    #[test]
    fn election_is_stable_across_repeated_calls() {
        let a = "11111111-1111-1111-1111-111111111111";
        let b = "22222222-2222-2222-2222-222222222222";
        let first = elect_initiator(a, b);
        for _ in 0..10 {
            assert_eq!(elect_initiator(a, b), first);
        }
    }

    /// once a peer accumulates `consecutive_failures >= 3`, the
    /// role swaps to let the other side drive.
    #[test]
    fn role_swaps_after_consecutive_failures_reach_threshold() {
        let a = "device-a";
        let b = "device-b";
        let elected_is_a = elect_initiator(a, b) == a;

        assert_eq!(should_initiate(a, b, 0, 3), elected_is_a);
        assert_eq!(should_initiate(a, b, 2, 3), elected_is_a);
        assert_eq!(should_initiate(a, b, 3, 3), !elected_is_a);
        assert_eq!(should_initiate(a, b, 10, 3), !elected_is_a);
    }

    #[test]
    fn exactly_one_side_initiates() {
        let a = "device-a";
        let b = "device-b";
        let a_initiates = should_initiate(a, b, 0, 3);
        let b_initiates = should_initiate(b, a, 0, 3);
        assert_ne!(a_initiates, b_initiates);
    }
}
