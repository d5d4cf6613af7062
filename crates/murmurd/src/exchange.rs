//! Exchange state machine: the turn-based PSI-then-messages protocol driven
//! by the initiator and served by the responder's per-peer session table
//!.
//!
//! The initiator side ([`run_client_exchange`]) drives a sequence of
//! `Transport::request` calls, one per protocol step. The responder side
//! ([`ExchangeResponder`]) is transport-agnostic: it implements
//! [`murmur_net::InboundHandler`] and advances a per-peer state machine one
//! request at a time, independent of which radio delivered the bytes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use num_bigint::BigUint;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tracing::{debug, warn};
use uuid::Uuid;

use murmur_core::message::recompute_trust;
use murmur_core::psi::{PsiHash, PsiSession};
use murmur_core::wire::{ClientMessage, ExchangeInfo, ServerMessage, WireMessage};

use crate::config::Config;
use crate::error::ExchangeError;
use crate::friends::FriendStore;
use crate::store::MessageStore;

fn encode_biguints(items: &[BigUint]) -> Vec<String> {
    items.iter().map(|n| BASE64.encode(n.to_bytes_be())).collect()
}

fn decode_biguints(items: &[String]) -> Result<Vec<BigUint>, ExchangeError> {
    items
    .iter()
    .map(|s| {
            BASE64
            .decode(s)
            .map(|b| BigUint::from_bytes_be(&b))
            .map_err(|e| ExchangeError::InvalidInput(format!("bad base64 group element: {e}")))
    })
    .collect()
}

fn encode_hashes(items: &[PsiHash]) -> Vec<String> {
    items.iter().map(|h| BASE64.encode(h)).collect()
}

fn decode_hashes(items: &[String]) -> Result<Vec<PsiHash>, ExchangeError> {
    items
    .iter()
    .map(|s| {
            let bytes = BASE64
            .decode(s)
            .map_err(|e| ExchangeError::InvalidInput(format!("bad base64 hash: {e}")))?;
            PsiHash::try_from(bytes.as_slice())
            .map_err(|_| ExchangeError::InvalidInput("psi hash is not 20 bytes".into()))
    })
    .collect()
}

fn to_bytes<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ExchangeError> {
    Ok(serde_json::to_vec(value)?)
}

fn from_bytes<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ExchangeError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// What a completed exchange accomplished, for the scheduler's history/
/// telemetry bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExchangeOutcome {
    pub common_friends: u32,
    pub messages_sent: usize,
    pub messages_received: usize,
}

/// Drive one full exchange as the initiator against `peer_address`. Any
/// framing, parse, crypto, or transport failure aborts the session and
/// surfaces a typed [`ExchangeError`]; the caller is responsible for
/// recording it against history.
pub async fn run_client_exchange(
    transport: &dyn murmur_net::Transport,
    peer_address: &str,
    config: &dyn Config,
    friend_store: &FriendStore,
    message_store: &MessageStore,
    now_ms: u64,
) -> Result<ExchangeOutcome, ExchangeError> {
    let trust_enabled = config.profile().trust_enabled();
    let mut rng = OsRng;
    let exchange_id = Uuid::new_v4().to_string();

    // Step 1: PSI init.
    let my_items = if trust_enabled { friend_store.psi_items() } else { Vec::new() };
    let (psi_session, blinded) = if trust_enabled {
        let (session, blinded) = PsiSession::begin(&my_items, &mut rng)?;
        (Some(session), blinded)
    } else {
        (None, Vec::new())
    };

    let init_request = ClientMessage {
        messages: Vec::new(),
        friends: encode_biguints(&blinded),
        device_id_hash: None,
        exchange_id: Some(exchange_id.clone()),
        public_id: Some(friend_store.device_id()),
    };
    let init_reply: ClientMessage = from_bytes(&transport.request(peer_address, to_bytes(&init_request)?).await?)?;
    let peer_blinded = decode_biguints(&init_reply.friends)?;

    // Step 2: PSI exchange. common_friends stays 0 when trust is disabled.
    let common_friends: u32 = if trust_enabled {
        let session = psi_session
        .as_ref()
        .ok_or_else(|| ExchangeError::Internal("psi session missing with trust enabled".into()))?;
        let (dblind, dhash) = session.reply(&peer_blinded, &mut rng)?;
        let step2_request = ServerMessage {
            dblind: encode_biguints(&dblind),
            dhash: encode_hashes(&dhash),
        };
        let step2_reply: ServerMessage =
        from_bytes(&transport.request(peer_address, to_bytes(&step2_request)?).await?)?;

        if step2_reply.dblind.is_empty() && step2_reply.dhash.is_empty() {
            return Err(ExchangeError::ProtocolAbort(
                    "responder produced no PSI reply (insufficient shared contacts)".into(),
            ));
        }

        let peer_dblind = decode_biguints(&step2_reply.dblind)?;
        let peer_dhash = decode_hashes(&step2_reply.dhash)?;
        session.cardinality(&peer_dblind, &peer_dhash)? as u32
    } else {
        0
    };

    if trust_enabled && common_friends < config.min_shared_contacts() {
        return Err(ExchangeError::ProtocolAbort(format!(
                    "common_friends={common_friends} below min_shared_contacts={}",
                    config.min_shared_contacts()
        )));
    }

    // Step 3: count exchange.
    let outbound = message_store.get_for_exchange(common_friends, config.max_messages(), now_ms)?;
    let count_request = ExchangeInfo { count: outbound.len() as u32 };
    let count_reply: ExchangeInfo =
    from_bytes(&transport.request(peer_address, to_bytes(&count_request)?).await?)?;
    let rounds = outbound.len().max(count_reply.count as usize);

    // Step 4: message rounds.
    let my_friends = friend_store.friend_count();
    let mut received = 0usize;
    for i in 0..rounds {
        let round_messages = match outbound.get(i) {
            Some(message) => {
                let trust = recompute_trust(message.trust_score, common_friends, my_friends, &mut rng);
                vec![WireMessage::from_message(
                        message,
                        trust,
                        config.profile().include_pseudonym(),
                        config.profile().include_latlang(),
                )]
            }
            None => Vec::new(),
        };
        let round_request = ClientMessage {
            messages: round_messages,
            friends: Vec::new(),
            device_id_hash: None,
            exchange_id: Some(exchange_id.clone()),
            public_id: None,
        };
        let round_reply: ClientMessage =
        from_bytes(&transport.request(peer_address, to_bytes(&round_request)?).await?)?;

        received += merge_incoming(message_store, round_reply.messages, now_ms)?;
    }

    Ok(ExchangeOutcome {
            common_friends,
            messages_sent: outbound.len(),
            messages_received: received,
    })
}

/// Merge wire messages received in one round into the local store, patching
/// a missing `ts` and letting [`MessageStore::add`]/`update_trust` apply the
/// never-lowers-trust merge rule. Returns the count of genuinely new messages.
fn merge_incoming(store: &MessageStore, incoming: Vec<WireMessage>, now_ms: u64) -> Result<usize, ExchangeError> {
    let mut new_count = 0;
    for mut wire in incoming {
        wire.patch_missing_ts(now_ms);
        let trust = wire.trust;
        let message = wire.into_message(now_ms);
        let id = message.message_id;
        if store.add(message, now_ms)? {
            new_count += 1;
        } else {
            store.update_trust(&id, trust)?;
        }
    }
    Ok(new_count)
}

/// The responder's view of where a given peer's session currently sits.
enum ServerState {
    WaitClientFriends,
    WaitServerMessage {
        psi_session: Option<PsiSession>,
        client_blinded: Vec<BigUint>,
    },
    WaitClientCount {
        common_friends: u32,
    },
    WaitClientMessages {
        common_friends: u32,
        round: usize,
        total_rounds: usize,
        outbound: Vec<WireMessage>,
    },
}

struct Session {
    state: ServerState,
    last_activity_ms: u64,
}

/// Context the responder needs to answer a request: the local friend set,
/// message store, and active config, independent of which peer is asking.
pub struct ResponderContext<'a> {
    pub config: &'a dyn Config,
    pub friend_store: &'a FriendStore,
    pub message_store: &'a MessageStore,
}

/// Per-peer session table for the responder side of the protocol.
pub struct ExchangeResponder {
    sessions: Mutex<HashMap<String, Session>>,
}

impl ExchangeResponder {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    /// Reap sessions idle longer than `session_timeout_ms`.
    pub fn reap_expired(&self, now_ms: u64, session_timeout_ms: u64) {
        self.sessions
        .lock()
        .retain(|_, session| now_ms.saturating_sub(session.last_activity_ms) < session_timeout_ms);
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether `peer_key` has had inbound activity within `grace_ms` of
    /// `now_ms`. The scheduler checks
    /// this before initiating outbound so two devices don't open sessions
    /// in both directions at once.
    pub fn has_recent_inbound_activity(&self, peer_key: &str, now_ms: u64, grace_ms: u64) -> bool {
        self.sessions
        .lock()
        .get(peer_key)
        .map(|session| now_ms.saturating_sub(session.last_activity_ms) <= grace_ms)
        .unwrap_or(false)
    }

    /// Advance `peer_key`'s session by one request, returning the reply
    /// bytes. Any error here discards the session for `peer_key`; the next
    /// request starts fresh from `WaitClientFriends`.
    pub fn handle_request(
        &self,
        ctx: &ResponderContext<'_>,
        peer_key: &str,
        raw: &[u8],
        now_ms: u64,
    ) -> Result<Vec<u8>, ExchangeError> {
        let state = {
            let mut sessions = self.sessions.lock();
            match sessions.remove(peer_key) {
                Some(session) => session.state,
                None => ServerState::WaitClientFriends,
            }
        };

        let result = self.advance(ctx, state, raw, now_ms);
        match result {
            Ok((reply, next_state)) => {
                if let Some(next_state) = next_state {
                    self.sessions.lock().insert(
                        peer_key.to_string(),
                        Session { state: next_state, last_activity_ms: now_ms },
                    );
                } else {
                    self.sessions.lock().remove(peer_key);
                }
                Ok(reply)
            }
            Err(err) => {
                self.sessions.lock().remove(peer_key);
                Err(err)
            }
        }
    }

    fn advance(
        &self,
        ctx: &ResponderContext<'_>,
        state: ServerState,
        raw: &[u8],
        now_ms: u64,
    ) -> Result<(Vec<u8>, Option<ServerState>), ExchangeError> {
        match state {
            ServerState::WaitClientFriends => self.handle_client_friends(ctx, raw),
            ServerState::WaitServerMessage { psi_session, client_blinded } => {
                self.handle_server_message(ctx, psi_session, client_blinded, raw)
            }
            ServerState::WaitClientCount { common_friends } => {
                self.handle_client_count(ctx, common_friends, raw, now_ms)
            }
            ServerState::WaitClientMessages { common_friends, round, total_rounds, outbound } => {
                self.handle_client_messages(ctx, common_friends, round, total_rounds, outbound, raw, now_ms)
            }
        }
    }

    /// Step 1: reply with our own blinded friend set.
    fn handle_client_friends(
        &self,
        ctx: &ResponderContext<'_>,
        raw: &[u8],
    ) -> Result<(Vec<u8>, Option<ServerState>), ExchangeError> {
        let request: ClientMessage = from_bytes(raw)?;
        let trust_enabled = ctx.config.profile().trust_enabled();
        let mut rng = OsRng;

        let my_items = if trust_enabled { ctx.friend_store.psi_items() } else { Vec::new() };
        let (psi_session, blinded) = if trust_enabled {
            let (session, blinded) = PsiSession::begin(&my_items, &mut rng)?;
            (Some(session), blinded)
        } else {
            (None, Vec::new())
        };
        // The client's step-1 blinded friends are kept for step 2, where our
        // symmetric reply must raise *these* (not the client's step-2 reply)
        // to our own exponent.
        let client_blinded = decode_biguints(&request.friends)?;

        let reply = ClientMessage {
            messages: Vec::new(),
            friends: encode_biguints(&blinded),
            device_id_hash: None,
            exchange_id: request.exchange_id,
            public_id: Some(ctx.friend_store.device_id()),
        };
        Ok((to_bytes(&reply)?, Some(ServerState::WaitServerMessage { psi_session, client_blinded })))
    }

    /// Step 2: the client sends its `ServerMessage` PSI reply; we answer
    /// with our own symmetric reply, or abort (empty reply) below the
    /// shared-contact floor.
    fn handle_server_message(
        &self,
        ctx: &ResponderContext<'_>,
        psi_session: Option<PsiSession>,
        client_blinded: Vec<BigUint>,
        raw: &[u8],
    ) -> Result<(Vec<u8>, Option<ServerState>), ExchangeError> {
        let request: ServerMessage = from_bytes(raw)?;
        let trust_enabled = ctx.config.profile().trust_enabled();

        let common_friends = if trust_enabled {
            let session = psi_session
            .as_ref()
            .ok_or_else(|| ExchangeError::Internal("psi session missing with trust enabled".into()))?;
            let peer_dblind = decode_biguints(&request.dblind)?;
            let peer_dhash = decode_hashes(&request.dhash)?;
            session.cardinality(&peer_dblind, &peer_dhash)? as u32
        } else {
            0
        };

        if trust_enabled && common_friends < ctx.config.min_shared_contacts() {
            debug!(common_friends, "aborting exchange: below min_shared_contacts");
            return Ok((to_bytes(&ServerMessage::default())?, None));
        }

        let reply = if trust_enabled {
            let session = psi_session
            .as_ref()
            .ok_or_else(|| ExchangeError::Internal("psi session missing with trust enabled".into()))?;
            let mut rng = OsRng;
            let (dblind, dhash) = session.reply(&client_blinded, &mut rng)?;
            ServerMessage { dblind: encode_biguints(&dblind), dhash: encode_hashes(&dhash) }
        } else {
            ServerMessage::default()
        };

        Ok((to_bytes(&reply)?, Some(ServerState::WaitClientCount { common_friends })))
    }

    /// Step 3: the client reports its outbound count; we reply with ours
    /// and commit to `max(N_out, N_in)` message rounds.
    fn handle_client_count(
        &self,
        ctx: &ResponderContext<'_>,
        common_friends: u32,
        raw: &[u8],
        now_ms: u64,
    ) -> Result<(Vec<u8>, Option<ServerState>), ExchangeError> {
        let request: ExchangeInfo = from_bytes(raw)?;
        let outbound_messages = ctx
        .message_store
        .get_for_exchange(common_friends, ctx.config.max_messages(), now_ms)?;

        let my_friends = ctx.friend_store.friend_count();
        let mut rng = OsRng;
        let outbound: Vec<WireMessage> = outbound_messages
        .iter()
        .map(|message| {
                let trust = recompute_trust(message.trust_score, common_friends, my_friends, &mut rng);
                WireMessage::from_message(
                    message,
                    trust,
                    ctx.config.profile().include_pseudonym(),
                    ctx.config.profile().include_latlang(),
                )
        })
        .collect();

        let total_rounds = outbound.len().max(request.count as usize);
        let reply = ExchangeInfo { count: outbound.len() as u32 };
        Ok((
                to_bytes(&reply)?,
                Some(ServerState::WaitClientMessages { common_friends, round: 0, total_rounds, outbound }),
        ))
    }

    /// Step 4, one round at a time: merge the initiator's message (if any),
    /// reply with ours for this round, and loop back to
    /// `WaitClientFriends` once both sides have exhausted their rounds.
    fn handle_client_messages(
        &self,
        ctx: &ResponderContext<'_>,
        common_friends: u32,
        round: usize,
        total_rounds: usize,
        outbound: Vec<WireMessage>,
        raw: &[u8],
        now_ms: u64,
    ) -> Result<(Vec<u8>, Option<ServerState>), ExchangeError> {
        let request: ClientMessage = from_bytes(raw)?;
        merge_incoming(ctx.message_store, request.messages, now_ms)?;
        let _ = common_friends; // retained for clarity/symmetry with the client side

        let reply_messages = match outbound.get(round) {
            Some(message) => vec![message.clone()],
            None => Vec::new(),
        };
        let reply = ClientMessage {
            messages: reply_messages,
            friends: Vec::new(),
            device_id_hash: None,
            exchange_id: request.exchange_id,
            public_id: None,
        };

        let next_round = round + 1;
        let next_state = if next_round >= total_rounds {
            Some(ServerState::WaitClientFriends)
        } else {
            Some(ServerState::WaitClientMessages { common_friends, round: next_round, total_rounds, outbound })
        };
        Ok((to_bytes(&reply)?, next_state))
    }
}

impl Default for ExchangeResponder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridges [`murmur_net::InboundHandler`] to the stateful [`ExchangeResponder`],
/// supplying the context each request is answered against.
pub struct ResponderHandler {
    responder: Arc<ExchangeResponder>,
    config: Arc<dyn Config>,
    friend_store: Arc<FriendStore>,
    message_store: Arc<MessageStore>,
}

impl ResponderHandler {
    pub fn new(
        responder: Arc<ExchangeResponder>,
        config: Arc<dyn Config>,
        friend_store: Arc<FriendStore>,
        message_store: Arc<MessageStore>,
    ) -> Self {
        Self { responder, config, friend_store, message_store }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

#[async_trait]
impl murmur_net::InboundHandler for ResponderHandler {
    async fn handle(&self, peer_address: &str, payload: Vec<u8>) -> Vec<u8> {
        let ctx = ResponderContext {
            config: self.config.as_ref(),
            friend_store: self.friend_store.as_ref(),
            message_store: self.message_store.as_ref(),
        };
        let now_ms = Self::now_ms();
        match self.responder.handle_request(&ctx, peer_address, &payload, now_ms) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(peer_address, error = %err, "exchange responder session aborted");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait as async_trait_for_test;
    use murmur_core::types::{FriendEntry, Message};
    use murmur_net::{Transport, TransportError, TransportEvent};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    use crate::config::SecurityProfile;
    use crate::storage::Storage;

    struct TestConfig {
        profile: SecurityProfile,
        min_shared_contacts: u32,
    }

    impl Config for TestConfig {
        fn cooldown_ms(&self) -> u64 {
            60_000
        }
        fn session_timeout_ms(&self) -> u64 {
            60_000
        }
        fn backoff_base_ms(&self) -> u64 {
            1_000
        }
        fn backoff_max_ms(&self) -> u64 {
            60_000
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
            5_000
        }
        fn stale_threshold_ms(&self) -> u64 {
            30_000
        }
        fn whole_cycle_deadline_ms(&self) -> u64 {
            45_000
        }
        fn consecutive_failures_for_role_swap(&self) -> u32 {
            3
        }
        fn data_dir(&self) -> &std::path::Path {
            std::path::Path::new(".")
        }
        fn peer_selection_mode(&self) -> crate::config::PeerSelectionMode {
            crate::config::PeerSelectionMode::RoundRobin
        }
        fn scheduler_tick_ms(&self) -> u64 {
            10_000
        }
        fn retention_tick_ms(&self) -> u64 {
            3_600_000
        }
        fn max_tombstones(&self) -> usize {
            50_000
        }
        fn delete_outdated_enabled(&self) -> bool {
            false
        }
        fn delete_outdated_trust_threshold(&self) -> f64 {
            0.05
        }
        fn delete_outdated_age_days(&self) -> u32 {
            30
        }
    }

    fn open_friend_store() -> FriendStore {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        FriendStore::open(storage).unwrap()
    }

    fn open_message_store() -> MessageStore {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        MessageStore::new(storage)
    }

    /// A loopback "transport" that calls directly into an `ExchangeResponder`
    /// instead of going over a socket, so the full client/server sequence
    /// can be exercised in one process without networking.
    struct LoopbackTransport {
        responder: Arc<ExchangeResponder>,
        config: TestConfig,
        friend_store: FriendStore,
        message_store: MessageStore,
        calls: AtomicU64,
    }

    #[async_trait_for_test]
    impl Transport for LoopbackTransport {
        fn kind(&self) -> murmur_net::TransportKind {
            murmur_net::TransportKind::Lan
        }

        async fn request(&self, _peer_address: &str, payload: Vec<u8>) -> Result<Vec<u8>, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ctx = ResponderContext {
                config: &self.config,
                friend_store: &self.friend_store,
                message_store: &self.message_store,
            };
            self.responder
            .handle_request(&ctx, "loopback-peer", &payload, 1_000)
            .map_err(|e| TransportError::Unreachable(e.to_string()))
        }

        async fn poll_events(&self) -> Vec<TransportEvent> {
            vec![]
        }
    }

    #[tokio::test]
    async fn full_exchange_with_trust_disabled_carries_messages_both_ways() {
        let client_friend_store = open_friend_store();
        let client_message_store = open_message_store();
        client_message_store.add(Message::new("from client", 500), 500).unwrap();

        let server_message_store = open_message_store();
        server_message_store.add(Message::new("from server", 500), 500).unwrap();

        let transport = LoopbackTransport {
            responder: Arc::new(ExchangeResponder::new()),
            config: TestConfig { profile: SecurityProfile::Minimal, min_shared_contacts: 0 },
            friend_store: open_friend_store(),
            message_store: server_message_store,
            calls: AtomicU64::new(0),
        };
        let config = TestConfig { profile: SecurityProfile::Minimal, min_shared_contacts: 0 };

        let outcome = run_client_exchange(
            &transport,
            "loopback-peer",
            &config,
            &client_friend_store,
            &client_message_store,
            1_000,
        )
        .await
        .unwrap();

        assert_eq!(outcome.common_friends, 0);
        assert_eq!(outcome.messages_sent, 1);
        assert_eq!(outcome.messages_received, 1);
        assert_eq!(client_message_store.get_all().unwrap().len(), 2);
    }

    /// S3: the peer's copy of a shared message has more hearts; after the
    /// exchange, the local copy heart-merges up rather than being replaced.
    #[tokio::test]
    async fn duplicate_message_merges_to_the_higher_heart_count() {
        let client_friend_store = open_friend_store();
        let client_message_store = open_message_store();
        let mut shared = Message::new("shared text", 500);
        shared.priority = 2;
        client_message_store.add(shared.clone(), 500).unwrap();

        let server_message_store = open_message_store();
        let mut shared_on_server = shared.clone();
        shared_on_server.priority = 5;
        server_message_store.add(shared_on_server, 500).unwrap();

        let transport = LoopbackTransport {
            responder: Arc::new(ExchangeResponder::new()),
            config: TestConfig { profile: SecurityProfile::Minimal, min_shared_contacts: 0 },
            friend_store: open_friend_store(),
            message_store: server_message_store,
            calls: AtomicU64::new(0),
        };
        let config = TestConfig { profile: SecurityProfile::Minimal, min_shared_contacts: 0 };

        run_client_exchange(&transport, "loopback-peer", &config, &client_friend_store, &client_message_store, 1_000)
        .await
        .unwrap();

        let merged = client_message_store.get(&shared.message_id).unwrap().unwrap();
        assert_eq!(merged.priority, 5);
    }

    /// S4: a tombstoned message resent by a peer is rejected outright and
    /// never reappears in the local store.
    #[tokio::test]
    async fn tombstoned_message_is_rejected_when_peer_resends_it() {
        let client_friend_store = open_friend_store();
        let client_message_store = open_message_store();
        let deleted = Message::new("deleted by the user", 500);
        client_message_store.tombstone(&deleted.message_id, 500).unwrap();

        let server_message_store = open_message_store();
        server_message_store.add(deleted.clone(), 500).unwrap();

        let transport = LoopbackTransport {
            responder: Arc::new(ExchangeResponder::new()),
            config: TestConfig { profile: SecurityProfile::Minimal, min_shared_contacts: 0 },
            friend_store: open_friend_store(),
            message_store: server_message_store,
            calls: AtomicU64::new(0),
        };
        let config = TestConfig { profile: SecurityProfile::Minimal, min_shared_contacts: 0 };

        let outcome = run_client_exchange(&transport, "loopback-peer", &config, &client_friend_store, &client_message_store, 1_000)
        .await
        .unwrap();

        assert_eq!(outcome.messages_received, 0);
        assert!(!client_message_store.has(&deleted.message_id).unwrap());
    }

    #[tokio::test]
    async fn exchange_aborts_when_shared_contacts_below_minimum() {
        let client_friend_store = open_friend_store();
        client_friend_store
        .add_friend(FriendEntry::PublicId { public_id: "only-friend".into(), display_name: None })
        .unwrap();
        let client_message_store = open_message_store();

        let transport = LoopbackTransport {
            responder: Arc::new(ExchangeResponder::new()),
            config: TestConfig { profile: SecurityProfile::Balanced, min_shared_contacts: 1 },
            friend_store: open_friend_store(),
            message_store: open_message_store(),
            calls: AtomicU64::new(0),
        };
        let config = TestConfig { profile: SecurityProfile::Balanced, min_shared_contacts: 1 };

        let result = run_client_exchange(
            &transport,
            "loopback-peer",
            &config,
            &client_friend_store,
            &client_message_store,
            1_000,
        )
        .await;

        assert!(matches!(result, Err(ExchangeError::ProtocolAbort(_))));
    }

    /// Property #2 at the protocol level: with trust enabled and a real
    /// shared friend, the initiator's PSI cardinality must come back
    /// nonzero, not just the server's own `cardinality` call in isolation.
    #[tokio::test]
    async fn balanced_profile_exchange_reports_nonzero_shared_friends() {
        let client_friend_store = open_friend_store();
        client_friend_store
        .add_friend(FriendEntry::PublicId { public_id: "shared-friend".into(), display_name: None })
        .unwrap();
        let client_message_store = open_message_store();

        let server_friend_store = open_friend_store();
        server_friend_store
        .add_friend(FriendEntry::PublicId { public_id: "shared-friend".into(), display_name: None })
        .unwrap();

        let transport = LoopbackTransport {
            responder: Arc::new(ExchangeResponder::new()),
            config: TestConfig { profile: SecurityProfile::Balanced, min_shared_contacts: 0 },
            friend_store: server_friend_store,
            message_store: open_message_store(),
            calls: AtomicU64::new(0),
        };
        let config = TestConfig { profile: SecurityProfile::Balanced, min_shared_contacts: 0 };

        let outcome = run_client_exchange(
            &transport,
            "loopback-peer",
            &config,
            &client_friend_store,
            &client_message_store,
            1_000,
        )
        .await
        .unwrap();

        assert_eq!(outcome.common_friends, 1);
    }

    #[test]
    fn responder_reaps_sessions_past_the_timeout() {
        let responder = ExchangeResponder::new();
        let config = TestConfig { profile: SecurityProfile::Minimal, min_shared_contacts: 0 };
        let friend_store = open_friend_store();
        let message_store = open_message_store();
        let ctx = ResponderContext { config: &config, friend_store: &friend_store, message_store: &message_store };

        let init = ClientMessage { messages: vec![], friends: vec![], device_id_hash: None, exchange_id: None, public_id: None };
        responder
        .handle_request(&ctx, "peer-a", &to_bytes(&init).unwrap(), 1_000)
        .unwrap();
        assert_eq!(responder.active_session_count(), 1);

        responder.reap_expired(1_000 + 61_000, 60_000);
        assert_eq!(responder.active_session_count(), 0);
    }
}
