//! Cross-transport peer identity and the peer registry

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// The radios Murmur can unify discoveries across. Ordered here from
/// lowest to highest preferred bandwidth; [`best_transport`] relies on the
/// reverse of this order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Ble,
    Lan,
    WifiDirect,
    WifiAware,
}

impl TransportKind {
    /// Bandwidth rank used by [`PeerRegistry::best_transport`]: higher is
    /// preferred. Order per: Wi-Fi Aware > Wi-Fi Direct > LAN > BLE.
    fn rank(self) -> u8 {
        match self {
            TransportKind::Ble => 0,
            TransportKind::Lan => 1,
            TransportKind::WifiDirect => 2,
            TransportKind::WifiAware => 3,
        }
    }
}

/// A single transport's view of a peer: where we last saw it, and how.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportEntry {
    pub address: String,
    /// Unix millis of the last rediscovery on this transport. Monotonically
    /// advanced by rediscovery, never by staleness checks.
    pub last_seen: u64,
    pub signal_strength: Option<i32>,
    pub port: Option<u16>,
}

/// A unified peer record spanning every transport it has been discovered on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    /// The authoritative identity. May begin as a short BLE-advertised
    /// prefix and get promoted to the full id after a handshake.
    pub public_id: String,
    pub transports: HashMap<TransportKind, TransportEntry>,
    pub handshake_completed: bool,
}

impl PeerRecord {
    fn new(public_id: String) -> Self {
        Self {
            public_id,
            transports: HashMap::new(),
            handshake_completed: false,
        }
    }

    /// A peer is stale if every transport entry's `last_seen` exceeds
    /// `threshold_ms` relative to `now_ms`.
    pub fn is_stale(&self, now_ms: u64, threshold_ms: u64) -> bool {
        self.transports
        .values()
        .all(|t| now_ms.saturating_sub(t.last_seen) > threshold_ms)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as u64
}

/// Default staleness threshold: 30 seconds.
pub const DEFAULT_STALE_THRESHOLD_MS: u64 = 30_000;

/// Process-wide, thread-safe registry unifying peer discoveries across
/// transports. Constructed once at startup and passed as an
/// explicit `Arc` handle, per the "avoid implicit global state"
/// design note; this is never a `static`.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Upsert a transport entry for a peer, keyed by `public_id` (or a
    /// short prefix, if that's all the transport can surface, e.g. a BLE
    /// advertisement). Creates the peer record if this is a first sighting.
    pub fn report_peer(
        &self,
        public_id: &str,
        kind: TransportKind,
        address: String,
        signal_strength: Option<i32>,
        port: Option<u16>,
    ) {
        let mut peers = self.peers.write();
        let record = peers
        .entry(public_id.to_string())
        .or_insert_with(|| PeerRecord::new(public_id.to_string()));
        record.transports.insert(
            kind,
            TransportEntry {
                address,
                last_seen: now_ms(),
                signal_strength,
                port,
            },
        );
    }

    /// After an app-layer handshake reveals the full `public_id` for a peer
    /// previously known only by a short prefix (`temp_key`), merge the
    /// temporary record into the authoritative one and discard the prefix
    /// entry.
    pub fn update_peer_id_after_handshake(&self, temp_key: &str, public_id: &str) {
        if temp_key == public_id {
            if let Some(record) = self.peers.write().get_mut(public_id) {
                record.handshake_completed = true;
            }
            return;
        }

        let mut peers = self.peers.write();
        let Some(temp_record) = peers.remove(temp_key) else {
            return;
        };

        let authoritative = peers
        .entry(public_id.to_string())
        .or_insert_with(|| PeerRecord::new(public_id.to_string()));
        for (kind, entry) in temp_record.transports {
            // Prefer the more recently seen entry for a given transport.
            let replace = authoritative
            .transports
            .get(&kind)
            .map(|existing| entry.last_seen >= existing.last_seen)
            .unwrap_or(true);
            if replace {
                authoritative.transports.insert(kind, entry);
            }
        }
        authoritative.handshake_completed = true;
    }

    /// Reconcile any peer record whose `public_id` is a prefix of another
    /// record's `public_id`, merging the shorter (prefix) record into the
    /// longer (authoritative) one. Call after a handshake reveals enough
    /// full ids to make such a match possible.
    pub fn reconcile_prefixes(&self) {
        let mut peers = self.peers.write();
        let ids: Vec<String> = peers.keys().cloned().collect();
        for short in &ids {
            if !peers.contains_key(short) {
                continue;
            }
            let matches: Vec<String> = ids
            .iter()
            .filter(|long| *long != short && long.starts_with(short.as_str()))
            .cloned()
            .collect();
            for long in matches {
                if let Some(short_record) = peers.remove(short) {
                    let authoritative = peers
                    .entry(long.clone())
                    .or_insert_with(|| PeerRecord::new(long.clone()));
                    for (kind, entry) in short_record.transports {
                        authoritative.transports.entry(kind).or_insert(entry);
                    }
                    authoritative.handshake_completed = true;
                }
            }
        }
    }

    /// Drop transport entries older than `threshold_ms`; delete peers left
    /// with no transports.
    pub fn prune_stale(&self, threshold_ms: u64) {
        let now = now_ms();
        let mut peers = self.peers.write();
        peers.retain(|_, record| {
                record
                .transports
                .retain(|_, entry| now.saturating_sub(entry.last_seen) <= threshold_ms);
                !record.transports.is_empty()
        });
    }

    /// The highest-bandwidth transport currently available for `public_id`.
    pub fn best_transport(&self, public_id: &str) -> Option<TransportKind> {
        self.peers
        .read()
        .get(public_id)
        .and_then(|record| record.transports.keys().max_by_key(|k| k.rank()).copied())
    }

    /// Snapshot of every peer currently known, for the scheduler and UI.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    pub fn get(&self, public_id: &str) -> Option<PeerRecord> {
        self.peers.read().get(public_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_creates_a_peer_record() {
        let registry = PeerRegistry::new();
        registry.report_peer("peer-a", TransportKind::Lan, "10.0.0.2:9000".into(), None, Some(9000));
        assert_eq!(registry.len(), 1);
        let record = registry.get("peer-a").unwrap();
        assert!(record.transports.contains_key(&TransportKind::Lan));
    }

    #[test]
    fn best_transport_prefers_higher_bandwidth_radios() {
        let registry = PeerRegistry::new();
        registry.report_peer("peer-a", TransportKind::Ble, "aa:bb".into(), Some(-60), None);
        registry.report_peer("peer-a", TransportKind::Lan, "10.0.0.2:9000".into(), None, Some(9000));
        registry.report_peer("peer-a", TransportKind::WifiDirect, "192.168.49.2".into(), None, None);

        assert_eq!(registry.best_transport("peer-a"), Some(TransportKind::WifiDirect));
    }

    #[test]
    fn handshake_merges_prefix_into_authoritative_record() {
        let registry = PeerRegistry::new();
        registry.report_peer("abc12345", TransportKind::Ble, "aa:bb".into(), Some(-50), None);
        registry.update_peer_id_after_handshake("abc12345", "abc12345-full-public-id");

        assert!(registry.get("abc12345").is_none());
        let full = registry.get("abc12345-full-public-id").unwrap();
        assert!(full.handshake_completed);
        assert!(full.transports.contains_key(&TransportKind::Ble));
    }

    #[test]
    fn prune_stale_drops_peers_with_no_fresh_transports() {
        let registry = PeerRegistry::new();
        registry.report_peer("peer-a", TransportKind::Ble, "aa:bb".into(), None, None);

        // simulate staleness: report an entry with a manual, very old last_seen
        {
            let mut peers = registry.peers.write();
            let record = peers.get_mut("peer-a").unwrap();
            record.transports.get_mut(&TransportKind::Ble).unwrap().last_seen = 0;
        }

        registry.prune_stale(DEFAULT_STALE_THRESHOLD_MS);
        assert!(registry.get("peer-a").is_none());
    }

    #[test]
    fn is_stale_requires_every_transport_to_be_old() {
        let mut record = PeerRecord::new("peer-a".into());
        record.transports.insert(
            TransportKind::Ble,
            TransportEntry {
                address: "aa:bb".into(),
                last_seen: 0,
                signal_strength: None,
                port: None,
            },
        );
        record.transports.insert(
            TransportKind::Lan,
            TransportEntry {
                address: "10.0.0.2".into(),
                last_seen: 1_000_000,
                signal_strength: None,
                port: None,
            },
        );
        assert!(!record.is_stale(1_000_000, DEFAULT_STALE_THRESHOLD_MS));
    }
}
