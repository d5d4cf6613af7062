//! Content-addressed message store: dedup, merge, tombstones, retention.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::watch;
use uuid::Uuid;

use murmur_core::message::combined_priority;
use murmur_core::types::Message;

use crate::error::StorageError;
use crate::storage::Storage;

/// Retention ages for `cleanup_by_hearts`, in ms, indexed by heart count
/// bucket (0, 1, ≥2).
const RETENTION_ZERO_HEARTS_MS: u64 = 5 * 24 * 60 * 60 * 1000;
const RETENTION_ONE_HEART_MS: u64 = 7 * 24 * 60 * 60 * 1000;
const RETENTION_TWO_PLUS_HEARTS_MS: u64 = 14 * 24 * 60 * 60 * 1000;

fn text_hash(text: &str) -> [u8; 32] {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// A durable mapping `message_id -> Message`, with a reverse text-hash
/// index for content dedup and a tombstone table of permanently-rejected
/// ids.
pub struct MessageStore {
    storage: Arc<Storage>,
    refresh_tx: watch::Sender<u64>,
}

impl MessageStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        let (refresh_tx, _rx) = watch::channel(0);
        Self { storage, refresh_tx }
    }

    /// Subscribe to store mutations: a receiver whose value changes
    /// (monotonically) on every successful `add`/`update_trust`/retention
    /// pass. Callers `.changed().await` instead of polling.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.refresh_tx.subscribe()
    }

    /// Notify observers without mutating anything.
    pub fn refresh_now(&self) {
        let current = *self.refresh_tx.borrow();
        let _ = self.refresh_tx.send(current.wrapping_add(1));
    }

    /// `add(m)`: tombstone check, heart-merge on id collision, content dedup
    /// on text-hash collision, else insert. Returns `true` iff genuinely new.
    pub fn add(&self, mut message: Message, now_ms: u64) -> Result<bool, StorageError> {
        if self.storage.is_tombstoned(&message.message_id)? {
            return Ok(false);
        }

        if let Some(existing) = self.storage.get_message(&message.message_id)? {
            // Heart merge: priority = max(existing, incoming); received_timestamp unchanged.
            let merged = Message {
                priority: existing.priority.max(message.priority),
                received_timestamp: existing.received_timestamp,
                ..existing
            };
            self.storage.put_message(&merged)?;
            self.refresh_now();
            return Ok(false);
        }

        let hash = text_hash(&message.text);
        if let Some(existing_id) = self.storage.get_by_text_hash(&hash)? {
            if existing_id != message.message_id {
                return Ok(false);
            }
        }

        message.received_timestamp = now_ms;
        self.storage.put_message(&message)?;
        self.storage.put_text_index(&hash, &message.message_id)?;
        self.storage.increment_store_version()?;
        self.refresh_now();
        Ok(true)
    }

    /// Reject `message_id` permanently; it is never re-accepted by `add`.
    pub fn tombstone(&self, message_id: &Uuid, now_ms: u64) -> Result<(), StorageError> {
        self.storage.put_tombstone(message_id, now_ms)?;
        if let Some(msg) = self.storage.get_message(message_id)? {
            self.storage.remove_text_index(&text_hash(&msg.text))?;
        }
        self.storage.delete_message(message_id)?;
        self.refresh_now();
        Ok(())
    }

    /// Set trust only if strictly greater than current.
    pub fn update_trust(&self, message_id: &Uuid, new_trust: f64) -> Result<bool, StorageError> {
        let Some(mut existing) = self.storage.get_message(message_id)? else {
            return Ok(false);
        };
        if new_trust <= existing.trust_score {
            return Ok(false);
        }
        existing.set_trust_score(new_trust);
        self.storage.put_message(&existing)?;
        self.refresh_now();
        Ok(true)
    }

    pub fn has(&self, message_id: &Uuid) -> Result<bool, StorageError> {
        Ok(self.storage.get_message(message_id)?.is_some())
    }

    pub fn get(&self, message_id: &Uuid) -> Result<Option<Message>, StorageError> {
        self.storage.get_message(message_id)
    }

    pub fn get_all(&self) -> Result<Vec<Message>, StorageError> {
        self.storage.all_messages()
    }

    pub fn store_version(&self) -> Result<u64, StorageError> {
        self.storage.store_version()
    }

    /// `get_for_exchange(shared_friends, limit)`: up to `limit` messages
    /// ordered by combined priority descending, filtered by
    /// `min_contacts_for_hop <= shared_friends` and not expired.
    pub fn get_for_exchange(&self, shared_friends: u32, limit: usize, now_ms: u64) -> Result<Vec<Message>, StorageError> {
        let mut eligible: Vec<Message> = self
            .storage
            .all_messages()?
            .into_iter()
            .filter(|m| m.min_contacts_for_hop <= shared_friends && !m.is_expired(now_ms))
            .collect();

        eligible.sort_by(|a, b| {
            combined_priority(b, now_ms)
                .partial_cmp(&combined_priority(a, now_ms))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        eligible.truncate(limit);
        Ok(eligible)
    }

    /// `cleanup_by_hearts`: messages with 0 hearts live
    /// [`RETENTION_ZERO_HEARTS_MS`], 1 heart [`RETENTION_ONE_HEART_MS`],
    /// ≥2 hearts [`RETENTION_TWO_PLUS_HEARTS_MS`], measured from
    /// `received_timestamp`.
    pub fn cleanup_by_hearts(&self, now_ms: u64) -> Result<usize, StorageError> {
        let mut removed = 0;
        for message in self.storage.all_messages()? {
            let max_age = match message.priority {
                0 => RETENTION_ZERO_HEARTS_MS,
                1 => RETENTION_ONE_HEART_MS,
                _ => RETENTION_TWO_PLUS_HEARTS_MS,
            };
            if message.age_ms(now_ms) > max_age {
                self.storage.remove_text_index(&text_hash(&message.text))?;
                self.storage.delete_message(&message.message_id)?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.refresh_now();
        }
        Ok(removed)
    }

    /// Additionally removes messages below `trust_threshold` older than
    /// `age_days`, when `enabled`.
    pub fn delete_outdated_or_irrelevant(
        &self,
        enabled: bool,
        trust_threshold: f64,
        age_days: u32,
        now_ms: u64,
    ) -> Result<usize, StorageError> {
        if !enabled {
            return Ok(0);
        }
        let age_limit_ms = age_days as u64 * 24 * 60 * 60 * 1000;
        let mut removed = 0;
        for message in self.storage.all_messages()? {
            if message.trust_score < trust_threshold && message.age_ms(now_ms) > age_limit_ms {
                self.storage.remove_text_index(&text_hash(&message.text))?;
                self.storage.delete_message(&message.message_id)?;
                removed += 1;
            }
        }
        if removed > 0 {
            self.refresh_now();
        }
        Ok(removed)
    }

    /// Caps the tombstone set at `max_size` with FIFO-by-age eviction.
    pub fn prune_tombstones(&self, max_size: usize) -> Result<usize, StorageError> {
        let mut all = self.storage.all_tombstones()?;
        if all.len() <= max_size {
            return Ok(0);
        }
        all.sort_by_key(|(_, ts)| *ts);
        let excess = all.len() - max_size;
        for (id, _) in all.into_iter().take(excess) {
            self.storage.remove_tombstone(&id)?;
        }
        Ok(excess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> MessageStore {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        MessageStore::new(storage)
    }

    /// Adding the same message twice is idempotent: the second call
    /// reports "not new" rather than inserting a duplicate.
    #[test]
    fn re_adding_same_message_is_not_new() {
        let store = open_store();
        let msg = Message::new("hello", 1_000);

        assert!(store.add(msg.clone(), 1_000).unwrap());
        assert!(!store.add(msg, 1_500).unwrap());
        assert_eq!(store.get_all().unwrap().len(), 1);
    }

    /// A tombstoned message is never re-accepted by a later `add`.
    #[test]
    fn tombstoned_message_is_never_readded() {
        let store = open_store();
        let msg = Message::new("hello", 1_000);
        store.add(msg.clone(), 1_000).unwrap();
        store.tombstone(&msg.message_id, 2_000).unwrap();

        assert!(!store.add(msg, 3_000).unwrap());
        assert!(!store.has(&msg.message_id).unwrap());
    }

    /// Heart-merging two copies of a message keeps the higher priority.
    #[test]
    fn heart_merge_takes_the_max_priority() {
        let store = open_store();
        let mut m1 = Message::new("hello", 1_000);
        m1.priority = 2;
        store.add(m1.clone(), 1_000).unwrap();

        let mut m2 = m1.clone();
        m2.priority = 5;
        store.add(m2, 2_000).unwrap();

        let stored = store.get(&m1.message_id).unwrap().unwrap();
        assert_eq!(stored.priority, 5);

        // Merging a lower priority afterwards must not regress it.
        let mut m3 = m1.clone();
        m3.priority = 1;
        store.add(m3, 3_000).unwrap();
        let stored = store.get(&m1.message_id).unwrap().unwrap();
        assert_eq!(stored.priority, 5);
    }

    #[test]
    fn duplicate_text_with_different_id_is_rejected() {
        let store = open_store();
        let m1 = Message::new("same text", 1_000);
        store.add(m1, 1_000).unwrap();

        let m2 = Message::new("same text", 1_500);
        assert!(!store.add(m2, 1_500).unwrap());
        assert_eq!(store.get_all().unwrap().len(), 1);
    }

    #[test]
    fn update_trust_never_lowers_stored_trust() {
        let store = open_store();
        let mut msg = Message::new("hi", 1_000);
        msg.set_trust_score(0.5);
        store.add(msg.clone(), 1_000).unwrap();

        assert!(!store.update_trust(&msg.message_id, 0.3).unwrap());
        assert_eq!(store.get(&msg.message_id).unwrap().unwrap().trust_score, 0.5);

        assert!(store.update_trust(&msg.message_id, 0.9).unwrap());
        assert_eq!(store.get(&msg.message_id).unwrap().unwrap().trust_score, 0.9);
    }

    /// Retention honors the age bucket tied to heart count.
    #[test]
    fn cleanup_by_hearts_prunes_by_age_bucket() {
        let store = open_store();
        let now = 20 * 24 * 60 * 60 * 1000u64;

        let mut zero_hearts_old = Message::new("old, no hearts", 0);
        zero_hearts_old.priority = 0;
        zero_hearts_old.received_timestamp = now - (6 * 24 * 60 * 60 * 1000);
        store.add(zero_hearts_old.clone(), zero_hearts_old.received_timestamp).unwrap();

        let mut two_hearts_13d = Message::new("hearted, 13 days", 0);
        two_hearts_13d.priority = 2;
        two_hearts_13d.received_timestamp = now - (13 * 24 * 60 * 60 * 1000);
        store.add(two_hearts_13d.clone(), two_hearts_13d.received_timestamp).unwrap();

        let mut two_hearts_15d = Message::new("hearted, 15 days", 0);
        two_hearts_15d.priority = 2;
        two_hearts_15d.received_timestamp = now - (15 * 24 * 60 * 60 * 1000);
        store.add(two_hearts_15d.clone(), two_hearts_15d.received_timestamp).unwrap();

        let removed = store.cleanup_by_hearts(now).unwrap();
        assert_eq!(removed, 2);
        assert!(!store.has(&zero_hearts_old.message_id).unwrap());
        assert!(store.has(&two_hearts_13d.message_id).unwrap());
        assert!(!store.has(&two_hearts_15d.message_id).unwrap());
    }

    #[test]
    fn get_for_exchange_filters_by_hop_gate_and_expiry() {
        let store = open_store();
        let now = 1_000_000u64;

        let mut gated = Message::new("needs more shared friends", now);
        gated.min_contacts_for_hop = 5;
        store.add(gated.clone(), now).unwrap();

        let mut eligible = Message::new("eligible", now);
        eligible.min_contacts_for_hop = 1;
        store.add(eligible.clone(), now).unwrap();

        let mut expired = Message::new("expired", now - 10_000);
        expired.expiration_time = 1;
        store.add(expired.clone(), now - 10_000).unwrap();

        let result = store.get_for_exchange(2, 10, now).unwrap();
        let ids: Vec<_> = result.iter().map(|m| m.message_id).collect();
        assert!(ids.contains(&eligible.message_id));
        assert!(!ids.contains(&gated.message_id));
        assert!(!ids.contains(&expired.message_id));
    }

    #[test]
    fn prune_tombstones_evicts_oldest_first() {
        let store = open_store();
        for i in 0..5u64 {
            let id = Uuid::new_v4();
            store.tombstone(&id, i * 1000).unwrap();
        }
        let removed = store.prune_tombstones(3).unwrap();
        assert_eq!(removed, 2);
    }
}
