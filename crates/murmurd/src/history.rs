//! Per-peer exchange history: attempts, backoff, and round-robin
//! bookkeeping.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage::Storage;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub last_exchange_time: u64,
    pub attempts: u32,
    /// Local `store_version` as observed at the last attempt.
    pub store_version_at_attempt: u64,
    /// For round-robin "least-recently-picked" selection.
    pub last_picked: u64,
    pub consecutive_failures: u32,
}

/// `delay = min(base * 2^attempts, max_delay)`.
pub fn backoff_delay_ms(attempts: u32, base_ms: u64, max_ms: u64) -> u64 {
    base_ms.saturating_mul(1u64.checked_shl(attempts).unwrap_or(u64::MAX).max(1)).min(max_ms)
}

/// Process-local, periodically-persisted tracker for per-peer exchange
/// bookkeeping.
pub struct ExchangeHistory {
    storage: Arc<Storage>,
}

impl ExchangeHistory {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub fn get(&self, peer_key: &str) -> Result<HistoryRecord, StorageError> {
        Ok(self.storage.get_history(peer_key)?.unwrap_or_default())
    }

    fn put(&self, peer_key: &str, record: &HistoryRecord) -> Result<(), StorageError> {
        self.storage.put_history(peer_key, record)
    }

    /// Whether an outbound attempt with `peer_key` is currently permitted,
    /// given `now_ms` and the local store's current `store_version`
    ///. Does not itself record an attempt.
    pub fn can_attempt(&self, peer_key: &str, now_ms: u64, current_store_version: u64, base_ms: u64, max_ms: u64) -> Result<bool, StorageError> {
        let record = self.get(peer_key)?;
        if record.last_exchange_time == 0 {
            return Ok(true);
        }
        if record.store_version_at_attempt != current_store_version {
            return Ok(true);
        }
        let delay = backoff_delay_ms(record.attempts, base_ms, max_ms);
        Ok(now_ms.saturating_sub(record.last_exchange_time) >= delay)
    }

    /// Record that an attempt was made, bumping `attempts` (backoff
    /// bookkeeping happens here regardless of outcome; success resets it
    /// via [`ExchangeHistory::record_success`]).
    pub fn record_attempt(&self, peer_key: &str, now_ms: u64, store_version: u64) -> Result<(), StorageError> {
        let mut record = self.get(peer_key)?;
        record.last_exchange_time = now_ms;
        record.store_version_at_attempt = store_version;
        record.attempts += 1;
        self.put(peer_key, &record)
    }

    /// Success resets `attempts` and `consecutive_failures` to 0
    ///.
    pub fn record_success(&self, peer_key: &str) -> Result<(), StorageError> {
        let mut record = self.get(peer_key)?;
        record.attempts = 0;
        record.consecutive_failures = 0;
        self.put(peer_key, &record)
    }

    pub fn record_failure(&self, peer_key: &str) -> Result<(), StorageError> {
        let mut record = self.get(peer_key)?;
        record.consecutive_failures += 1;
        self.put(peer_key, &record)
    }

    pub fn touch_picked(&self, peer_key: &str, now_ms: u64) -> Result<(), StorageError> {
        let mut record = self.get(peer_key)?;
        record.last_picked = now_ms;
        self.put(peer_key, &record)
    }

    pub fn remove(&self, peer_key: &str) -> Result<(), StorageError> {
        self.storage.remove_history(peer_key)
    }

    pub fn known_peers(&self) -> Result<Vec<String>, StorageError> {
        self.storage.all_history_keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_history() -> ExchangeHistory {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        ExchangeHistory::new(storage)
    }

    /// Property #7: base=1s, max=60s, after n failures without
    /// store_version change, next-attempt delay is exactly min(2^n, 60) s.
    #[test]
    fn backoff_matches_exact_formula() {
        assert_eq!(backoff_delay_ms(0, 1000, 60_000), 1000);
        assert_eq!(backoff_delay_ms(1, 1000, 60_000), 2000);
        assert_eq!(backoff_delay_ms(2, 1000, 60_000), 4000);
        assert_eq!(backoff_delay_ms(6, 1000, 60_000), 60_000); // 2^6=64s capped to 60s
        assert_eq!(backoff_delay_ms(10, 1000, 60_000), 60_000);
    }

    #[test]
    fn first_attempt_is_always_allowed() {
        let history = open_history();
        assert!(history.can_attempt("peer-a", 1_000, 0, 1_000, 60_000).unwrap());
    }

    #[test]
    fn backoff_blocks_retry_before_delay_elapses() {
        let history = open_history();
        history.record_attempt("peer-a", 1_000, 5).unwrap();
        history.record_failure("peer-a").unwrap();

        // same store_version, not enough time elapsed (needs 2s after 1 attempt)
        assert!(!history.can_attempt("peer-a", 1_500, 5, 1_000, 60_000).unwrap());
        assert!(history.can_attempt("peer-a", 3_001, 5, 1_000, 60_000).unwrap());
    }

    #[test]
    fn store_version_change_bypasses_backoff() {
        let history = open_history();
        history.record_attempt("peer-a", 1_000, 5).unwrap();
        history.record_failure("peer-a").unwrap();

        assert!(history.can_attempt("peer-a", 1_001, 6, 1_000, 60_000).unwrap());
    }

    #[test]
    fn success_resets_attempts_and_failures() {
        let history = open_history();
        history.record_attempt("peer-a", 1_000, 5).unwrap();
        history.record_failure("peer-a").unwrap();
        history.record_attempt("peer-a", 2_000, 5).unwrap();
        history.record_failure("peer-a").unwrap();

        history.record_success("peer-a").unwrap();
        let record = history.get("peer-a").unwrap();
        assert_eq!(record.attempts, 0);
        assert_eq!(record.consecutive_failures, 0);
    }
}
