//! Durable persistence backing the message store, friend store, and
//! history tracker.
//!
//! One `sled::Tree` per concern: `messages`, `tombstones`, `text_index`
//! (content-dedup reverse index), `friends`, `history`, and `metadata`
//! (keypair, `store_version`, `profile`, `last_exchange_time`).

use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, Tree};

use crate::error::StorageError;
use murmur_core::types::{FriendEntry, Message};

const KEY_KEYPAIR_SECRET: &str = "keypair_secret";
const KEY_PROFILE: &str = "profile";
const KEY_STORE_VERSION: &str = "store_version";

pub struct Storage {
    db: Db,
    messages: Tree,
    tombstones: Tree,
    text_index: Tree,
    friends: Tree,
    history: Tree,
    metadata: Tree,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    Ok(serde_json::from_slice(bytes)?)
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self {
            messages: db.open_tree("messages")?,
            tombstones: db.open_tree("tombstones")?,
            text_index: db.open_tree("text_index")?,
            friends: db.open_tree("friends")?,
            history: db.open_tree("history")?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    // --- messages -----------------------------------------------------

    pub fn put_message(&self, message: &Message) -> Result<(), StorageError> {
        self.messages.insert(message.message_id.as_bytes(), encode(message)?)?;
        Ok(())
    }

    pub fn get_message(&self, id: &uuid::Uuid) -> Result<Option<Message>, StorageError> {
        match self.messages.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_message(&self, id: &uuid::Uuid) -> Result<(), StorageError> {
        self.messages.remove(id.as_bytes())?;
        Ok(())
    }

    pub fn all_messages(&self) -> Result<Vec<Message>, StorageError> {
        self.messages
            .iter()
            .map(|entry| decode(&entry?.1))
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    // --- tombstones -----------------------------------------------------

    pub fn put_tombstone(&self, id: &uuid::Uuid, tombstoned_at_ms: u64) -> Result<(), StorageError> {
        self.tombstones.insert(id.as_bytes(), &tombstoned_at_ms.to_be_bytes())?;
        Ok(())
    }

    pub fn is_tombstoned(&self, id: &uuid::Uuid) -> Result<bool, StorageError> {
        Ok(self.tombstones.contains_key(id.as_bytes())?)
    }

    pub fn remove_tombstone(&self, id: &uuid::Uuid) -> Result<(), StorageError> {
        self.tombstones.remove(id.as_bytes())?;
        Ok(())
    }

    /// All tombstones as `(message_id, tombstoned_at_ms)`, for FIFO pruning.
    pub fn all_tombstones(&self) -> Result<Vec<(uuid::Uuid, u64)>, StorageError> {
        let mut out = Vec::new();
        for pair in self.tombstones.iter() {
            let (key, value) = pair?;
            let id = uuid::Uuid::from_slice(&key).map_err(|e| StorageError::Corrupt(e.to_string()))?;
            let ts = u64::from_be_bytes(value.as_ref().try_into().unwrap_or([0; 8]));
            out.push((id, ts));
        }
        Ok(out)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    // --- text dedup index -----------------------------------------------

    pub fn put_text_index(&self, text_hash: &[u8; 32], id: &uuid::Uuid) -> Result<(), StorageError> {
        self.text_index.insert(text_hash, id.as_bytes())?;
        Ok(())
    }

    pub fn get_by_text_hash(&self, text_hash: &[u8; 32]) -> Result<Option<uuid::Uuid>, StorageError> {
        match self.text_index.get(text_hash)? {
            Some(bytes) => Ok(Some(
                uuid::Uuid::from_slice(&bytes).map_err(|e| StorageError::Corrupt(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn remove_text_index(&self, text_hash: &[u8; 32]) -> Result<(), StorageError> {
        self.text_index.remove(text_hash)?;
        Ok(())
    }

    // --- friends ---------------------------------------------------------

    pub fn put_friend(&self, key: &str, entry: &FriendEntry) -> Result<(), StorageError> {
        self.friends.insert(key.as_bytes(), encode(entry)?)?;
        Ok(())
    }

    pub fn remove_friend(&self, key: &str) -> Result<(), StorageError> {
        self.friends.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn all_friends(&self) -> Result<Vec<FriendEntry>, StorageError> {
        self.friends
            .iter()
            .map(|entry| decode(&entry?.1))
            .collect()
    }

    pub fn friend_count(&self) -> usize {
        self.friends.len()
    }

    // --- exchange history -------------------------------------------------

    pub fn put_history<T: Serialize>(&self, peer_key: &str, record: &T) -> Result<(), StorageError> {
        self.history.insert(peer_key.as_bytes(), encode(record)?)?;
        Ok(())
    }

    pub fn get_history<T: DeserializeOwned>(&self, peer_key: &str) -> Result<Option<T>, StorageError> {
        match self.history.get(peer_key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove_history(&self, peer_key: &str) -> Result<(), StorageError> {
        self.history.remove(peer_key.as_bytes())?;
        Ok(())
    }

    pub fn all_history_keys(&self) -> Result<Vec<String>, StorageError> {
        self.history
            .iter()
            .map(|entry| Ok(String::from_utf8_lossy(&entry?.0).to_string()))
            .collect()
    }

    // --- metadata ----------------------------------------------------------

    pub fn put_keypair_secret(&self, secret_bytes: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(KEY_KEYPAIR_SECRET, secret_bytes)?;
        Ok(())
    }

    pub fn get_keypair_secret(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(KEY_KEYPAIR_SECRET)?.map(|v| v.to_vec()))
    }

    pub fn put_profile<T: Serialize>(&self, profile: &T) -> Result<(), StorageError> {
        self.metadata.insert(KEY_PROFILE, encode(profile)?)?;
        Ok(())
    }

    pub fn get_profile<T: DeserializeOwned>(&self) -> Result<Option<T>, StorageError> {
        match self.metadata.get(KEY_PROFILE)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn store_version(&self) -> Result<u64, StorageError> {
        match self.metadata.get(KEY_STORE_VERSION)? {
            Some(bytes) => Ok(u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0; 8]))),
            None => Ok(0),
        }
    }

    pub fn increment_store_version(&self) -> Result<u64, StorageError> {
        let next = self.store_version()? + 1;
        self.metadata.insert(KEY_STORE_VERSION, &next.to_be_bytes())?;
        Ok(next)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
