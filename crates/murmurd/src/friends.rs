//! Friend store: the device's own identity keypair, public-ID list, and
//! hashed contacts.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::rngs::OsRng;

use murmur_core::dh::DhKeyPair;
use murmur_core::types::FriendEntry;
use num_bigint::BigUint;

use crate::error::StorageError;
use crate::storage::Storage;

/// Holds the device's lifelong DH keypair and its friend list. Friends are
/// the set PSI-Ca blinds on every exchange, never disclosed directly.
pub struct FriendStore {
    storage: Arc<Storage>,
    keypair: DhKeyPair,
    friends: RwLock<Vec<(String, FriendEntry)>>,
}

impl FriendStore {
    /// Load the persisted keypair, generating and persisting a fresh one
    /// on first run.
    pub fn open(storage: Arc<Storage>) -> Result<Self, StorageError> {
        let keypair = match storage.get_keypair_secret()? {
            Some(bytes) => DhKeyPair::from_secret(BigUint::from_bytes_be(&bytes)),
            None => {
                let kp = DhKeyPair::generate(&mut OsRng);
                storage.put_keypair_secret(&kp.secret_scalar().to_bytes_be())?;
                kp
            }
        };

        let mut friends = Vec::new();
        for entry in storage.all_friends()? {
            let key = friend_key(&entry);
            friends.push((key, entry));
        }

        Ok(Self {
                storage,
                keypair,
                friends: RwLock::new(friends),
        })
    }

    pub fn device_id(&self) -> String {
        self.keypair.device_id()
    }

    pub fn keypair(&self) -> &DhKeyPair {
        &self.keypair
    }

    /// Add or update a friend entry, persisting it.
    pub fn add_friend(&self, entry: FriendEntry) -> Result<(), StorageError> {
        let key = friend_key(&entry);
        self.storage.put_friend(&key, &entry)?;
        let mut friends = self.friends.write();
        if let Some(slot) = friends.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = entry;
        } else {
            friends.push((key, entry));
        }
        Ok(())
    }

    pub fn remove_friend(&self, key: &str) -> Result<(), StorageError> {
        self.storage.remove_friend(key)?;
        self.friends.write().retain(|(k, _)| k != key);
        Ok(())
    }

    pub fn friend_count(&self) -> u32 {
        self.friends.read().len() as u32
    }

    /// The opaque byte strings PSI-Ca blinds for this device's friend set
    ///.
    pub fn psi_items(&self) -> Vec<Vec<u8>> {
        self.friends.read().iter().map(|(_, e)| e.psi_bytes()).collect()
    }

    pub fn all_friends(&self) -> Vec<FriendEntry> {
        self.friends.read().iter().map(|(_, e)| e.clone()).collect()
    }
}

fn friend_key(entry: &FriendEntry) -> String {
    match entry {
        FriendEntry::PublicId { public_id,.. } => public_id.clone(),
        FriendEntry::HashedContact { hash } => hex::encode(hash),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_test_store() -> FriendStore {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        FriendStore::open(storage).unwrap()
    }

    #[test]
    fn device_id_is_stable_across_reopen() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let first = FriendStore::open(storage.clone()).unwrap();
        let id1 = first.device_id();
        drop(first);

        let second = FriendStore::open(storage).unwrap();
        assert_eq!(id1, second.device_id());
    }

    #[test]
    fn adding_a_friend_updates_the_psi_item_set() {
        let store = open_test_store();
        assert_eq!(store.friend_count(), 0);

        store
        .add_friend(FriendEntry::PublicId {
                public_id: hex::encode([1u8; 16]),
                display_name: Some("alice".into()),
        })
        .unwrap();

        assert_eq!(store.friend_count(), 1);
        assert_eq!(store.psi_items().len(), 1);
    }

    #[test]
    fn duplicate_public_id_updates_in_place() {
        let store = open_test_store();
        let public_id = hex::encode([2u8; 16]);
        store
        .add_friend(FriendEntry::PublicId { public_id: public_id.clone(), display_name: None })
        .unwrap();
        store
        .add_friend(FriendEntry::PublicId {
                public_id: public_id.clone(),
                display_name: Some("bob".into()),
        })
        .unwrap();

        assert_eq!(store.friend_count(), 1);
    }
}
