//! Local account keys

use crate::types::Address;
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use std::collections::HashMap;

/// Source of the accounts this node controls
pub trait KeyManager: Send + Sync {
    fn accounts(&self) -> Vec<Address>;
}

/// In-memory keystore
#[derive(Default)]
pub struct LocalKeystore {
    keys: RwLock<HashMap<Address, SigningKey>>,
}

impl LocalKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: SigningKey) -> Address {
        let address = Address::from_signing_key(&key);
        self.keys.write().insert(address, key);
        address
    }

    /// Create and store a fresh key
    pub fn generate(&self) -> (Address, SigningKey) {
        let key = SigningKey::generate(&mut OsRng);
        (self.insert(key.clone()), key)
    }

    pub fn signing_key(&self, address: &Address) -> Option<SigningKey> {
        self.keys.read().get(address).cloned()
    }
}

impl KeyManager for LocalKeystore {
    fn accounts(&self) -> Vec<Address> {
        let mut accounts: Vec<_> = self.keys.read().keys().copied().collect();
        accounts.sort();
        accounts
    }
}
