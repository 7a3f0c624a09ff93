//! Component public-key registry.
//!
//! Maps component ids to Ed25519 verifying keys. Private keys stay with
//! the signing principal ([`super::EnvelopeSigner`]); the registry only
//! ever holds public material, and zeroes the key buffer on removal.

use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::sync::RwLock;
use zeroize::Zeroize;

use crate::types::{ComponentId, Error, Result};

/// Registry of component verifying keys.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: RwLock<HashMap<ComponentId, VerifyingKey>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a verifying key to a component id. Re-registration replaces
    /// the previous key (ephemeral sandbox signers rotate per execution).
    pub fn register(&self, component: ComponentId, key: VerifyingKey) -> Result<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| Error::internal("key registry lock poisoned"))?;
        keys.insert(component, key);
        Ok(())
    }

    /// Remove a binding, zeroing the stored key buffer.
    pub fn remove(&self, component: &ComponentId) -> Result<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| Error::internal("key registry lock poisoned"))?;
        if let Some(key) = keys.remove(component) {
            let mut bytes = key.to_bytes();
            bytes.zeroize();
        }
        Ok(())
    }

    pub fn lookup(&self, component: &ComponentId) -> Option<VerifyingKey> {
        self.keys.read().ok().and_then(|keys| keys.get(component).copied())
    }

    pub fn contains(&self, component: &ComponentId) -> bool {
        self.lookup(component).is_some()
    }
}
