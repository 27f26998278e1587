//! Link-key store
//!
//! Some adapters forget their stored link keys when reset, while the guest
//! relies on the adapter to remember pairings. The store keeps the
//! authoritative table so the adapter can be refilled after a reset, and
//! round-trips it through the configuration text form:
//!
//! ```text
//! 00:11:22:33:44:55=00112233445566778899aabbccddeeff,66:77:88:99:aa:bb=...
//! ```
//!
//! Addresses are held in on-wire byte order; the text form lists the most
//! significant octet first.

use hci::{BdAddr, DeleteStoredLinkKey, LinkKey};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

/// Parse the configuration text form.
///
/// Entries without `=`, with a malformed address or with a key that is not
/// exactly 32 hex digits are skipped. Later entries override earlier ones.
pub fn parse_link_keys(text: &str) -> BTreeMap<BdAddr, LinkKey> {
    let mut keys = BTreeMap::new();
    for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((address, key)) = entry.split_once('=') else {
            warn!("Skipping link key entry without '=': {}", entry);
            continue;
        };
        let address = match address.parse::<BdAddr>() {
            Ok(address) => address,
            Err(e) => {
                warn!("Skipping link key entry: {}", e);
                continue;
            }
        };
        match key.trim().parse::<LinkKey>() {
            Ok(key) => {
                keys.insert(address, key);
            }
            Err(e) => warn!("Skipping link key for {}: {}", address, e),
        }
    }
    keys
}

/// Format keys in the configuration text form (no trailing separator)
pub fn format_link_keys<'a, I>(keys: I) -> String
where
    I: IntoIterator<Item = (&'a BdAddr, &'a LinkKey)>,
{
    keys.into_iter()
        .map(|(address, key)| format!("{}={}", address, key))
        .collect::<Vec<_>>()
        .join(",")
}

/// Address to link-key table shared by the request thread and the completion worker
#[derive(Debug, Default)]
pub struct LinkKeyStore {
    keys: RwLock<BTreeMap<BdAddr, LinkKey>>,
}

impl LinkKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from the configuration text form
    pub fn load(text: &str) -> Self {
        let keys = parse_link_keys(text);
        debug!("Loaded {} link key(s)", keys.len());
        Self {
            keys: RwLock::new(keys),
        }
    }

    /// Serialize the table back into the configuration text form
    pub fn save(&self) -> String {
        format_link_keys(self.read().iter())
    }

    /// Record a key learned from the adapter; the newest key for an address wins
    pub fn insert(&self, address: BdAddr, key: LinkKey) -> Option<LinkKey> {
        debug!("Storing link key for {}", address);
        self.write().insert(address, key)
    }

    pub fn remove(&self, address: &BdAddr) -> Option<LinkKey> {
        let removed = self.write().remove(address);
        debug!("Removing link key for {} (found: {})", address, removed.is_some());
        removed
    }

    pub fn clear(&self) {
        let mut keys = self.write();
        debug!("Clearing {} link key(s)", keys.len());
        keys.clear();
    }

    /// Mirror a guest Delete_Stored_Link_Key command
    pub fn apply_delete(&self, command: DeleteStoredLinkKey) {
        match command {
            DeleteStoredLinkKey::All => self.clear(),
            DeleteStoredLinkKey::One(address) => {
                self.remove(&address);
            }
        }
    }

    pub fn get(&self, address: &BdAddr) -> Option<LinkKey> {
        self.read().get(address).copied()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Copy of the table, for building adapter commands without holding the lock
    pub fn snapshot(&self) -> Vec<(BdAddr, LinkKey)> {
        self.read().iter().map(|(a, k)| (*a, *k)).collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<BdAddr, LinkKey>> {
        self.keys.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<BdAddr, LinkKey>> {
        self.keys.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
