use crate::models::User;
use anyhow::{Context, Result};
use keyring::Entry;
use tracing::warn;

const APP_NAME: &str = "ismail";
const HINT_KEY: &str = "identity_hint";

/// Raw storage for the cached identity. The cache only ever serves as a paint
/// hint; nothing read from here is trusted as a session.
pub trait HintStore: Send {
    fn get(&self) -> Result<Option<String>>;
    fn set(&self, value: &str) -> Result<()>;
    fn delete(&self) -> Result<()>;
}

pub struct RingStorage;

impl RingStorage {
    fn entry() -> Result<Entry> {
        Entry::new(APP_NAME, HINT_KEY).map_err(|e| anyhow::anyhow!("Keyring error: {}", e))
    }
}

impl HintStore for RingStorage {
    fn get(&self) -> Result<Option<String>> {
        match Self::entry()?.get_password() {
            Ok(serialized) => Ok(Some(serialized)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }

    fn set(&self, value: &str) -> Result<()> {
        Self::entry()?
            .set_password(value)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))
    }

    fn delete(&self) -> Result<()> {
        match Self::entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("Keyring error: {}", e)),
        }
    }
}

/// Typed view over a [`HintStore`]. Every failure is logged and swallowed:
/// a broken cache degrades to "no hint", never to an error the user sees.
pub struct IdentityHint {
    store: Box<dyn HintStore>,
}

impl IdentityHint {
    pub fn new(store: Box<dyn HintStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Option<User> {
        let raw = match self.store.get() {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Could not read cached identity: {:#}", e);
                return None;
            }
        };

        match serde_json::from_str::<User>(&raw).context("Failed to deserialize cached identity") {
            Ok(user) => Some(user),
            Err(e) => {
                warn!("Discarding malformed cached identity: {:#}", e);
                self.clear();
                None
            }
        }
    }

    pub fn store(&self, user: &User) {
        let result = serde_json::to_string(user)
            .context("Failed to serialize identity")
            .and_then(|serialized| self.store.set(&serialized));
        if let Err(e) = result {
            warn!("Could not cache identity: {:#}", e);
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.store.delete() {
            warn!("Could not clear cached identity: {:#}", e);
        }
    }
}
