//! Unlocking and locking a session across page loads.
//!
//! `unlock` first tries the session snapshot in the secure cache and only
//! asks the identity provider when there is none. `lock` drops the key and
//! wipes every snapshot this manager wrote.
//!
//! The session snapshot is bound to the identity, which is public, so the
//! master key inside it is additionally sealed by the device keystore with
//! associated data `"ledgervault:session-key" || identity`.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::derivation::{domain_fingerprint, MasterKey, KEY_LEN};
use crate::error::{VaultError, VaultResult};
use crate::key_manager::KeyManager;
use crate::platform::DeviceKeystore;
use crate::secure_cache::{slot_name, CacheScope, SecureCache};
use crate::types::Credential;

/// How [`SessionManager::unlock`] obtained the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockSource {
    /// Rehydrated from the session snapshot.
    Restored,
    /// Derived through the identity provider.
    Derived,
}

const LABEL_SESSION_KEY: &[u8] = b"ledgervault:session-key";

#[derive(Serialize, Deserialize)]
struct SessionSnapshot {
    identity: String,
    sealed_key: Vec<u8>,
}

/// Ties the key manager to the secure cache.
pub struct SessionManager {
    keys: KeyManager,
    cache: Arc<SecureCache>,
    keystore: Arc<dyn DeviceKeystore>,
    credential_slots: Mutex<HashSet<String>>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

fn session_slot(identity: &str) -> String {
    slot_name("session", identity.as_bytes())
}

fn session_key_ad(identity: &str) -> Vec<u8> {
    let mut ad = Vec::with_capacity(LABEL_SESSION_KEY.len() + identity.len());
    ad.extend_from_slice(LABEL_SESSION_KEY);
    ad.extend_from_slice(identity.as_bytes());
    ad
}

impl SessionManager {
    /// Creates a session manager. `keystore` seals the master key inside
    /// the session snapshot.
    #[must_use]
    pub fn new(
        keys: KeyManager,
        cache: Arc<SecureCache>,
        keystore: Arc<dyn DeviceKeystore>,
    ) -> Self {
        Self {
            keys,
            cache,
            keystore,
            credential_slots: Mutex::new(HashSet::new()),
        }
    }

    /// The key manager backing this session.
    #[must_use]
    pub const fn keys(&self) -> &KeyManager {
        &self.keys
    }

    /// Makes the master key of `identity` available.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Derivation`] if there is no usable snapshot and
    /// derivation fails. Failing to write a fresh snapshot is only logged.
    pub async fn unlock(&self, identity: &str) -> VaultResult<UnlockSource> {
        let slot = session_slot(identity);
        let restored: Option<SessionSnapshot> =
            self.cache
                .load(CacheScope::Session, &slot, identity.as_bytes())?;

        if let Some(snapshot) = restored {
            if let Some(key) = self.unseal(identity, &snapshot) {
                self.keys.set_from_restored_state(identity, key).await?;
                tracing::info!(identity, "session restored");
                return Ok(UnlockSource::Restored);
            }
            tracing::warn!(identity, "session snapshot does not match, discarding");
            self.cache.clear(CacheScope::Session, &slot)?;
        }

        let sealed_key = {
            let master = self.keys.get_or_derive(identity).await?;
            self.keystore
                .seal(&session_key_ad(identity), master.as_bytes())
        };
        let stored = sealed_key.and_then(|sealed_key| {
            let snapshot = SessionSnapshot {
                identity: identity.to_string(),
                sealed_key,
            };
            self.cache
                .store(CacheScope::Session, &slot, identity.as_bytes(), &snapshot)
        });
        if let Err(err) = stored {
            tracing::warn!(identity, error = %err, "session snapshot not persisted");
        }
        Ok(UnlockSource::Derived)
    }

    fn unseal(&self, identity: &str, snapshot: &SessionSnapshot) -> Option<MasterKey> {
        if snapshot.identity != identity {
            return None;
        }
        let opened = match self
            .keystore
            .open(&session_key_ad(identity), &snapshot.sealed_key)
        {
            Ok(opened) => Zeroizing::new(opened),
            Err(err) => {
                tracing::warn!(identity, error = %err, "session key not unsealed");
                return None;
            }
        };
        let mut bytes: [u8; KEY_LEN] = opened.as_slice().try_into().ok()?;
        let key = MasterKey::from_bytes(bytes);
        bytes.zeroize();
        Some(key)
    }

    /// Clears the master key and wipes the session and credential snapshots.
    ///
    /// # Errors
    ///
    /// Returns the first slot deletion error; the key is cleared regardless.
    pub async fn lock(&self, identity: &str) -> VaultResult<()> {
        self.keys.clear().await;

        let mut first_error: Option<VaultError> = None;
        let mut record = |result: VaultResult<()>| {
            if let Err(err) = result {
                tracing::warn!(error = %err, "failed to wipe cache slot");
                first_error.get_or_insert(err);
            }
        };
        record(self.cache.clear(CacheScope::Session, &session_slot(identity)));

        let slots: Vec<String> = self
            .credential_slots
            .lock()
            .map(|mut slots| slots.drain().collect())
            .unwrap_or_default();
        for slot in &slots {
            record(self.cache.clear(CacheScope::Credentials, slot));
        }
        tracing::info!(identity, wiped = slots.len() + 1, "session locked");
        first_error.map_or(Ok(()), Err)
    }

    /// Returns the cached credential list for `domain`, if fresh and intact.
    ///
    /// # Errors
    ///
    /// Fails if the domain is invalid or the slot store cannot be read.
    pub fn cached_credentials(
        &self,
        master: &MasterKey,
        domain: &str,
    ) -> VaultResult<Option<Vec<Credential>>> {
        let slot = credentials_slot(master, domain)?;
        self.cache
            .load(CacheScope::Credentials, &slot, master.as_bytes())
    }

    /// Caches the decrypted credential list for `domain`.
    ///
    /// # Errors
    ///
    /// Fails if the domain is invalid or the record cannot be written.
    pub fn cache_credentials(
        &self,
        master: &MasterKey,
        domain: &str,
        credentials: &[Credential],
    ) -> VaultResult<()> {
        let slot = credentials_slot(master, domain)?;
        self.cache
            .store(CacheScope::Credentials, &slot, master.as_bytes(), &credentials)?;
        if let Ok(mut slots) = self.credential_slots.lock() {
            slots.insert(slot);
        }
        Ok(())
    }
}

fn credentials_slot(master: &MasterKey, domain: &str) -> VaultResult<String> {
    let fingerprint = domain_fingerprint(master, domain)?;
    Ok(slot_name("credentials", fingerprint.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, KeyLifecycleConfig};
    use crate::derivation::{master_from_proof, IdentityProof};
    use crate::key_manager::KeyState;
    use crate::platform::memory::{MemoryKeystore, MemorySlotStore, StaticIdentityProvider};
    use crate::platform::{IdentityProvider, SlotStore};

    struct Fixture {
        provider: Arc<StaticIdentityProvider>,
        session_slots: Arc<MemorySlotStore>,
        credential_slots: Arc<MemorySlotStore>,
        cache: Arc<SecureCache>,
        keystore: Arc<MemoryKeystore>,
    }

    impl Fixture {
        fn new() -> Self {
            let session_slots = Arc::new(MemorySlotStore::new());
            let credential_slots = Arc::new(MemorySlotStore::new());
            let cache = Arc::new(SecureCache::new(
                Arc::clone(&session_slots) as Arc<dyn SlotStore>,
                Arc::clone(&credential_slots) as Arc<dyn SlotStore>,
                CacheConfig {
                    memory_kib: 64,
                    iterations: 1,
                    parallelism: 1,
                    ..CacheConfig::default()
                },
            ));
            Self {
                provider: Arc::new(StaticIdentityProvider::new("0xabc", "tok")),
                session_slots,
                credential_slots,
                cache,
                keystore: Arc::new(MemoryKeystore::new()),
            }
        }

        // A fresh manager stands in for a new page load.
        fn manager(&self) -> SessionManager {
            self.manager_with(Arc::clone(&self.keystore) as Arc<dyn DeviceKeystore>)
        }

        fn manager_with(&self, keystore: Arc<dyn DeviceKeystore>) -> SessionManager {
            let keys = KeyManager::new(
                Arc::clone(&self.provider) as Arc<dyn IdentityProvider>,
                KeyLifecycleConfig::default(),
            );
            SessionManager::new(keys, Arc::clone(&self.cache), keystore)
        }
    }

    #[tokio::test]
    async fn test_unlock_derives_then_restores() {
        let fixture = Fixture::new();
        let first = fixture.manager();
        assert_eq!(first.unlock("0xabc").await.unwrap(), UnlockSource::Derived);
        assert_eq!(fixture.session_slots.list().len(), 1);

        let second = fixture.manager();
        assert_eq!(second.unlock("0xabc").await.unwrap(), UnlockSource::Restored);
        assert_eq!(fixture.provider.calls(), 1);

        let expected = master_from_proof(&IdentityProof::new("0xabc", "tok")).unwrap();
        let lease = second.keys().get_or_derive("0xabc").await.unwrap();
        assert_eq!(lease.as_bytes(), expected.as_bytes());
        assert_eq!(fixture.provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_tampered_snapshot_falls_back_to_derivation() {
        let fixture = Fixture::new();
        fixture.manager().unlock("0xabc").await.unwrap();
        let slot = session_slot("0xabc");
        let mut bytes = fixture.session_slots.read(&slot).unwrap().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        fixture.session_slots.write_atomic(&slot, &bytes).unwrap();

        let manager = fixture.manager();
        assert_eq!(manager.unlock("0xabc").await.unwrap(), UnlockSource::Derived);
        assert_eq!(fixture.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_needs_the_device_keystore() {
        let fixture = Fixture::new();
        fixture.manager().unlock("0xabc").await.unwrap();
        let expected = master_from_proof(&IdentityProof::new("0xabc", "tok")).unwrap();

        // Knowing the address opens the cache layer but not the key.
        let snapshot: SessionSnapshot = fixture
            .cache
            .load(CacheScope::Session, &session_slot("0xabc"), b"0xabc")
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.identity, "0xabc");
        assert!(!snapshot
            .sealed_key
            .windows(KEY_LEN)
            .any(|window| window == expected.as_bytes()));

        let other_device = fixture.manager_with(Arc::new(MemoryKeystore::new()));
        assert_eq!(other_device.unlock("0xabc").await.unwrap(), UnlockSource::Derived);
        assert_eq!(fixture.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_lock_wipes_everything() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        manager.unlock("0xabc").await.unwrap();
        {
            let master = manager.keys().get_or_derive("0xabc").await.unwrap();
            manager
                .cache_credentials(&master, "example.com", &[Credential::new("example.com", "u", "p")])
                .unwrap();
        }
        assert_eq!(fixture.credential_slots.list().len(), 1);

        manager.lock("0xabc").await.unwrap();
        assert_eq!(manager.keys().state(), KeyState::Empty);
        assert!(fixture.session_slots.list().is_empty());
        assert!(fixture.credential_slots.list().is_empty());
    }

    #[tokio::test]
    async fn test_credential_list_cache() {
        let fixture = Fixture::new();
        let manager = fixture.manager();
        manager.unlock("0xabc").await.unwrap();
        let master = manager.keys().get_or_derive("0xabc").await.unwrap();

        assert!(manager
            .cached_credentials(&master, "example.com")
            .unwrap()
            .is_none());
        let list = vec![
            Credential::new("example.com", "a", "1"),
            Credential::new("example.com", "b", "2"),
        ];
        manager
            .cache_credentials(&master, "https://example.com", &list)
            .unwrap();
        assert_eq!(
            manager.cached_credentials(&master, "example.com").unwrap(),
            Some(list)
        );
        assert!(manager
            .cached_credentials(&master, "example.org")
            .unwrap()
            .is_none());
    }
}
