//! Encrypted local persistence for session and credential snapshots.
//!
//! Two scopes share one record format but live in different slot stores:
//! the session scope (identity + master key, long lived) and the credentials
//! scope (decrypted credential lists, short lived).
//!
//! # Record format
//!
//! Each slot holds a CBOR-encoded `CachedRecord`:
//!
//! ```text
//! local_key        = Argon2id(binding, salt)            // salt: 16 random bytes
//! enc_key, mac_key = HKDF-SHA256(local_key, "ledgervault:cache-enc" / "ledgervault:cache-mac")
//! digest           = HMAC-SHA256(mac_key, plaintext)
//! envelope         = [salt_len][salt][iv_len][iv][XChaCha20-Poly1305(enc_key, plaintext, aad)]
//! aad              = "ledgervault:cache-record" || version || scope || slot
//!                    || created_at || expires_at
//! ```
//!
//! The salt rides in the nonce field of the envelope, so one buffer carries
//! everything needed to re-derive the key except the binding.
//!
//! # Failing closed
//!
//! [`SecureCache::load`] never returns data it could not fully verify. A
//! record that is expired, fails to parse, fails authentication, or fails
//! its digest check is overwritten and deleted, and `load` returns `None`.

use std::fmt;
use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{AsRefStr, Display};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::config::CacheConfig;
use crate::crypto;
use crate::derivation::KEY_LEN;
use crate::envelope;
use crate::error::{VaultError, VaultResult};
use crate::platform::SlotStore;
use crate::types::unix_now;

const RECORD_VERSION: u32 = 1;
const SALT_LEN: usize = 16;

const LABEL_CACHE_ENC: &[u8] = b"ledgervault:cache-enc";
const LABEL_CACHE_MAC: &[u8] = b"ledgervault:cache-mac";
const LABEL_CACHE_RECORD: &[u8] = b"ledgervault:cache-record";

type HmacSha256 = Hmac<Sha256>;

/// Persistence scope of a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CacheScope {
    /// Identity and master key; survives page loads.
    Session,
    /// Decrypted credential lists; re-fetched often.
    Credentials,
}

#[derive(Serialize, Deserialize)]
struct CachedRecord {
    version: u32,
    created_at: u64,
    expires_at: u64,
    digest: Vec<u8>,
    envelope: Vec<u8>,
}

impl CachedRecord {
    fn serialize(&self) -> VaultResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| VaultError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    fn deserialize(bytes: &[u8]) -> VaultResult<Self> {
        let record: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| VaultError::Serialization(err.to_string()))?;
        if record.version != RECORD_VERSION {
            return Err(VaultError::Serialization(format!(
                "unsupported cache record version {}",
                record.version
            )));
        }
        Ok(record)
    }
}

struct LocalKeys {
    enc: Zeroizing<[u8; KEY_LEN]>,
    mac: Zeroizing<[u8; KEY_LEN]>,
}

/// Builds a slot name from a label and an identifying value.
///
/// The value is hashed so slot names do not reveal identities or domains.
#[must_use]
pub fn slot_name(label: &str, value: &[u8]) -> String {
    let digest = Sha256::digest(value);
    format!("ledgervault.{label}.{}", hex::encode(&digest[..16]))
}

/// Encrypted snapshot storage with integrity verification.
pub struct SecureCache {
    session_slots: Arc<dyn SlotStore>,
    credential_slots: Arc<dyn SlotStore>,
    config: CacheConfig,
}

impl fmt::Debug for SecureCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SecureCache {
    /// Creates a cache over two slot stores.
    #[must_use]
    pub fn new(
        session_slots: Arc<dyn SlotStore>,
        credential_slots: Arc<dyn SlotStore>,
        config: CacheConfig,
    ) -> Self {
        Self {
            session_slots,
            credential_slots,
            config,
        }
    }

    fn slots(&self, scope: CacheScope) -> &dyn SlotStore {
        match scope {
            CacheScope::Session => self.session_slots.as_ref(),
            CacheScope::Credentials => self.credential_slots.as_ref(),
        }
    }

    const fn ttl_secs(&self, scope: CacheScope) -> u64 {
        match scope {
            CacheScope::Session => self.config.session_ttl_secs,
            CacheScope::Credentials => self.config.credentials_ttl_secs,
        }
    }

    /// Encrypts `value` and writes it to `slot`.
    ///
    /// `binding` is the value unique to the identity the local key is
    /// stretched from; the same binding must be presented to [`Self::load`].
    /// This runs the key-stretching function and is CPU-bound.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization, key stretching, encryption or the
    /// slot write fails.
    pub fn store<T: Serialize>(
        &self,
        scope: CacheScope,
        slot: &str,
        binding: &[u8],
        value: &T,
    ) -> VaultResult<()> {
        self.store_at(scope, slot, binding, value, unix_now()?)
    }

    fn store_at<T: Serialize>(
        &self,
        scope: CacheScope,
        slot: &str,
        binding: &[u8],
        value: &T,
        now: u64,
    ) -> VaultResult<()> {
        check_binding(binding)?;
        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let expires_at = now.saturating_add(self.ttl_secs(scope));

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let keys = self.local_keys(binding, &salt)?;

        let digest = hmac_digest(&keys.mac, &plaintext)?;
        let aad = record_aad(scope, slot, now, expires_at);
        let (ciphertext, iv) = crypto::seal(&keys.enc, &aad, &plaintext)?;

        let record = CachedRecord {
            version: RECORD_VERSION,
            created_at: now,
            expires_at,
            digest,
            envelope: envelope::encode(&salt, &iv, &ciphertext)?,
        };
        self.slots(scope).write_atomic(slot, &record.serialize()?)?;
        tracing::debug!(scope = scope.as_ref(), slot, expires_at, "cache record stored");
        Ok(())
    }

    /// Reads and verifies `slot`.
    ///
    /// Returns `None` if the slot is empty or the record could not be fully
    /// verified; in the latter case the slot is wiped.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidInput`] for an empty `binding`, without
    /// touching the slot. Otherwise only fails if the slot store itself
    /// cannot be read.
    pub fn load<T: DeserializeOwned>(
        &self,
        scope: CacheScope,
        slot: &str,
        binding: &[u8],
    ) -> VaultResult<Option<T>> {
        self.load_at(scope, slot, binding, unix_now()?)
    }

    fn load_at<T: DeserializeOwned>(
        &self,
        scope: CacheScope,
        slot: &str,
        binding: &[u8],
        now: u64,
    ) -> VaultResult<Option<T>> {
        check_binding(binding)?;
        let Some(bytes) = self.slots(scope).read(slot)? else {
            return Ok(None);
        };
        match self.open_record(scope, slot, binding, &bytes, now) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::warn!(
                    scope = scope.as_ref(),
                    slot,
                    error = %err,
                    "discarding unverifiable cache record"
                );
                self.wipe(scope, slot, bytes.len());
                Ok(None)
            }
        }
    }

    fn open_record<T: DeserializeOwned>(
        &self,
        scope: CacheScope,
        slot: &str,
        binding: &[u8],
        bytes: &[u8],
        now: u64,
    ) -> VaultResult<T> {
        let record = CachedRecord::deserialize(bytes)?;
        if now >= record.expires_at {
            return Err(VaultError::IntegrityFailure(format!(
                "record expired at {}",
                record.expires_at
            )));
        }

        let envelope = envelope::decode(&record.envelope)?;
        let keys = self.local_keys(binding, &envelope.session_nonce)?;
        let aad = record_aad(scope, slot, record.created_at, record.expires_at);
        let plaintext = crypto::open(&keys.enc, &envelope.iv, &aad, &envelope.ciphertext)?;

        let expected = hmac_digest(&keys.mac, &plaintext)?;
        if !bool::from(expected.ct_eq(&record.digest)) {
            return Err(VaultError::IntegrityFailure(
                "digest mismatch".to_string(),
            ));
        }
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Overwrites `slot` with zeros, then deletes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails. A failed overwrite is logged and
    /// does not stop the delete.
    pub fn clear(&self, scope: CacheScope, slot: &str) -> VaultResult<()> {
        let slots = self.slots(scope);
        match slots.read(slot) {
            Ok(Some(existing)) => {
                if let Err(err) = slots.write_atomic(slot, &vec![0u8; existing.len()]) {
                    tracing::warn!(slot, error = %err, "cache overwrite failed");
                }
            }
            Ok(None) => return Ok(()),
            Err(err) => tracing::warn!(slot, error = %err, "cache read before overwrite failed"),
        }
        slots.delete(slot)?;
        tracing::debug!(scope = scope.as_ref(), slot, "cache record cleared");
        Ok(())
    }

    fn wipe(&self, scope: CacheScope, slot: &str, len: usize) {
        let slots = self.slots(scope);
        if let Err(err) = slots.write_atomic(slot, &vec![0u8; len]) {
            tracing::warn!(slot, error = %err, "cache overwrite failed");
        }
        if let Err(err) = slots.delete(slot) {
            tracing::error!(slot, error = %err, "failed to delete unverifiable cache record");
        }
    }

    fn local_keys(&self, binding: &[u8], salt: &[u8]) -> VaultResult<LocalKeys> {
        let params = Params::new(
            self.config.memory_kib,
            self.config.iterations,
            self.config.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|err| VaultError::Crypto(format!("argon2 params: {err}")))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut stretched = Zeroizing::new([0u8; KEY_LEN]);
        argon
            .hash_password_into(binding, salt, &mut stretched[..])
            .map_err(|err| VaultError::Crypto(format!("argon2: {err}")))?;

        let hk = Hkdf::<Sha256>::from_prk(stretched.as_ref())
            .map_err(|err| VaultError::Crypto(format!("cache key prk: {err}")))?;
        let mut enc = Zeroizing::new([0u8; KEY_LEN]);
        let mut mac = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(LABEL_CACHE_ENC, &mut enc[..])
            .map_err(|err| VaultError::Crypto(format!("cache enc key: {err}")))?;
        hk.expand(LABEL_CACHE_MAC, &mut mac[..])
            .map_err(|err| VaultError::Crypto(format!("cache mac key: {err}")))?;
        Ok(LocalKeys { enc, mac })
    }
}

fn check_binding(binding: &[u8]) -> VaultResult<()> {
    if binding.is_empty() {
        return Err(VaultError::invalid_input("binding", "must not be empty"));
    }
    Ok(())
}

fn hmac_digest(key: &[u8; KEY_LEN], plaintext: &[u8]) -> VaultResult<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| VaultError::Crypto(format!("cache digest: {err}")))?;
    mac.update(plaintext);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn record_aad(scope: CacheScope, slot: &str, created_at: u64, expires_at: u64) -> Vec<u8> {
    let scope = scope.as_ref().as_bytes();
    let mut aad =
        Vec::with_capacity(LABEL_CACHE_RECORD.len() + 4 + scope.len() + slot.len() + 16 + 2);
    aad.extend_from_slice(LABEL_CACHE_RECORD);
    aad.extend_from_slice(&RECORD_VERSION.to_be_bytes());
    aad.extend_from_slice(scope);
    aad.push(0x00);
    aad.extend_from_slice(slot.as_bytes());
    aad.push(0x00);
    aad.extend_from_slice(&created_at.to_be_bytes());
    aad.extend_from_slice(&expires_at.to_be_bytes());
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::MemorySlotStore;

    const NOW: u64 = 1_700_000_000;

    fn cheap_config() -> CacheConfig {
        CacheConfig {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
            session_ttl_secs: 3600,
            credentials_ttl_secs: 60,
        }
    }

    fn cache() -> (SecureCache, Arc<MemorySlotStore>, Arc<MemorySlotStore>) {
        let session = Arc::new(MemorySlotStore::new());
        let credentials = Arc::new(MemorySlotStore::new());
        let cache = SecureCache::new(
            Arc::clone(&session) as Arc<dyn SlotStore>,
            Arc::clone(&credentials) as Arc<dyn SlotStore>,
            cheap_config(),
        );
        (cache, session, credentials)
    }

    #[test]
    fn test_store_load_round_trip() {
        let (cache, session, credentials) = cache();
        let value = vec!["alpha".to_string(), "beta".to_string()];
        cache
            .store_at(CacheScope::Session, "s", b"0xabc", &value, NOW)
            .unwrap();
        assert!(session.exists("s").unwrap());
        assert!(!credentials.exists("s").unwrap());

        let loaded: Option<Vec<String>> = cache
            .load_at(CacheScope::Session, "s", b"0xabc", NOW + 10)
            .unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn test_missing_slot_is_none() {
        let (cache, _, _) = cache();
        let loaded: Option<String> = cache
            .load_at(CacheScope::Credentials, "nothing", b"0xabc", NOW)
            .unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_tampered_byte_fails_closed_and_wipes() {
        let (cache, session, _) = cache();
        cache
            .store_at(CacheScope::Session, "s", b"0xabc", &"secret".to_string(), NOW)
            .unwrap();
        let stored = session.read("s").unwrap().unwrap();

        for index in [stored.len() / 2, stored.len() - 1] {
            let mut tampered = stored.clone();
            tampered[index] ^= 0x01;
            session.write_atomic("s", &tampered).unwrap();
            let loaded: Option<String> = cache
                .load_at(CacheScope::Session, "s", b"0xabc", NOW)
                .unwrap();
            assert!(loaded.is_none());
            assert!(!session.exists("s").unwrap());
        }
    }

    #[test]
    fn test_wrong_binding_fails_closed() {
        let (cache, _, credentials) = cache();
        cache
            .store_at(CacheScope::Credentials, "c", b"key-a", &42u32, NOW)
            .unwrap();
        let loaded: Option<u32> = cache
            .load_at(CacheScope::Credentials, "c", b"key-b", NOW)
            .unwrap();
        assert!(loaded.is_none());
        assert!(credentials.list().is_empty());
    }

    #[test]
    fn test_expired_record_is_wiped() {
        let (cache, _, credentials) = cache();
        cache
            .store_at(CacheScope::Credentials, "c", b"key", &1u8, NOW)
            .unwrap();
        let fresh: Option<u8> = cache
            .load_at(CacheScope::Credentials, "c", b"key", NOW + 59)
            .unwrap();
        assert_eq!(fresh, Some(1));
        let expired: Option<u8> = cache
            .load_at(CacheScope::Credentials, "c", b"key", NOW + 60)
            .unwrap();
        assert!(expired.is_none());
        assert!(!credentials.exists("c").unwrap());
    }

    #[test]
    fn test_record_bound_to_slot_name() {
        let (cache, session, _) = cache();
        cache
            .store_at(CacheScope::Session, "a", b"key", &"x".to_string(), NOW)
            .unwrap();
        let bytes = session.read("a").unwrap().unwrap();
        session.write_atomic("b", &bytes).unwrap();
        let moved: Option<String> = cache.load_at(CacheScope::Session, "b", b"key", NOW).unwrap();
        assert!(moved.is_none());
    }

    #[test]
    fn test_clear_deletes_slot() {
        let (cache, session, _) = cache();
        cache
            .store_at(CacheScope::Session, "s", b"key", &"x".to_string(), NOW)
            .unwrap();
        cache.clear(CacheScope::Session, "s").unwrap();
        assert!(!session.exists("s").unwrap());
        cache.clear(CacheScope::Session, "s").unwrap();
    }

    #[test]
    fn test_empty_binding_rejected() {
        let (cache, _, _) = cache();
        assert!(cache
            .store_at(CacheScope::Session, "s", b"", &1u8, NOW)
            .is_err());
    }

    #[test]
    fn test_empty_binding_on_load_keeps_record() {
        let (cache, session, _) = cache();
        cache
            .store_at(CacheScope::Session, "s", b"key", &7u8, NOW)
            .unwrap();
        let result: VaultResult<Option<u8>> = cache.load_at(CacheScope::Session, "s", b"", NOW);
        assert!(matches!(result, Err(VaultError::InvalidInput { .. })));
        assert!(session.exists("s").unwrap());

        let loaded: Option<u8> = cache.load_at(CacheScope::Session, "s", b"key", NOW).unwrap();
        assert_eq!(loaded, Some(7));
    }

    #[test]
    fn test_digest_mismatch_fails_closed() {
        let (cache, session, _) = cache();
        // A record whose ciphertext authenticates but whose digest was forged
        // by someone holding the local encryption key.
        let plaintext = serde_json::to_vec(&"secret").unwrap();
        let salt = [3u8; SALT_LEN];
        let keys = cache.local_keys(b"key", &salt).unwrap();
        let expires_at = NOW + 3600;
        let aad = record_aad(CacheScope::Session, "s", NOW, expires_at);
        let (ciphertext, iv) = crypto::seal(&keys.enc, &aad, &plaintext).unwrap();
        let record = CachedRecord {
            version: RECORD_VERSION,
            created_at: NOW,
            expires_at,
            digest: vec![0u8; 32],
            envelope: envelope::encode(&salt, &iv, &ciphertext).unwrap(),
        };
        session.write_atomic("s", &record.serialize().unwrap()).unwrap();

        let err = cache
            .open_record::<String>(
                CacheScope::Session,
                "s",
                b"key",
                &session.read("s").unwrap().unwrap(),
                NOW,
            )
            .unwrap_err();
        assert!(matches!(err, VaultError::IntegrityFailure(_)));

        let loaded: Option<String> = cache.load_at(CacheScope::Session, "s", b"key", NOW).unwrap();
        assert!(loaded.is_none());
        assert!(!session.exists("s").unwrap());
    }

    #[test]
    fn test_slot_name_hides_value() {
        let name = slot_name("session", b"0xabc");
        assert!(name.starts_with("ledgervault.session."));
        assert!(!name.contains("abc"));
        assert_eq!(name, slot_name("session", b"0xabc"));
        assert_ne!(name, slot_name("session", b"0xabd"));
    }
}
