//! In-memory implementations of the collaborator traits.
//!
//! These are NOT meant for production use. They back the unit and
//! integration tests and make failure injection possible (unavailable
//! signer, missing blobs, refused writes).

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::derivation::{DomainFingerprint, IdentityProof};
use crate::error::{VaultError, VaultResult};
use crate::format::VaultRecord;
use crate::types::{unix_now, BlobId, RecordId};

use super::{
    BlobStore, DeviceKeystore, IdentityProvider, Ledger, SlotLockManager, SlotStore, WriteMode,
};

fn poisoned(what: &str) -> VaultError {
    VaultError::Ledger(format!("{what} mutex poisoned"))
}

// =============================================================================
// Memory Ledger
// =============================================================================

struct LedgerObject {
    owner: String,
    entries: HashMap<[u8; 32], VaultRecord>,
}

#[derive(Default)]
struct LedgerState {
    next_id: u64,
    objects: HashMap<RecordId, LedgerObject>,
    failing_writes: usize,
    writes: usize,
}

/// In-memory ledger shared between caller sessions.
///
/// Each handle is authenticated as one caller; [`MemoryLedger::connect`]
/// opens another session on the same state.
#[derive(Clone)]
pub struct MemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    caller: String,
}

impl MemoryLedger {
    /// Creates an empty ledger with a session for `caller`.
    #[must_use]
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            caller: caller.into(),
        }
    }

    /// Opens a session for another caller on the same ledger state.
    #[must_use]
    pub fn connect(&self, caller: impl Into<String>) -> Self {
        Self {
            state: Arc::clone(&self.state),
            caller: caller.into(),
        }
    }

    /// Inserts an entry directly, bypassing authorization. Used to seed
    /// records in formats the engine no longer writes.
    pub fn insert_raw(&self, record_id: &RecordId, record: VaultRecord) {
        let mut state = self.state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(record_id) {
            object.entries.insert(*record.fingerprint.as_bytes(), record);
        }
    }

    /// Returns the stored entry, bypassing authorization.
    #[must_use]
    pub fn peek(
        &self,
        record_id: &RecordId,
        fingerprint: &DomainFingerprint,
    ) -> Option<VaultRecord> {
        let state = self.state.lock().unwrap();
        state
            .objects
            .get(record_id)
            .and_then(|object| object.entries.get(fingerprint.as_bytes()))
            .cloned()
    }

    /// Makes the next `count` writes fail with a ledger error.
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().unwrap().failing_writes = count;
    }

    /// Number of successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    fn authorized<'a>(
        &self,
        state: &'a mut LedgerState,
        record_id: &RecordId,
    ) -> VaultResult<&'a mut LedgerObject> {
        let object = state
            .objects
            .get_mut(record_id)
            .ok_or_else(|| VaultError::NotFound(format!("vault object {record_id}")))?;
        if object.owner != self.caller {
            return Err(VaultError::NotAuthorized(format!(
                "{} does not own {record_id}",
                self.caller
            )));
        }
        Ok(object)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_record(&self, owner: &str) -> VaultResult<RecordId> {
        if owner != self.caller {
            return Err(VaultError::NotAuthorized(format!(
                "{} cannot create a vault for {owner}",
                self.caller
            )));
        }
        let mut state = self.state.lock().map_err(|_| poisoned("ledger"))?;
        state.next_id += 1;
        let record_id = RecordId(format!("0xvault{:04}", state.next_id));
        state.objects.insert(
            record_id.clone(),
            LedgerObject {
                owner: owner.to_string(),
                entries: HashMap::new(),
            },
        );
        Ok(record_id)
    }

    async fn record_exists(&self, record_id: &RecordId) -> VaultResult<bool> {
        let state = self.state.lock().map_err(|_| poisoned("ledger"))?;
        Ok(state.objects.contains_key(record_id))
    }

    async fn read_record(
        &self,
        record_id: &RecordId,
        fingerprint: &DomainFingerprint,
    ) -> VaultResult<VaultRecord> {
        let mut state = self.state.lock().map_err(|_| poisoned("ledger"))?;
        let object = self.authorized(&mut state, record_id)?;
        object
            .entries
            .get(fingerprint.as_bytes())
            .cloned()
            .ok_or_else(|| VaultError::NotFound(format!("entry {}", fingerprint.short())))
    }

    async fn write_record(
        &self,
        record_id: &RecordId,
        fingerprint: &DomainFingerprint,
        payload_ref: Vec<u8>,
        aux_nonce_a: Vec<u8>,
        aux_nonce_b: Vec<u8>,
        mode: WriteMode,
    ) -> VaultResult<()> {
        let now = unix_now()?;
        let mut state = self.state.lock().map_err(|_| poisoned("ledger"))?;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(VaultError::Ledger("transaction rejected".to_string()));
        }
        let object = self.authorized(&mut state, record_id)?;
        let exists = object.entries.contains_key(fingerprint.as_bytes());
        match (mode, exists) {
            (WriteMode::Create, true) => {
                return Err(VaultError::Ledger(format!(
                    "entry {} already exists",
                    fingerprint.short()
                )));
            }
            (WriteMode::Update, false) => {
                return Err(VaultError::NotFound(format!("entry {}", fingerprint.short())));
            }
            _ => {}
        }
        object.entries.insert(
            *fingerprint.as_bytes(),
            VaultRecord {
                fingerprint: *fingerprint,
                payload_ref,
                aux_nonce_a,
                aux_nonce_b,
                created_at: now,
            },
        );
        state.writes += 1;
        Ok(())
    }

    async fn delete_record(
        &self,
        record_id: &RecordId,
        fingerprint: &DomainFingerprint,
    ) -> VaultResult<()> {
        let mut state = self.state.lock().map_err(|_| poisoned("ledger"))?;
        let object = self.authorized(&mut state, record_id)?;
        object
            .entries
            .remove(fingerprint.as_bytes())
            .map(|_| ())
            .ok_or_else(|| VaultError::NotFound(format!("entry {}", fingerprint.short())))
    }
}

// =============================================================================
// Memory Blob Store
// =============================================================================

/// Content-addressed in-memory blob store.
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobId, Vec<u8>>>,
    // Successful puts left before every put fails; `usize::MAX` never fails.
    puts_before_failure: AtomicUsize,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self {
            blobs: RwLock::default(),
            puts_before_failure: AtomicUsize::new(usize::MAX),
        }
    }
}

impl MemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().unwrap().is_empty()
    }

    /// Drops a blob, simulating an unavailable aggregator node.
    pub fn remove(&self, id: &BlobId) {
        self.blobs.write().unwrap().remove(id);
    }

    /// Overwrites the content of a blob without changing its identifier.
    pub fn replace(&self, id: &BlobId, bytes: Vec<u8>) {
        self.blobs.write().unwrap().insert(id.clone(), bytes);
    }

    /// Makes every subsequent `put` fail (or succeed again).
    pub fn set_fail_puts(&self, fail: bool) {
        let budget = if fail { 0 } else { usize::MAX };
        self.puts_before_failure.store(budget, Ordering::SeqCst);
    }

    /// Lets `successes` more puts through, then fails every later one.
    pub fn fail_puts_after(&self, successes: usize) {
        self.puts_before_failure.store(successes, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> VaultResult<BlobId> {
        let allowed = self
            .puts_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                usize::MAX => Some(usize::MAX),
                left => Some(left - 1),
            })
            .is_ok();
        if !allowed {
            return Err(VaultError::BlobStore("publisher unavailable".to_string()));
        }
        let id = BlobId::new(hex::encode(Sha256::digest(&bytes)))?;
        self.blobs
            .write()
            .map_err(|_| VaultError::BlobStore("mutex poisoned".to_string()))?
            .insert(id.clone(), bytes);
        Ok(id)
    }

    async fn get_many(&self, ids: &[BlobId]) -> VaultResult<HashMap<BlobId, Option<Vec<u8>>>> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| VaultError::BlobStore("mutex poisoned".to_string()))?;
        Ok(ids
            .iter()
            .map(|id| (id.clone(), blobs.get(id).cloned()))
            .collect())
    }
}

// =============================================================================
// Static Identity Provider
// =============================================================================

/// Identity provider returning a fixed proof.
///
/// Counts calls so tests can assert how often derivation hit the provider.
pub struct StaticIdentityProvider {
    address: String,
    token: String,
    calls: AtomicUsize,
    available: AtomicBool,
    delay: Option<Duration>,
}

impl StaticIdentityProvider {
    /// Creates a provider proving `address` with `token`.
    #[must_use]
    pub fn new(address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: token.into(),
            calls: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            delay: None,
        }
    }

    /// Makes every proof take `delay` to arrive.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Toggles whether the signer answers.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `prove_identity` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn prove_identity(&self) -> VaultResult<IdentityProof> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(VaultError::Derivation("identity signer unavailable".to_string()));
        }
        Ok(IdentityProof::new(self.address.clone(), self.token.clone()))
    }
}

// =============================================================================
// Memory Slot Store
// =============================================================================

/// In-memory slot store.
#[derive(Default)]
pub struct MemorySlotStore {
    slots: RwLock<HashMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemorySlotStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a list of all slot names.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.slots.read().unwrap().keys().cloned().collect()
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl SlotStore for MemorySlotStore {
    fn read(&self, name: &str) -> VaultResult<Option<Vec<u8>>> {
        Ok(self
            .slots
            .read()
            .map_err(|_| VaultError::CacheStorage("mutex poisoned".to_string()))?
            .get(name)
            .cloned())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> VaultResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(VaultError::CacheStorage("storage quota exceeded".to_string()));
        }
        self.slots
            .write()
            .map_err(|_| VaultError::CacheStorage("mutex poisoned".to_string()))?
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, name: &str) -> VaultResult<()> {
        self.slots
            .write()
            .map_err(|_| VaultError::CacheStorage("mutex poisoned".to_string()))?
            .remove(name);
        Ok(())
    }
}

// =============================================================================
// Memory Slot Locks
// =============================================================================

/// Slot lock manager for contexts living in one process.
///
/// Clones share the same lock table, so a requester and an executor built
/// from clones of one `MemorySlotLocks` exclude each other.
#[derive(Clone, Default)]
pub struct MemorySlotLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl MemorySlotLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SlotLockManager for MemorySlotLocks {
    fn with_slot_lock(
        &self,
        slot: &str,
        f: &mut dyn FnMut() -> VaultResult<()>,
    ) -> VaultResult<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| VaultError::CacheStorage("lock table poisoned".to_string()))?;
            Arc::clone(locks.entry(slot.to_string()).or_default())
        };
        let _held = lock
            .lock()
            .map_err(|_| VaultError::CacheStorage(format!("slot lock {slot} poisoned")))?;
        f()
    }
}

// =============================================================================
// Memory Keystore
// =============================================================================

const KEYSTORE_NONCE_LEN: usize = 24;

/// Device keystore backed by a random in-memory key.
pub struct MemoryKeystore {
    key: [u8; 32],
}

impl MemoryKeystore {
    /// Creates a keystore with a fresh random key.
    #[must_use]
    pub fn new() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }
}

impl Default for MemoryKeystore {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceKeystore for MemoryKeystore {
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> VaultResult<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        let mut nonce = [0u8; KEYSTORE_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: associated_data,
                },
            )
            .map_err(|err| VaultError::Keystore(err.to_string()))?;
        let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, associated_data: &[u8], ciphertext: &[u8]) -> VaultResult<Vec<u8>> {
        if ciphertext.len() < KEYSTORE_NONCE_LEN {
            return Err(VaultError::Keystore(
                "keystore ciphertext too short".to_string(),
            ));
        }
        let (nonce, payload) = ciphertext.split_at(KEYSTORE_NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.key));
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: payload,
                    aad: associated_data,
                },
            )
            .map_err(|err| VaultError::Keystore(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint(byte: u8) -> DomainFingerprint {
        DomainFingerprint::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn test_ledger_owner_authorization() {
        let ledger = MemoryLedger::new("0xalice");
        let record_id = ledger.create_record("0xalice").await.unwrap();
        assert!(ledger.record_exists(&record_id).await.unwrap());

        let mallory = ledger.connect("0xmallory");
        assert!(matches!(
            mallory.create_record("0xalice").await,
            Err(VaultError::NotAuthorized(_))
        ));
        assert!(matches!(
            mallory.read_record(&record_id, &fingerprint(1)).await,
            Err(VaultError::NotAuthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_ledger_write_modes() {
        let ledger = MemoryLedger::new("0xalice");
        let record_id = ledger.create_record("0xalice").await.unwrap();
        let fp = fingerprint(2);
        assert!(matches!(
            ledger
                .write_record(&record_id, &fp, b"[]".to_vec(), vec![], vec![], WriteMode::Update)
                .await,
            Err(VaultError::NotFound(_))
        ));
        ledger
            .write_record(&record_id, &fp, b"[\"a\"]".to_vec(), vec![], vec![], WriteMode::Create)
            .await
            .unwrap();
        assert!(ledger
            .write_record(&record_id, &fp, b"[]".to_vec(), vec![], vec![], WriteMode::Create)
            .await
            .is_err());
        let record = ledger.read_record(&record_id, &fp).await.unwrap();
        assert_eq!(record.payload_ref, b"[\"a\"]".to_vec());

        ledger.delete_record(&record_id, &fp).await.unwrap();
        assert!(matches!(
            ledger.read_record(&record_id, &fp).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_blob_store_partial_map() {
        let store = MemoryBlobStore::new();
        let a = store.put(vec![1, 2, 3]).await.unwrap();
        let b = store.put(vec![4, 5, 6]).await.unwrap();
        store.remove(&b);
        let map = store.get_many(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&a], Some(vec![1, 2, 3]));
        assert_eq!(map[&b], None);
    }

    #[test]
    fn test_keystore_round_trip_and_aad() {
        let keystore = MemoryKeystore::new();
        let sealed = keystore.seal(b"ad", b"plaintext").unwrap();
        assert_eq!(keystore.open(b"ad", &sealed).unwrap(), b"plaintext");
        assert!(keystore.open(b"other", &sealed).is_err());
        assert!(MemoryKeystore::new().open(b"ad", &sealed).is_err());
    }
}
