//! Key derivation for the vault.
//!
//! Three derivations hang off one identity:
//!
//! ```text
//! master_key   = HKDF-SHA256(salt = "ledgervault:master-salt",
//!                            ikm  = address || 0x00 || token,
//!                            info = "ledgervault:master-key")
//! fingerprint  = HMAC-SHA256(master_key, "ledgervault:domain-fingerprint" || normalize(domain))
//! session_key  = HKDF-SHA256(salt = session_nonce, ikm = master_key,
//!                            info = "ledgervault:session-secret")
//! ```
//!
//! Only [`derive_master`] performs I/O (it asks the identity provider for a
//! proof). The other functions are pure.

use std::fmt;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{VaultError, VaultResult};
use crate::platform::IdentityProvider;

// Domain Separation Labels

const LABEL_MASTER_SALT: &[u8] = b"ledgervault:master-salt";
const LABEL_MASTER_KEY: &[u8] = b"ledgervault:master-key";
const LABEL_FINGERPRINT: &[u8] = b"ledgervault:domain-fingerprint";
const LABEL_SESSION_SECRET: &[u8] = b"ledgervault:session-secret";

/// Length of every key produced by this module.
pub const KEY_LEN: usize = 32;

/// Length of a freshly generated [`SessionNonce`].
pub const SESSION_NONCE_LEN: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Proof of identity returned by the identity provider.
///
/// The token is opaque to the engine and only used as derivation input.
pub struct IdentityProof {
    /// Ledger address of the identity.
    pub address: String,
    /// Externally issued token bound to the address.
    pub token: SecretString,
}

impl IdentityProof {
    /// Creates a proof from an address and token.
    pub fn new(address: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            token: SecretString::from(token.into()),
        }
    }
}

impl fmt::Debug for IdentityProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityProof")
            .field("address", &self.address)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Root secret of one identity.
///
/// Not `Clone`: the only way to get a second copy is through the lifecycle
/// manager. The bytes are zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; KEY_LEN]);

impl MasterKey {
    /// Creates a master key from raw bytes, e.g. when rehydrating from the
    /// secure cache.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns a reference to the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Keyed one-way tag of a domain, used as the ledger lookup key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainFingerprint([u8; 32]);

impl DomainFingerprint {
    /// Creates a fingerprint from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw fingerprint bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Converts the fingerprint to a hexadecimal string.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex prefix suitable for logs.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Debug for DomainFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainFingerprint({})", self.to_hex())
    }
}

/// Random input to a [`SessionSecret`] derivation.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionNonce(Vec<u8>);

impl SessionNonce {
    /// Generates a fresh random nonce.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SESSION_NONCE_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wraps nonce bytes read back from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is empty.
    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.is_empty() {
            return Err(VaultError::invalid_input("session_nonce", "must not be empty"));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Returns the nonce bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SessionNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionNonce({})", hex::encode(&self.0))
    }
}

/// One-time key encrypting exactly one credential payload.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret([u8; KEY_LEN]);

impl SessionSecret {
    /// Returns the raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSecret")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Asks the identity provider for a proof and derives the master key from it.
///
/// Deterministic for a fixed `(address, token)` pair.
///
/// # Errors
///
/// Returns [`VaultError::Derivation`] if the provider is unavailable, returns
/// an empty address or token, or proves a different address than `expected`.
pub async fn derive_master(
    provider: &dyn IdentityProvider,
    expected_address: &str,
) -> VaultResult<MasterKey> {
    let proof = provider
        .prove_identity()
        .await
        .map_err(|err| match err {
            VaultError::Derivation(_) => err,
            other => VaultError::Derivation(format!("identity provider unavailable: {other}")),
        })?;
    if proof.address != expected_address {
        return Err(VaultError::Derivation(format!(
            "identity provider proved {} instead of {expected_address}",
            proof.address
        )));
    }
    master_from_proof(&proof)
}

/// Derives the master key from an identity proof already in hand.
///
/// # Errors
///
/// Returns [`VaultError::Derivation`] if the address or token is empty.
pub fn master_from_proof(proof: &IdentityProof) -> VaultResult<MasterKey> {
    let token = proof.token.expose_secret();
    if proof.address.is_empty() || token.is_empty() {
        return Err(VaultError::Derivation(
            "identity proof is missing its address or token".to_string(),
        ));
    }

    let mut ikm = Zeroizing::new(Vec::with_capacity(proof.address.len() + 1 + token.len()));
    ikm.extend_from_slice(proof.address.as_bytes());
    ikm.push(0x00);
    ikm.extend_from_slice(token.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(LABEL_MASTER_SALT), &ikm);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(LABEL_MASTER_KEY, &mut okm)
        .map_err(|err| VaultError::Crypto(format!("master key expand: {err}")))?;
    let key = MasterKey(okm);
    okm.zeroize();
    Ok(key)
}

/// Normalizes a domain for fingerprinting: trims whitespace, lowercases,
/// strips any `scheme://` prefix and trailing slashes.
///
/// # Errors
///
/// Returns an error if nothing is left after normalization.
pub fn normalize_domain(domain: &str) -> VaultResult<String> {
    let lowered = domain.trim().to_lowercase();
    let without_scheme = lowered
        .split_once("://")
        .map_or(lowered.as_str(), |(_, rest)| rest);
    let normalized = without_scheme.trim_end_matches('/');
    if normalized.is_empty() {
        return Err(VaultError::invalid_input("domain", "empty after normalization"));
    }
    Ok(normalized.to_string())
}

/// Computes the ledger lookup key for `domain`.
///
/// # Errors
///
/// Returns an error if the domain normalizes to an empty string.
pub fn domain_fingerprint(master: &MasterKey, domain: &str) -> VaultResult<DomainFingerprint> {
    let normalized = normalize_domain(domain)?;
    let mut mac = <HmacSha256 as Mac>::new_from_slice(master.as_bytes())
        .map_err(|err| VaultError::Crypto(format!("fingerprint hmac: {err}")))?;
    mac.update(LABEL_FINGERPRINT);
    mac.update(normalized.as_bytes());
    let tag = mac.finalize().into_bytes();

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&tag);
    Ok(DomainFingerprint(bytes))
}

/// Derives the one-time key for the payload sealed under `nonce`.
///
/// # Errors
///
/// Only fails if HKDF rejects the output length, which cannot happen for
/// 32-byte keys.
pub fn session_secret(master: &MasterKey, nonce: &SessionNonce) -> VaultResult<SessionSecret> {
    let hk = Hkdf::<Sha256>::new(Some(nonce.as_bytes()), master.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hk.expand(LABEL_SESSION_SECRET, &mut okm)
        .map_err(|err| VaultError::Crypto(format!("session secret expand: {err}")))?;
    let secret = SessionSecret(okm);
    okm.zeroize();
    Ok(secret)
}
