//! Authenticated encryption for credential payloads and cache records.
//!
//! All ciphertext in the engine is XChaCha20-Poly1305 with a random 24-byte
//! nonce (the "IV" of the envelope layout) and caller-supplied associated data.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

use crate::derivation::{self, DomainFingerprint, MasterKey, SessionNonce, KEY_LEN};
use crate::envelope;
use crate::error::{VaultError, VaultResult};
use crate::types::Credential;

/// Length of the XChaCha20-Poly1305 nonce.
pub const IV_LEN: usize = 24;

/// Length of the Poly1305 tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Label binding credential blobs to their fingerprint.
const LABEL_CREDENTIAL_BLOB: &[u8] = b"ledgervault:credential-blob";

/// Generates a random AEAD nonce.
#[must_use]
pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Encrypts `plaintext` under `key`, authenticating `aad`.
///
/// Returns the ciphertext (with tag) and the freshly generated nonce.
///
/// # Errors
///
/// Returns [`VaultError::Crypto`] if encryption fails.
pub fn seal(
    key: &[u8; KEY_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> VaultResult<(Vec<u8>, [u8; IV_LEN])> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let iv = generate_iv();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&iv), Payload { msg: plaintext, aad })
        .map_err(|_| VaultError::Crypto("XChaCha20-Poly1305 encryption failed".to_string()))?;
    Ok((ciphertext, iv))
}

/// Decrypts `ciphertext` under `key`, verifying `aad`.
///
/// # Errors
///
/// Returns [`VaultError::MalformedEnvelope`] if `iv` has the wrong length and
/// [`VaultError::Crypto`] if authentication fails.
pub fn open(
    key: &[u8; KEY_LEN],
    iv: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> VaultResult<Zeroizing<Vec<u8>>> {
    if iv.len() != IV_LEN {
        return Err(VaultError::MalformedEnvelope(format!(
            "iv length mismatch: expected {IV_LEN}, got {}",
            iv.len()
        )));
    }
    let cipher = XChaCha20Poly1305::new(key.into());
    cipher
        .decrypt(XNonce::from_slice(iv), Payload { msg: ciphertext, aad })
        .map(Zeroizing::new)
        .map_err(|_| VaultError::Crypto("XChaCha20-Poly1305 decryption failed".to_string()))
}

fn credential_aad(fingerprint: &DomainFingerprint) -> Vec<u8> {
    let mut aad = Vec::with_capacity(LABEL_CREDENTIAL_BLOB.len() + 32);
    aad.extend_from_slice(LABEL_CREDENTIAL_BLOB);
    aad.extend_from_slice(fingerprint.as_bytes());
    aad
}

/// Encrypts one credential under a fresh session secret and packs it into an
/// envelope ready for the blob store.
///
/// # Errors
///
/// Returns an error if serialization or encryption fails.
pub fn seal_credential(
    master: &MasterKey,
    fingerprint: &DomainFingerprint,
    credential: &Credential,
) -> VaultResult<Vec<u8>> {
    let nonce = SessionNonce::generate();
    let secret = derivation::session_secret(master, &nonce)?;
    let plaintext = Zeroizing::new(serde_json::to_vec(credential)?);
    let (ciphertext, iv) = seal(secret.as_bytes(), &credential_aad(fingerprint), &plaintext)?;
    envelope::encode(nonce.as_bytes(), &iv, &ciphertext)
}

/// Decodes and decrypts a credential envelope produced by [`seal_credential`].
///
/// The session secret is re-derived from the nonce embedded in the envelope.
///
/// # Errors
///
/// Returns [`VaultError::MalformedEnvelope`] for a corrupt layout,
/// [`VaultError::Crypto`] if authentication fails, and
/// [`VaultError::Serialization`] if the plaintext is not a credential.
pub fn open_credential(
    master: &MasterKey,
    fingerprint: &DomainFingerprint,
    bytes: &[u8],
) -> VaultResult<Credential> {
    let envelope = envelope::decode(bytes)?;
    let nonce = SessionNonce::from_bytes(&envelope.session_nonce)
        .map_err(|_| VaultError::MalformedEnvelope("envelope has no session nonce".to_string()))?;
    let secret = derivation::session_secret(master, &nonce)?;
    let plaintext = open(
        secret.as_bytes(),
        &envelope.iv,
        &credential_aad(fingerprint),
        &envelope.ciphertext,
    )?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::{domain_fingerprint, master_from_proof, IdentityProof};

    fn master() -> MasterKey {
        master_from_proof(&IdentityProof::new("0xabc", "token")).unwrap()
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [0x11u8; KEY_LEN];
        let (ciphertext, iv) = seal(&key, b"aad", b"secret data").unwrap();
        assert_eq!(ciphertext.len(), b"secret data".len() + TAG_LEN);
        let plaintext = open(&key, &iv, b"aad", &ciphertext).unwrap();
        assert_eq!(plaintext.as_slice(), b"secret data");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let key = [0x22u8; KEY_LEN];
        let (mut ciphertext, iv) = seal(&key, b"aad", b"secret data").unwrap();
        assert!(matches!(
            open(&key, &iv, b"other", &ciphertext),
            Err(VaultError::Crypto(_))
        ));
        ciphertext[0] ^= 0xFF;
        assert!(matches!(
            open(&key, &iv, b"aad", &ciphertext),
            Err(VaultError::Crypto(_))
        ));
        assert!(matches!(
            open(&key, &iv[..12], b"aad", &ciphertext),
            Err(VaultError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_credential_roundtrip() {
        let key = master();
        let fingerprint = domain_fingerprint(&key, "example.com").unwrap();
        let credential = Credential::new("example.com", "u", "p");
        let bytes = seal_credential(&key, &fingerprint, &credential).unwrap();
        let decoded = envelope::decode(&bytes).unwrap();
        assert_eq!(decoded.session_nonce.len(), derivation::SESSION_NONCE_LEN);
        assert_eq!(decoded.iv.len(), IV_LEN);
        assert_eq!(open_credential(&key, &fingerprint, &bytes).unwrap(), credential);
    }

    #[test]
    fn test_credential_bound_to_fingerprint() {
        let key = master();
        let fingerprint = domain_fingerprint(&key, "example.com").unwrap();
        let other = domain_fingerprint(&key, "example.org").unwrap();
        let bytes =
            seal_credential(&key, &fingerprint, &Credential::new("example.com", "u", "p")).unwrap();
        assert!(matches!(
            open_credential(&key, &other, &bytes),
            Err(VaultError::Crypto(_))
        ));
    }

    #[test]
    fn test_tampered_credential_blob_fails() {
        let key = master();
        let fingerprint = domain_fingerprint(&key, "example.com").unwrap();
        let mut bytes =
            seal_credential(&key, &fingerprint, &Credential::new("example.com", "u", "p")).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(open_credential(&key, &fingerprint, &bytes).is_err());
    }
}
