//! Classification of ledger records into the two storage layouts.
//!
//! Two encodings coexist on the ledger:
//!
//! - **Current**: `payload_ref` is a JSON array of blob identifiers and both
//!   auxiliary nonce fields are empty. Each blob is an envelope carrying its
//!   own session nonce and IV.
//! - **Legacy**: `payload_ref` is the raw ciphertext itself. The session nonce
//!   lives in `aux_nonce_a` and the IV in `aux_nonce_b`.
//!
//! Classification tries the current layout first; anything that does not
//! parse as a non-empty array of non-empty strings is treated as legacy.
//! Classification itself never fails, so old and new records are read through
//! the same call.

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::crypto;
use crate::derivation::{self, DomainFingerprint, MasterKey, SessionNonce};
use crate::error::{VaultError, VaultResult};
use crate::types::{BlobId, Credential};

/// An entry as stored on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultRecord {
    /// Lookup key of the entry.
    pub fingerprint: DomainFingerprint,
    /// JSON blob-id array (current) or raw ciphertext (legacy).
    pub payload_ref: Vec<u8>,
    /// Legacy session nonce; empty for current records.
    pub aux_nonce_a: Vec<u8>,
    /// Legacy IV; empty for current records.
    pub aux_nonce_b: Vec<u8>,
    /// Unix time of the last write.
    pub created_at: u64,
}

/// Decode path selected for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredPayload<'a> {
    /// Blob references, one per stored account.
    Current {
        /// Referenced blobs, in insertion order.
        blob_ids: Vec<BlobId>,
    },
    /// Inline ciphertext with nonces kept on the record.
    Legacy {
        /// Raw ciphertext.
        ciphertext: &'a [u8],
        /// Session nonce the key was derived from.
        session_nonce: &'a [u8],
        /// AEAD nonce.
        iv: &'a [u8],
    },
}

impl VaultRecord {
    /// Selects the decode path for this record.
    #[must_use]
    pub fn classify(&self) -> StoredPayload<'_> {
        parse_blob_ids(&self.payload_ref).map_or(
            StoredPayload::Legacy {
                ciphertext: &self.payload_ref,
                session_nonce: &self.aux_nonce_a,
                iv: &self.aux_nonce_b,
            },
            |blob_ids| StoredPayload::Current { blob_ids },
        )
    }

    /// Returns `true` if the record uses the current layout.
    #[must_use]
    pub fn is_current(&self) -> bool {
        matches!(self.classify(), StoredPayload::Current { .. })
    }
}

/// Parses a current-format `payload_ref`.
///
/// Returns `None` unless the bytes are a non-empty JSON array of non-empty
/// strings.
#[must_use]
pub fn parse_blob_ids(payload_ref: &[u8]) -> Option<Vec<BlobId>> {
    let raw: Vec<String> = serde_json::from_slice(payload_ref).ok()?;
    if raw.is_empty() {
        return None;
    }
    raw.into_iter().map(|id| BlobId::new(id).ok()).collect()
}

/// Serializes blob identifiers as a current-format `payload_ref`.
///
/// # Errors
///
/// Returns an error if `blob_ids` is empty, since an empty array would be
/// read back as legacy.
pub fn encode_blob_ids(blob_ids: &[BlobId]) -> VaultResult<Vec<u8>> {
    if blob_ids.is_empty() {
        return Err(VaultError::invalid_input(
            "blob_ids",
            "a current-format record needs at least one blob",
        ));
    }
    Ok(serde_json::to_vec(blob_ids)?)
}

/// Current decode path for one blob.
///
/// The session secret is re-derived from the nonce embedded in the blob.
///
/// # Errors
///
/// Returns [`VaultError::MalformedEnvelope`] for a corrupt layout,
/// [`VaultError::Crypto`] if authentication fails, and
/// [`VaultError::Serialization`] if the plaintext is not a credential.
pub fn decode_current_blob(
    master: &MasterKey,
    fingerprint: &DomainFingerprint,
    bytes: &[u8],
) -> VaultResult<Credential> {
    crypto::open_credential(master, fingerprint, bytes)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LegacyPlaintext {
    Many(Vec<Credential>),
    One(Credential),
}

/// Legacy decode path.
///
/// Legacy payloads hold either one credential object or an array of them.
///
/// # Errors
///
/// Returns [`VaultError::MalformedEnvelope`] if the record has no nonces,
/// [`VaultError::Crypto`] if authentication fails, and
/// [`VaultError::Serialization`] if the plaintext is not credential JSON.
pub fn decode_legacy(
    master: &MasterKey,
    ciphertext: &[u8],
    session_nonce: &[u8],
    iv: &[u8],
) -> VaultResult<Vec<Credential>> {
    if session_nonce.is_empty() || iv.is_empty() {
        return Err(VaultError::MalformedEnvelope(
            "legacy record without auxiliary nonces".to_string(),
        ));
    }
    let nonce = SessionNonce::from_bytes(session_nonce)?;
    let secret = derivation::session_secret(master, &nonce)?;
    let plaintext: Zeroizing<Vec<u8>> = crypto::open(secret.as_bytes(), iv, &[], ciphertext)?;
    match serde_json::from_slice(&plaintext)? {
        LegacyPlaintext::Many(credentials) => Ok(credentials),
        LegacyPlaintext::One(credential) => Ok(vec![credential]),
    }
}

/// Builds a legacy-format record, as older clients wrote them.
#[cfg(test)]
pub(crate) fn seal_legacy(
    master: &MasterKey,
    fingerprint: DomainFingerprint,
    credentials: &[Credential],
) -> VaultRecord {
    let nonce = SessionNonce::generate();
    let secret = derivation::session_secret(master, &nonce).unwrap();
    let plaintext = if credentials.len() == 1 {
        serde_json::to_vec(&credentials[0]).unwrap()
    } else {
        serde_json::to_vec(credentials).unwrap()
    };
    let (ciphertext, iv) = crypto::seal(secret.as_bytes(), &[], &plaintext).unwrap();
    VaultRecord {
        fingerprint,
        payload_ref: ciphertext,
        aux_nonce_a: nonce.as_bytes().to_vec(),
        aux_nonce_b: iv.to_vec(),
        created_at: 1_600_000_000,
    }
}
