//! Save, read and delete credentials against the ledger and blob store.
//!
//! The ledger holds one entry per domain fingerprint. A current-format entry
//! points at one blob per stored account; saving another account for the same
//! domain appends a blob identifier and never replaces one.

use std::fmt;
use std::sync::Arc;

use crate::crypto;
use crate::derivation::{domain_fingerprint, DomainFingerprint, MasterKey};
use crate::error::{VaultError, VaultResult};
use crate::format::{self, StoredPayload, VaultRecord};
use crate::platform::{BlobStore, Ledger, WriteMode};
use crate::types::{BlobId, Credential, Owner, RecordId};

/// Result of a successful [`Vault::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    /// Blob holding the new credential.
    pub blob_id: BlobId,
    /// `true` if the ledger entry was created by this save.
    pub created: bool,
    /// Number of legacy credentials re-sealed as blobs by this save.
    pub upgraded_legacy: usize,
}

/// An entry `get` could not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    /// The blob, or `None` for an inline legacy payload.
    pub blob_id: Option<BlobId>,
    /// Why the entry was skipped.
    pub reason: String,
}

/// Result of [`Vault::get`] for a fingerprint that has a ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetrievedCredentials {
    /// Every credential that decoded, in stored order.
    pub credentials: Vec<Credential>,
    /// Entries that were missing or failed to decode.
    pub skipped: Vec<SkippedEntry>,
}

impl RetrievedCredentials {
    /// A ledger entry exists but nothing in it decoded.
    #[must_use]
    pub fn is_anomalous(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// Result of [`Vault::delete`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteOutcome {
    /// Blobs no longer referenced by the ledger. Removing them from the blob
    /// store is left to the caller.
    pub orphaned_blobs: Vec<BlobId>,
}

/// Coordinates the ledger and blob store for one process.
pub struct Vault {
    ledger: Arc<dyn Ledger>,
    blobs: Arc<dyn BlobStore>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    /// Creates a vault over the given collaborators.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { ledger, blobs }
    }

    /// Resolves the vault object of `address`.
    ///
    /// A `known_record` that still exists is reused; otherwise a new object
    /// is created.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub async fn open_owner(
        &self,
        address: &str,
        known_record: Option<RecordId>,
    ) -> VaultResult<Owner> {
        if let Some(record_id) = known_record {
            if self.ledger.record_exists(&record_id).await? {
                return Ok(Owner {
                    address: address.to_string(),
                    record_id,
                });
            }
            tracing::warn!(%record_id, "known vault object is gone, creating a new one");
        }
        let record_id = self.ledger.create_record(address).await?;
        tracing::info!(%record_id, "created vault object");
        Ok(Owner {
            address: address.to_string(),
            record_id,
        })
    }

    /// Stores `credential` and adds it to the domain's ledger entry.
    ///
    /// A legacy entry is upgraded on the way: its credentials are re-sealed
    /// as blobs in front of the new one. Saving the same credential twice
    /// stores it twice.
    ///
    /// # Errors
    ///
    /// Propagates ledger and blob store errors. Fails without touching the
    /// ledger if a legacy entry cannot be decoded.
    pub async fn save(
        &self,
        credential: &Credential,
        master: &MasterKey,
        owner: &Owner,
    ) -> VaultResult<SaveOutcome> {
        let fingerprint = domain_fingerprint(master, &credential.domain)?;
        let existing = self.read_entry(owner, &fingerprint).await?;

        let mut upgraded_legacy = 0;
        let (mut blob_ids, mode) = match &existing {
            None => (Vec::new(), WriteMode::Create),
            Some(record) => match record.classify() {
                StoredPayload::Current { blob_ids } => (blob_ids, WriteMode::Update),
                StoredPayload::Legacy {
                    ciphertext,
                    session_nonce,
                    iv,
                } => {
                    let legacy = format::decode_legacy(master, ciphertext, session_nonce, iv)?;
                    let mut ids = Vec::with_capacity(legacy.len() + 1);
                    for old in &legacy {
                        ids.push(self.put_credential(master, &fingerprint, old).await?);
                    }
                    upgraded_legacy = legacy.len();
                    tracing::info!(
                        fingerprint = %fingerprint.short(),
                        count = upgraded_legacy,
                        "upgrading legacy entry"
                    );
                    (ids, WriteMode::Update)
                }
            },
        };

        let blob_id = self.put_credential(master, &fingerprint, credential).await?;
        blob_ids.push(blob_id.clone());

        self.ledger
            .write_record(
                &owner.record_id,
                &fingerprint,
                format::encode_blob_ids(&blob_ids)?,
                Vec::new(),
                Vec::new(),
                mode,
            )
            .await?;

        tracing::info!(
            fingerprint = %fingerprint.short(),
            %blob_id,
            accounts = blob_ids.len(),
            "credential saved"
        );
        Ok(SaveOutcome {
            blob_id,
            created: mode == WriteMode::Create,
            upgraded_legacy,
        })
    }

    /// Returns every decodable credential stored for `domain`.
    ///
    /// `None` means the ledger has no entry. An entry whose blobs are all
    /// missing or undecodable yields an empty list plus the skipped entries.
    ///
    /// # Errors
    ///
    /// Only fails if the ledger lookup fails.
    pub async fn get(
        &self,
        domain: &str,
        master: &MasterKey,
        owner: &Owner,
    ) -> VaultResult<Option<RetrievedCredentials>> {
        let fingerprint = domain_fingerprint(master, domain)?;
        let Some(record) = self.read_entry(owner, &fingerprint).await? else {
            return Ok(None);
        };

        let retrieved = match record.classify() {
            StoredPayload::Current { blob_ids } => {
                self.decode_blobs(master, &fingerprint, &blob_ids).await
            }
            StoredPayload::Legacy {
                ciphertext,
                session_nonce,
                iv,
            } => match format::decode_legacy(master, ciphertext, session_nonce, iv) {
                Ok(credentials) => RetrievedCredentials {
                    credentials,
                    skipped: Vec::new(),
                },
                Err(err) => {
                    tracing::warn!(
                        fingerprint = %fingerprint.short(),
                        error = %err,
                        "legacy payload failed to decode"
                    );
                    RetrievedCredentials {
                        credentials: Vec::new(),
                        skipped: vec![SkippedEntry {
                            blob_id: None,
                            reason: err.to_string(),
                        }],
                    }
                }
            },
        };

        if retrieved.is_anomalous() {
            tracing::warn!(
                fingerprint = %fingerprint.short(),
                skipped = retrieved.skipped.len(),
                "ledger entry present but nothing decoded"
            );
        }
        Ok(Some(retrieved))
    }

    /// Checks whether the ledger has an entry for `domain`.
    ///
    /// # Errors
    ///
    /// Propagates ledger errors.
    pub async fn exists(&self, domain: &str, master: &MasterKey, owner: &Owner) -> VaultResult<bool> {
        let fingerprint = domain_fingerprint(master, domain)?;
        Ok(self.read_entry(owner, &fingerprint).await?.is_some())
    }

    /// Removes the ledger entry for `domain`.
    ///
    /// Blobs are not deleted; they are returned as orphans.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no entry and propagates other ledger
    /// errors.
    pub async fn delete(
        &self,
        domain: &str,
        master: &MasterKey,
        owner: &Owner,
    ) -> VaultResult<DeleteOutcome> {
        let fingerprint = domain_fingerprint(master, domain)?;
        let orphaned_blobs = match self.read_entry(owner, &fingerprint).await? {
            Some(record) => match record.classify() {
                StoredPayload::Current { blob_ids } => blob_ids,
                StoredPayload::Legacy { .. } => Vec::new(),
            },
            None => Vec::new(),
        };
        self.ledger
            .delete_record(&owner.record_id, &fingerprint)
            .await?;
        tracing::info!(
            fingerprint = %fingerprint.short(),
            orphaned = orphaned_blobs.len(),
            "ledger entry deleted"
        );
        Ok(DeleteOutcome { orphaned_blobs })
    }

    async fn read_entry(
        &self,
        owner: &Owner,
        fingerprint: &DomainFingerprint,
    ) -> VaultResult<Option<VaultRecord>> {
        match self.ledger.read_record(&owner.record_id, fingerprint).await {
            Ok(record) => Ok(Some(record)),
            Err(VaultError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn put_credential(
        &self,
        master: &MasterKey,
        fingerprint: &DomainFingerprint,
        credential: &Credential,
    ) -> VaultResult<BlobId> {
        let envelope = crypto::seal_credential(master, fingerprint, credential)?;
        self.blobs.put(envelope).await
    }

    async fn decode_blobs(
        &self,
        master: &MasterKey,
        fingerprint: &DomainFingerprint,
        blob_ids: &[BlobId],
    ) -> RetrievedCredentials {
        let fetched = match self.blobs.get_many(blob_ids).await {
            Ok(fetched) => fetched,
            Err(err) => {
                tracing::warn!(error = %err, "blob fetch failed");
                return RetrievedCredentials {
                    credentials: Vec::new(),
                    skipped: blob_ids
                        .iter()
                        .map(|id| SkippedEntry {
                            blob_id: Some(id.clone()),
                            reason: err.to_string(),
                        })
                        .collect(),
                };
            }
        };

        let mut retrieved = RetrievedCredentials::default();
        for blob_id in blob_ids {
            let outcome = match fetched.get(blob_id).and_then(Option::as_deref) {
                Some(bytes) => format::decode_current_blob(master, fingerprint, bytes),
                None => Err(VaultError::BlobStore("blob unavailable".to_string())),
            };
            match outcome {
                Ok(credential) => retrieved.credentials.push(credential),
                Err(err) => {
                    tracing::warn!(%blob_id, error = %err, "skipping blob");
                    retrieved.skipped.push(SkippedEntry {
                        blob_id: Some(blob_id.clone()),
                        reason: err.to_string(),
                    });
                }
            }
        }
        retrieved
    }
}
