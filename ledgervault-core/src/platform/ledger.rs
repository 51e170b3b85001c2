//! Ledger interface.

use async_trait::async_trait;

use crate::derivation::DomainFingerprint;
use crate::error::VaultResult;
use crate::format::VaultRecord;
use crate::types::RecordId;

/// Whether a write creates a new fingerprint entry or replaces an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The entry must not exist yet.
    Create,
    /// The entry must already exist.
    Update,
}

/// The on-chain vault object of an owner.
///
/// Every call is authenticated as the owner. Implementations report refused
/// calls as [`VaultError::NotAuthorized`] and missing records or entries as
/// [`VaultError::NotFound`]; the engine passes both through unchanged and
/// never retries them.
///
/// The ledger is the source of truth and may be mutated concurrently by other
/// clients of the same owner.
///
/// [`VaultError::NotAuthorized`]: crate::VaultError::NotAuthorized
/// [`VaultError::NotFound`]: crate::VaultError::NotFound
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Creates an empty vault object owned by `owner`.
    ///
    /// # Errors
    ///
    /// Returns an error if the caller is not `owner` or the ledger call fails.
    async fn create_record(&self, owner: &str) -> VaultResult<RecordId>;

    /// Checks whether a vault object exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger call fails.
    async fn record_exists(&self, record_id: &RecordId) -> VaultResult<bool>;

    /// Reads the entry stored under `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such object or entry.
    async fn read_record(
        &self,
        record_id: &RecordId,
        fingerprint: &DomainFingerprint,
    ) -> VaultResult<VaultRecord>;

    /// Creates or replaces the entry stored under `fingerprint`.
    ///
    /// Current-format writes pass empty auxiliary nonce fields.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an update of a missing entry, or an error if the
    /// entry already exists for a create.
    async fn write_record(
        &self,
        record_id: &RecordId,
        fingerprint: &DomainFingerprint,
        payload_ref: Vec<u8>,
        aux_nonce_a: Vec<u8>,
        aux_nonce_b: Vec<u8>,
        mode: WriteMode,
    ) -> VaultResult<()>;

    /// Removes the entry stored under `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such entry.
    async fn delete_record(
        &self,
        record_id: &RecordId,
        fingerprint: &DomainFingerprint,
    ) -> VaultResult<()>;
}
