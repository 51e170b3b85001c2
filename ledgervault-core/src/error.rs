//! Error types for the vault engine.
//!
//! Every fallible operation in the crate returns [`VaultResult`]. The variants
//! follow the recovery policy of the engine: derivation and ledger errors are
//! surfaced to the caller as-is, envelope errors are local to one blob, and
//! integrity failures never leave the secure cache as data.

use thiserror::Error;

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;

/// Errors raised by the vault engine and its collaborators.
///
/// The enum is `Clone` so one in-flight derivation result can be handed to
/// every caller awaiting it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    /// The identity proof was unavailable or rejected.
    #[error("derivation error: {0}")]
    Derivation(String),

    /// A stored envelope is truncated or its declared lengths are inconsistent.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The ledger refused the call for the authenticated caller.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The ledger has no such record.
    #[error("not found: {0}")]
    NotFound(String),

    /// A secure cache record failed its integrity check.
    #[error("integrity failure: {0}")]
    IntegrityFailure(String),

    /// A deferred write could not be applied.
    #[error("pending write {id} failed: {reason}")]
    QueueExecutionFailure {
        /// Identifier of the pending write.
        id: String,
        /// Description of the failure.
        reason: String,
    },

    /// AEAD, HKDF or Argon2 failures.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Serialization/deserialization failures.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Errors coming from the ledger collaborator other than the two above.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Errors coming from the blob store.
    #[error("blob store error: {0}")]
    BlobStore(String),

    /// Errors coming from local cache persistence.
    #[error("cache storage error: {0}")]
    CacheStorage(String),

    /// Errors coming from the device keystore.
    #[error("keystore error: {0}")]
    Keystore(String),

    /// Invalid input parameter.
    #[error("invalid input '{parameter}': {reason}")]
    InvalidInput {
        /// Name of the invalid parameter.
        parameter: String,
        /// Description of the issue.
        reason: String,
    },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),
}

impl VaultError {
    /// Creates an invalid input error.
    pub fn invalid_input<P: Into<String>, R: Into<String>>(parameter: P, reason: R) -> Self {
        Self::InvalidInput {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Creates a queue execution failure for entry `id`.
    pub fn queue_failure<I: Into<String>, R: Into<String>>(id: I, reason: R) -> Self {
        Self::QueueExecutionFailure {
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors reported by the ledger about the caller's
    /// request itself. These are never retried by the engine.
    #[must_use]
    pub const fn is_ledger_rejection(&self) -> bool {
        matches!(self, Self::NotAuthorized(_) | Self::NotFound(_))
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VaultError::MalformedEnvelope("header truncated".to_string());
        assert!(format!("{err}").contains("malformed envelope"));
        let err = VaultError::queue_failure("abc", "ledger down");
        assert_eq!(format!("{err}"), "pending write abc failed: ledger down");
        let err = VaultError::invalid_input("domain", "empty");
        assert!(format!("{err}").contains("invalid input 'domain'"));
    }

    #[test]
    fn test_ledger_rejection() {
        assert!(VaultError::NotFound("x".into()).is_ledger_rejection());
        assert!(VaultError::NotAuthorized("x".into()).is_ledger_rejection());
        assert!(!VaultError::Ledger("x".into()).is_ledger_rejection());
    }
}
