//! Core type definitions shared across the engine.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{VaultError, VaultResult};

/// A stored login for one domain.
///
/// The password is wiped from memory when the value is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Credential {
    /// Domain the login belongs to, as entered by the user.
    pub domain: String,
    /// Account name.
    pub username: String,
    /// Account secret.
    pub password: String,
}

impl Credential {
    /// Creates a credential.
    pub fn new(
        domain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Identifier of a blob in the blob store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    /// Wraps a blob store identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is empty.
    pub fn new(id: impl Into<String>) -> VaultResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(VaultError::invalid_input("blob_id", "must not be empty"));
        }
        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an owner's vault object on the ledger.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.0)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An authenticated owner together with their vault object on the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    /// Ledger address of the owner.
    pub address: String,
    /// The owner's vault object.
    pub record_id: RecordId,
}

/// Current unix time in seconds.
///
/// # Errors
///
/// Returns an error if the system clock is before the unix epoch.
pub fn unix_now() -> VaultResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|err| VaultError::invalid_input("system_time", err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_redacts_password() {
        let credential = Credential::new("example.com", "alice", "hunter2");
        let debug = format!("{credential:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_blob_id_rejects_empty() {
        assert!(BlobId::new("").is_err());
        assert_eq!(BlobId::new("abc").unwrap().as_str(), "abc");
    }

    #[test]
    fn test_blob_id_serializes_as_string() {
        let ids = vec![BlobId::new("a").unwrap(), BlobId::new("b").unwrap()];
        assert_eq!(serde_json::to_string(&ids).unwrap(), r#"["a","b"]"#);
    }
}
