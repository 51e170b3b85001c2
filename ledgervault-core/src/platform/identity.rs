//! Identity provider interface.

use async_trait::async_trait;

use crate::derivation::IdentityProof;
use crate::error::VaultResult;

/// Source of the identity proof the master key is derived from.
///
/// For the same signed-in identity the provider must return the same
/// `(address, token)` pair across sessions, otherwise previously stored
/// fingerprints become unreachable.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Proves the current identity.
    ///
    /// # Errors
    ///
    /// Returns an error if no identity is signed in or the signer is
    /// unavailable. The engine reports it as a derivation error.
    async fn prove_identity(&self) -> VaultResult<IdentityProof>;
}
