//! Device keystore trait.

use crate::error::VaultResult;

/// Device-bound authenticated encryption.
///
/// Protects data at rest that both the unprivileged requester and the
/// privileged executor must read without holding the master key, such as the
/// pending-write queue.
///
/// # Associated Data
///
/// `associated_data` MUST be covered by the authentication tag. Opening with
/// different associated data than was used for sealing MUST fail.
pub trait DeviceKeystore: Send + Sync {
    /// Encrypts `plaintext` with the device key.
    ///
    /// # Errors
    ///
    /// Returns an error if the keystore is unavailable.
    fn seal(&self, associated_data: &[u8], plaintext: &[u8]) -> VaultResult<Vec<u8>>;

    /// Decrypts `ciphertext` with the device key.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails or the keystore is
    /// unavailable.
    fn open(&self, associated_data: &[u8], ciphertext: &[u8]) -> VaultResult<Vec<u8>>;
}
