//! Named slot storage for local persistence.

use crate::error::VaultResult;

/// Atomic storage for small named slots.
///
/// Used for the two secure cache scopes and the pending-write transport.
/// Writes MUST be atomic: a slot holds either the complete old content or the
/// complete new content, never a mix.
pub trait SlotStore: Send + Sync {
    /// Reads a slot.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    fn read(&self, name: &str) -> VaultResult<Option<Vec<u8>>>;

    /// Atomically writes a slot, replacing any existing content.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write_atomic(&self, name: &str, bytes: &[u8]) -> VaultResult<()>;

    /// Deletes a slot. Deleting a missing slot succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error only for actual storage failures.
    fn delete(&self, name: &str) -> VaultResult<()>;

    /// Checks if a slot exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying read fails.
    fn exists(&self, name: &str) -> VaultResult<bool> {
        Ok(self.read(name)?.is_some())
    }
}
