//! Slot lock manager trait for serialized read-modify-write cycles.

use crate::error::VaultResult;

/// Per-slot locking shared by every context that rewrites a slot.
///
/// The pending-write queue is read, modified and rewritten as one slot by
/// both the requester and the executor. Each cycle runs inside
/// [`SlotLockManager::with_slot_lock`], so an enqueue can never land between
/// another context's read and its write.
///
/// # Cross-Context Locking
///
/// Implementations MUST exclude other processes and extension contexts, not
/// just threads of one process:
/// - **Browser**: Web Locks API keyed by slot name
/// - **Native**: file lock next to the slot (`flock`/`LockFile`)
///
/// The lock is not reentrant; `f` must not take the same slot lock again.
pub trait SlotLockManager: Send + Sync {
    /// Runs `f` while holding the lock on `slot`.
    ///
    /// The lock is released when `f` returns, whether it succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock cannot be acquired, or the error of `f`.
    fn with_slot_lock(
        &self,
        slot: &str,
        f: &mut dyn FnMut() -> VaultResult<()>,
    ) -> VaultResult<()>;
}
