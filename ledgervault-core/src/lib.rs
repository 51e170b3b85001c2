//! Client-side credential vault engine.
//!
//! Credentials are encrypted locally and split between an immutable ledger,
//! which only ever sees a keyed domain fingerprint and blob references, and
//! a blob store holding the encrypted envelopes. Every secret descends from
//! one master key derived from an identity proof:
//!
//! ```text
//! identity proof ──▶ master key ──┬──▶ domain fingerprint   (ledger lookup key)
//!                                 └──▶ session secret/nonce (one per blob)
//! ```
//!
//! * [`KeyManager`] caches the master key with idle, age and access limits.
//! * [`Vault`] saves, reads and deletes credentials, reading both the current
//!   blob-reference layout and the older inline layout.
//! * [`SecureCache`] persists session and credential snapshots locally,
//!   failing closed on any integrity problem.
//! * [`PendingQueue`] carries writes from a context that cannot sign to one
//!   that can.
//!
//! Ledger, blob store, identity provider and local storage are reached only
//! through the traits in [`platform`].

mod config;
mod crypto;
pub mod derivation;
pub mod envelope;
mod error;
pub mod format;
mod key_manager;
pub mod logger;
mod pending;
pub mod platform;
mod secure_cache;
mod session;
mod types;
mod vault;

pub use config::{CacheConfig, KeyLifecycleConfig, QueueConfig, RotationPolicy, VaultConfig};
pub use crypto::{IV_LEN, TAG_LEN};
pub use derivation::{DomainFingerprint, IdentityProof, MasterKey, SessionNonce, SessionSecret};
pub use envelope::Envelope;
pub use error::{VaultError, VaultResult};
pub use format::{StoredPayload, VaultRecord};
pub use key_manager::{ClearReason, KeyManager, KeyState, MasterKeyLease};
pub use logger::{init_tracing, set_logger, LogLevel, Logger};
pub use pending::{
    spawn_poller, DrainReport, PendingQueue, PendingState, PendingWrite, PendingWriteExecutor,
    VaultExecutor, PENDING_WRITES_SLOT,
};
pub use secure_cache::{slot_name, CacheScope, SecureCache};
pub use session::{SessionManager, UnlockSource};
pub use types::{unix_now, BlobId, Credential, Owner, RecordId};
pub use vault::{DeleteOutcome, RetrievedCredentials, SaveOutcome, SkippedEntry, Vault};
