//! Collaborator interfaces consumed by the engine.
//!
//! The engine never talks to a network or a disk directly. Everything outside
//! the process boundary is reached through these traits:
//!
//! - [`Ledger`]: The immutable ledger holding one record per domain
//!   fingerprint, authenticated as the owner
//! - [`BlobStore`]: Content storage for encrypted envelopes
//! - [`IdentityProvider`]: Source of the identity proof the master key is
//!   derived from
//! - [`SlotStore`]: Small named slots for local persistence (secure cache
//!   scopes, pending-write transport)
//! - [`DeviceKeystore`]: Device-bound sealing for data at rest that must be
//!   readable before the master key is available
//! - [`SlotLockManager`]: Cross-context lock held around every rewrite of a
//!   shared slot
//!
//! # Host Implementations
//!
//! ## Browser extension
//! - `Ledger`: ledger RPC client behind the signing session
//! - `BlobStore`: HTTP aggregator/publisher client
//! - `SlotStore`: `chrome.storage.session` (session scope) and
//!   `chrome.storage.local` (credential scope, pending writes)
//! - `DeviceKeystore`: `WebCrypto` non-extractable key in `IndexedDB`
//! - `SlotLockManager`: Web Locks API keyed by slot name
//!
//! ## Tests
//! - Everything in [`memory`]

mod blob_store;
mod identity;
mod keystore;
mod ledger;
mod lock_manager;
pub mod memory;
mod slot_store;

pub use blob_store::BlobStore;
pub use identity::IdentityProvider;
pub use keystore::DeviceKeystore;
pub use ledger::{Ledger, WriteMode};
pub use lock_manager::SlotLockManager;
pub use slot_store::SlotStore;
