//! Deferred writes requested by an unprivileged context.
//!
//! A requester without signing capability (the browser extension) enqueues
//! credentials; the privileged executor (a signing session) drains the queue
//! and saves them through the vault.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue ──▶ queued ──drain──▶ claimed ──save ok──▶ acknowledged (removed)
//!               ▲                  │
//!               └──── save failed ─┤   attempts < max_attempts
//!                                  └──▶ abandoned  (max attempts or ledger rejection)
//! ```
//!
//! Delivery is at-least-once. The claim is persisted before the executor
//! runs, so a crash mid-save leaves the entry claimed; once the claim lease
//! runs out the entry is picked up again. Ids that executed successfully but
//! whose acknowledgement failed to persist are remembered in process and only
//! re-acknowledged on the next drain.
//!
//! # Storage
//!
//! The whole queue is one slot, sealed by the device keystore with
//! associated data `"ledgervault:pending-writes" || slot`. Requester and
//! executor run in different contexts, so every read-modify-write of the
//! slot happens under the shared [`SlotLockManager`] lock.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::derivation::normalize_domain;
use crate::error::{VaultError, VaultResult};
use crate::key_manager::KeyManager;
use crate::platform::{DeviceKeystore, SlotLockManager, SlotStore};
use crate::types::{unix_now, Credential, Owner};
use crate::vault::Vault;

/// Default slot holding the sealed queue.
pub const PENDING_WRITES_SLOT: &str = "ledgervault.pending_writes";

const PENDING_VERSION: u32 = 1;
const LABEL_PENDING_WRITES: &[u8] = b"ledgervault:pending-writes";

/// Where an entry is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingState {
    /// Waiting for the next drain.
    Queued,
    /// Handed to an executor at `claimed_at` (unix seconds).
    Claimed {
        /// When the claim was taken.
        claimed_at: u64,
    },
    /// No longer retried; kept visible until requeued or discarded.
    Abandoned,
}

/// A credential waiting to be saved by the privileged executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    /// Generated identifier, also usable by callers to dedupe.
    pub id: String,
    /// The credential to save.
    pub credential: Credential,
    /// Unix time of the enqueue.
    pub enqueued_at: u64,
    /// Lifecycle state.
    pub state: PendingState,
    /// Failed execution attempts so far.
    pub attempts: u32,
    /// Error of the most recent failed attempt.
    pub last_error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct PendingWriteStore {
    version: u32,
    entries: Vec<PendingWrite>,
}

impl PendingWriteStore {
    const fn new() -> Self {
        Self {
            version: PENDING_VERSION,
            entries: Vec::new(),
        }
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut PendingWrite> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }

    fn remove(&mut self, id: &str) -> Option<PendingWrite> {
        let pos = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(pos))
    }

    fn serialize(&self) -> VaultResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| VaultError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    fn deserialize(bytes: &[u8]) -> VaultResult<Self> {
        let store: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| VaultError::Serialization(err.to_string()))?;
        if store.version != PENDING_VERSION {
            return Err(VaultError::Serialization(format!(
                "unsupported pending write store version {}",
                store.version
            )));
        }
        Ok(store)
    }
}

/// Counts from one [`PendingQueue::drain_once`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Entries handed to the executor.
    pub attempted: usize,
    /// Entries saved and acknowledged.
    pub completed: usize,
    /// Entries that failed and stay queued.
    pub failed: usize,
    /// Entries that failed and were abandoned.
    pub abandoned: usize,
    /// Previously executed entries whose acknowledgement was retried.
    pub reacknowledged: usize,
}

/// Performs a pending write. Implemented by the privileged side.
#[async_trait]
pub trait PendingWriteExecutor: Send + Sync {
    /// Saves `write`. Must be safe to call more than once for the same entry.
    ///
    /// # Errors
    ///
    /// Any error keeps the entry for retry, except ledger rejections
    /// (`NotAuthorized`, `NotFound`), which abandon it.
    async fn execute(&self, write: &PendingWrite) -> VaultResult<()>;
}

/// Executor saving through a [`Vault`] with the key from a [`KeyManager`].
pub struct VaultExecutor {
    vault: Arc<Vault>,
    keys: KeyManager,
    owner: Owner,
}

impl VaultExecutor {
    /// Creates an executor saving into `owner`'s vault.
    #[must_use]
    pub const fn new(vault: Arc<Vault>, keys: KeyManager, owner: Owner) -> Self {
        Self { vault, keys, owner }
    }
}

impl fmt::Debug for VaultExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultExecutor")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PendingWriteExecutor for VaultExecutor {
    async fn execute(&self, write: &PendingWrite) -> VaultResult<()> {
        let master = self.keys.get_or_derive(&self.owner.address).await?;
        self.vault
            .save(&write.credential, &master, &self.owner)
            .await
            .map(|_| ())
    }
}

/// Durable mailbox of pending writes.
pub struct PendingQueue {
    slots: Arc<dyn SlotStore>,
    keystore: Arc<dyn DeviceKeystore>,
    locks: Arc<dyn SlotLockManager>,
    slot: String,
    config: QueueConfig,
    completed: Mutex<HashSet<String>>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQueue")
            .field("slot", &self.slot)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PendingQueue {
    /// Opens the queue stored in [`PENDING_WRITES_SLOT`].
    ///
    /// Every context opening the same queue must share `locks`.
    #[must_use]
    pub fn new(
        slots: Arc<dyn SlotStore>,
        keystore: Arc<dyn DeviceKeystore>,
        locks: Arc<dyn SlotLockManager>,
        config: QueueConfig,
    ) -> Self {
        Self::with_slot(slots, keystore, locks, PENDING_WRITES_SLOT, config)
    }

    /// Opens a queue stored in `slot`.
    #[must_use]
    pub fn with_slot(
        slots: Arc<dyn SlotStore>,
        keystore: Arc<dyn DeviceKeystore>,
        locks: Arc<dyn SlotLockManager>,
        slot: impl Into<String>,
        config: QueueConfig,
    ) -> Self {
        Self {
            slots,
            keystore,
            locks,
            slot: slot.into(),
            config,
            completed: Mutex::new(HashSet::new()),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Adds a credential to the queue and returns its id.
    ///
    /// Equivalent credentials may be enqueued more than once; each gets its
    /// own id.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidInput`] for an empty domain or a full
    /// queue, and storage errors if the queue cannot be persisted.
    pub fn enqueue(&self, credential: Credential) -> VaultResult<String> {
        normalize_domain(&credential.domain)?;
        let now = unix_now()?;
        let max_entries = self.config.max_entries;
        let id = Uuid::new_v4().to_string();
        self.update(|store| {
            if store.entries.len() >= max_entries {
                return Err(VaultError::invalid_input(
                    "pending_write",
                    format!("queue is full ({max_entries} entries)"),
                ));
            }
            store.entries.push(PendingWrite {
                id: id.clone(),
                credential,
                enqueued_at: now,
                state: PendingState::Queued,
                attempts: 0,
                last_error: None,
            });
            Ok(())
        })?;
        tracing::info!(%id, "pending write enqueued");
        Ok(id)
    }

    /// Returns every entry in enqueue order, including abandoned ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or opened.
    pub fn list(&self) -> VaultResult<Vec<PendingWrite>> {
        Ok(self.load()?.entries)
    }

    /// Removes an executed entry. Returns `false` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be persisted.
    pub fn acknowledge(&self, id: &str) -> VaultResult<bool> {
        let removed = self.update(|store| Ok(store.remove(id).is_some()))?;
        if let Ok(mut completed) = self.completed.lock() {
            completed.remove(id);
        }
        tracing::debug!(%id, removed, "pending write acknowledged");
        Ok(removed)
    }

    /// Puts an abandoned or claimed entry back in the queue with a fresh
    /// attempt budget. Returns `false` if there is no such entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be persisted.
    pub fn requeue(&self, id: &str) -> VaultResult<bool> {
        self.update(|store| {
            Ok(store.find_mut(id).is_some_and(|entry| {
                entry.state = PendingState::Queued;
                entry.attempts = 0;
                true
            }))
        })
    }

    /// Drops an entry without executing it. Returns `false` if there is no
    /// such entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be persisted.
    pub fn discard(&self, id: &str) -> VaultResult<bool> {
        let removed = self.update(|store| Ok(store.remove(id).is_some()))?;
        if removed {
            tracing::info!(%id, "pending write discarded");
        }
        Ok(removed)
    }

    /// Runs one pass over the queue.
    ///
    /// Entries are executed sequentially in enqueue order. Failures are
    /// recorded on the entry and logged, not returned.
    ///
    /// # Errors
    ///
    /// Only fails if the queue itself cannot be read or persisted.
    pub async fn drain_once(
        &self,
        executor: &dyn PendingWriteExecutor,
    ) -> VaultResult<DrainReport> {
        self.drain_at(executor, unix_now()?).await
    }

    async fn drain_at(
        &self,
        executor: &dyn PendingWriteExecutor,
        now: u64,
    ) -> VaultResult<DrainReport> {
        let _drain = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        for id in self.completed_ids() {
            match self.acknowledge(&id) {
                Ok(_) => report.reacknowledged += 1,
                Err(err) => tracing::warn!(%id, error = %err, "re-acknowledgement failed"),
            }
        }

        let completed = self.completed_ids();
        let claimed = self.claim(now, &completed)?;

        for write in claimed {
            report.attempted += 1;
            match executor.execute(&write).await {
                Ok(()) => {
                    if let Ok(mut completed) = self.completed.lock() {
                        completed.insert(write.id.clone());
                    }
                    if let Err(err) = self.acknowledge(&write.id) {
                        tracing::warn!(
                            id = %write.id,
                            error = %err,
                            "pending write saved but acknowledgement failed"
                        );
                    }
                    report.completed += 1;
                }
                Err(err) => {
                    let failure = VaultError::queue_failure(&write.id, err.to_string());
                    tracing::warn!(error = %failure, "pending write failed");
                    if self.record_failure(&write.id, &err)? {
                        report.abandoned += 1;
                    } else {
                        report.failed += 1;
                    }
                }
            }
        }

        if report != DrainReport::default() {
            tracing::debug!(?report, "pending queue drained");
        }
        Ok(report)
    }

    fn claim(&self, now: u64, completed: &HashSet<String>) -> VaultResult<Vec<PendingWrite>> {
        let lease = self.config.claim_lease_secs;
        self.update(|store| {
            let mut claimed = Vec::new();
            for entry in &mut store.entries {
                if completed.contains(&entry.id) {
                    continue;
                }
                let ready = match entry.state {
                    PendingState::Queued => true,
                    PendingState::Claimed { claimed_at } => {
                        let expired = claimed_at.saturating_add(lease) <= now;
                        if expired {
                            tracing::info!(id = %entry.id, "claim lease expired, retrying");
                        }
                        expired
                    }
                    PendingState::Abandoned => false,
                };
                if ready {
                    entry.state = PendingState::Claimed { claimed_at: now };
                    claimed.push(entry.clone());
                }
            }
            Ok(claimed)
        })
    }

    /// Records a failed attempt. Returns `true` if the entry was abandoned.
    fn record_failure(&self, id: &str, err: &VaultError) -> VaultResult<bool> {
        let max_attempts = self.config.max_attempts;
        self.update(|store| {
            let Some(entry) = store.find_mut(id) else {
                return Ok(false);
            };
            entry.attempts = entry.attempts.saturating_add(1);
            entry.last_error = Some(err.to_string());
            let abandon = err.is_ledger_rejection() || entry.attempts >= max_attempts;
            if abandon {
                entry.state = PendingState::Abandoned;
                tracing::error!(
                    %id,
                    attempts = entry.attempts,
                    error = %err,
                    "pending write abandoned"
                );
            } else {
                entry.state = PendingState::Queued;
            }
            Ok(abandon)
        })
    }

    fn completed_ids(&self) -> HashSet<String> {
        self.completed
            .lock()
            .map(|completed| completed.clone())
            .unwrap_or_default()
    }

    fn update<R>(
        &self,
        apply: impl FnOnce(&mut PendingWriteStore) -> VaultResult<R>,
    ) -> VaultResult<R> {
        let mut apply = Some(apply);
        let mut outcome = None;
        self.locks.with_slot_lock(&self.slot, &mut || {
            let apply = apply.take().ok_or_else(|| {
                VaultError::CacheStorage("pending queue update ran twice".to_string())
            })?;
            let mut store = self.load()?;
            let result = apply(&mut store)?;
            self.save(&store)?;
            outcome = Some(result);
            Ok(())
        })?;
        outcome.ok_or_else(|| {
            VaultError::CacheStorage("slot lock returned without running the update".to_string())
        })
    }

    fn associated_data(&self) -> Vec<u8> {
        let mut ad = Vec::with_capacity(LABEL_PENDING_WRITES.len() + self.slot.len());
        ad.extend_from_slice(LABEL_PENDING_WRITES);
        ad.extend_from_slice(self.slot.as_bytes());
        ad
    }

    fn load(&self) -> VaultResult<PendingWriteStore> {
        let Some(sealed) = self.slots.read(&self.slot)? else {
            return Ok(PendingWriteStore::new());
        };
        let plaintext = self.keystore.open(&self.associated_data(), &sealed)?;
        PendingWriteStore::deserialize(&plaintext)
    }

    fn save(&self, store: &PendingWriteStore) -> VaultResult<()> {
        let plaintext = store.serialize()?;
        let sealed = self.keystore.seal(&self.associated_data(), &plaintext)?;
        self.slots.write_atomic(&self.slot, &sealed)
    }
}

/// Drains `queue` with `executor` every poll interval until the task is
/// aborted.
pub fn spawn_poller(
    queue: Arc<PendingQueue>,
    executor: Arc<dyn PendingWriteExecutor>,
) -> JoinHandle<()> {
    let period = queue.config.poll_interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(err) = queue.drain_once(executor.as_ref()).await {
                tracing::warn!(error = %err, "pending queue drain failed");
            }
        }
    })
}
