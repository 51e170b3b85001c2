//! Master-key lifecycle management.
//!
//! The manager owns the only long-lived copy of the master key.
//!
//! ```text
//! empty ──get_or_derive──▶ deriving ──install──▶ cached
//!   ▲                                              │
//!   └── idle / age / access limit / rotation / clear()
//! ```
//!
//! # Leases
//!
//! Callers never receive a copy of the cached key. [`KeyManager::get_or_derive`]
//! returns a [`MasterKeyLease`] holding a read guard on the key slot; the key
//! stays readable for as long as the lease lives. [`KeyManager::clear`] takes
//! the write side, so it waits for outstanding leases before it zeroes the
//! bytes. A task must therefore drop its lease before calling `clear`.
//!
//! # In-flight derivations
//!
//! Concurrent calls for the same identity share one derivation future. The
//! future installs its result in the slot unless the slot generation moved on
//! while it was running (a `clear` or a newer install). Callers of a superseded
//! derivation still receive the key, as a detached lease that owns and zeroes
//! its own copy.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use strum::{AsRefStr, Display};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use zeroize::{Zeroize, Zeroizing};

use crate::config::KeyLifecycleConfig;
use crate::derivation::{self, MasterKey, KEY_LEN};
use crate::error::{VaultError, VaultResult};
use crate::platform::IdentityProvider;

type SharedDerivation =
    Shared<BoxFuture<'static, Result<Arc<Zeroizing<[u8; KEY_LEN]>>, VaultError>>>;

/// Observable state of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum KeyState {
    /// No key cached and no derivation running.
    Empty,
    /// A derivation is in flight and nothing is cached.
    Deriving,
    /// A key is cached.
    Cached,
}

/// Why a cached key was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ClearReason {
    /// `clear()` was called.
    Explicit,
    /// Not accessed for longer than the idle limit.
    IdleTimeout,
    /// Older than the age limit.
    MaxAge,
    /// Accessed as many times as allowed.
    AccessLimit,
    /// Randomized early rotation fired.
    Rotation,
    /// A different identity asked for its key.
    IdentityChanged,
}

struct Meta {
    identity: Option<String>,
    generation: u64,
    created_at: Instant,
    last_access: Instant,
    accesses: u64,
}

/// Outcome of looking at the cache under the meta lock.
enum Lookup {
    Miss,
    /// Clear the key observed at this generation.
    Evict(ClearReason, u64),
    Hit(u64),
}

struct Inner {
    provider: Arc<dyn IdentityProvider>,
    config: KeyLifecycleConfig,
    slot: Arc<RwLock<Option<MasterKey>>>,
    meta: Mutex<Meta>,
    inflight: Mutex<HashMap<String, SharedDerivation>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Caches the master key in memory and enforces its expiry policy.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct KeyManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Scoped read access to a master key.
pub struct MasterKeyLease {
    inner: LeaseInner,
}

enum LeaseInner {
    Cached(OwnedRwLockReadGuard<Option<MasterKey>, MasterKey>),
    Detached(MasterKey),
}

impl MasterKeyLease {
    /// Returns `true` if the lease borrows the cached key, `false` if it owns
    /// a copy from a superseded derivation.
    #[must_use]
    pub const fn is_cached(&self) -> bool {
        matches!(self.inner, LeaseInner::Cached(_))
    }
}

impl Deref for MasterKeyLease {
    type Target = MasterKey;

    fn deref(&self) -> &MasterKey {
        match &self.inner {
            LeaseInner::Cached(guard) => &**guard,
            LeaseInner::Detached(key) => key,
        }
    }
}

impl fmt::Debug for MasterKeyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKeyLease")
            .field("cached", &self.is_cached())
            .finish_non_exhaustive()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> VaultResult<MutexGuard<'a, T>> {
    mutex
        .lock()
        .map_err(|_| VaultError::Derivation(format!("key manager {what} mutex poisoned")))
}

impl KeyManager {
    /// Creates an empty manager deriving keys through `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn IdentityProvider>, config: KeyLifecycleConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                provider,
                config,
                slot: Arc::new(RwLock::new(None)),
                meta: Mutex::new(Meta {
                    identity: None,
                    generation: 0,
                    created_at: now,
                    last_access: now,
                    accesses: 0,
                }),
                inflight: Mutex::new(HashMap::new()),
                monitor: Mutex::new(None),
            }),
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> KeyState {
        let cached = self
            .inner
            .meta
            .lock()
            .map(|meta| meta.identity.is_some())
            .unwrap_or(false);
        if cached {
            return KeyState::Cached;
        }
        let deriving = self
            .inner
            .inflight
            .lock()
            .map(|inflight| !inflight.is_empty())
            .unwrap_or(false);
        if deriving {
            KeyState::Deriving
        } else {
            KeyState::Empty
        }
    }

    /// Identity whose key is cached, if any.
    #[must_use]
    pub fn cached_identity(&self) -> Option<String> {
        self.inner
            .meta
            .lock()
            .ok()
            .and_then(|meta| meta.identity.clone())
    }

    /// Returns the key of `identity`, deriving it if needed.
    ///
    /// A cached key for another identity is cleared first. Concurrent calls
    /// for the same identity share one derivation.
    ///
    /// ```
    /// use std::sync::Arc;
    /// use ledgervault_core::platform::memory::StaticIdentityProvider;
    /// use ledgervault_core::{KeyLifecycleConfig, KeyManager, KeyState};
    ///
    /// # tokio_test::block_on(async {
    /// let provider = Arc::new(StaticIdentityProvider::new("0xabc", "token"));
    /// let keys = KeyManager::new(provider, KeyLifecycleConfig::default());
    /// let lease = keys.get_or_derive("0xabc").await.unwrap();
    /// assert!(lease.is_cached());
    /// drop(lease);
    /// assert_eq!(keys.state(), KeyState::Cached);
    /// # });
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Derivation`] if the identity provider fails.
    pub async fn get_or_derive(&self, identity: &str) -> VaultResult<MasterKeyLease> {
        if let Some(lease) = self.inner.try_cached(identity).await? {
            return Ok(lease);
        }

        let derivation = self.inner.derivation_for(identity)?;
        let bytes = derivation.await?;

        if let Some(lease) = self.inner.try_cached(identity).await? {
            return Ok(lease);
        }
        tracing::debug!("handing out detached key from superseded derivation");
        Ok(MasterKeyLease {
            inner: LeaseInner::Detached(MasterKey::from_bytes(**bytes)),
        })
    }

    /// Installs a key restored from the secure cache without asking the
    /// identity provider.
    ///
    /// # Errors
    ///
    /// Returns an error if `identity` is empty.
    pub async fn set_from_restored_state(&self, identity: &str, key: MasterKey) -> VaultResult<()> {
        if identity.is_empty() {
            return Err(VaultError::invalid_input("identity", "must not be empty"));
        }
        let installed = self.inner.install(identity, key, None).await?;
        if installed {
            Inner::arm_monitor(&self.inner);
            tracing::info!(identity, "master key restored from cache");
        }
        Ok(())
    }

    /// Zeroes and drops the cached key and cancels the expiry monitor.
    ///
    /// Waits for outstanding leases to be dropped. Derivations in flight
    /// still complete for their callers but do not populate the cache.
    pub async fn clear(&self) {
        self.inner.clear(ClearReason::Explicit, false, None).await;
    }

    /// Runs the expiry check once, as the background monitor does.
    ///
    /// Returns the reason if the key was cleared. A key installed while the
    /// check waited for the slot is left alone.
    pub async fn check_expiry(&self) -> Option<ClearReason> {
        let (reason, generation) = self.inner.expired(false)?;
        self.inner
            .clear(reason, false, Some(generation))
            .await
            .then_some(reason)
    }
}

impl Inner {
    async fn try_cached(&self, identity: &str) -> VaultResult<Option<MasterKeyLease>> {
        let generation = match self.lookup(identity)? {
            Lookup::Miss => return Ok(None),
            Lookup::Evict(reason, generation) => {
                self.clear(reason, false, Some(generation)).await;
                return Ok(None);
            }
            Lookup::Hit(generation) => generation,
        };

        let guard = Arc::clone(&self.slot).read_owned().await;
        if !self.is_current(identity, generation)? {
            return Ok(None);
        }
        Ok(OwnedRwLockReadGuard::try_map(guard, Option::as_ref)
            .ok()
            .map(|guard| MasterKeyLease {
                inner: LeaseInner::Cached(guard),
            }))
    }

    /// Decides what `try_cached` does and records the access on a hit.
    fn lookup(&self, identity: &str) -> VaultResult<Lookup> {
        let mut meta = lock(&self.meta, "meta")?;
        let same_identity = meta.identity.as_deref().map(|cached| cached == identity);
        let lookup = match same_identity {
            None => Lookup::Miss,
            Some(false) => Lookup::Evict(ClearReason::IdentityChanged, meta.generation),
            Some(true) => match self.expiry_reason(&meta, Instant::now(), true) {
                Some(reason) => Lookup::Evict(reason, meta.generation),
                None => {
                    meta.last_access = Instant::now();
                    meta.accesses += 1;
                    Lookup::Hit(meta.generation)
                }
            },
        };
        Ok(lookup)
    }

    fn is_current(&self, identity: &str, generation: u64) -> VaultResult<bool> {
        let meta = lock(&self.meta, "meta")?;
        Ok(meta.generation == generation && meta.identity.as_deref() == Some(identity))
    }

    fn derivation_for(self: &Arc<Self>, identity: &str) -> VaultResult<SharedDerivation> {
        let mut inflight = lock(&self.inflight, "inflight")?;
        if let Some(existing) = inflight.get(identity) {
            tracing::debug!(identity, "joining in-flight derivation");
            return Ok(existing.clone());
        }

        let generation = lock(&self.meta, "meta")?.generation;
        let inner = Arc::clone(self);
        let owned_identity = identity.to_string();
        let derivation = async move {
            tracing::debug!(identity = %owned_identity, "deriving master key");
            let outcome = match derivation::derive_master(inner.provider.as_ref(), &owned_identity)
                .await
            {
                Ok(key) => {
                    let bytes = Arc::new(Zeroizing::new(*key.as_bytes()));
                    match inner.install(&owned_identity, key, Some(generation)).await {
                        Ok(true) => {
                            Inner::arm_monitor(&inner);
                            tracing::info!(identity = %owned_identity, "master key derived and cached");
                        }
                        Ok(false) => {
                            tracing::info!(
                                identity = %owned_identity,
                                "derivation superseded, result not cached"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to cache derived key");
                        }
                    }
                    Ok(bytes)
                }
                Err(err) => {
                    tracing::warn!(identity = %owned_identity, error = %err, "derivation failed");
                    Err(err)
                }
            };
            if let Ok(mut inflight) = inner.inflight.lock() {
                inflight.remove(&owned_identity);
            }
            outcome
        }
        .boxed()
        .shared();

        inflight.insert(identity.to_string(), derivation.clone());
        Ok(derivation)
    }

    /// Puts `key` in the slot. With `expected_generation`, the install only
    /// happens if nothing touched the slot since the derivation started.
    async fn install(
        &self,
        identity: &str,
        key: MasterKey,
        expected_generation: Option<u64>,
    ) -> VaultResult<bool> {
        let mut slot = self.slot.write().await;
        let mut meta = lock(&self.meta, "meta")?;
        if expected_generation.is_some_and(|generation| generation != meta.generation) {
            return Ok(false);
        }
        if let Some(mut previous) = slot.replace(key) {
            previous.zeroize();
        }
        let now = Instant::now();
        meta.identity = Some(identity.to_string());
        meta.generation += 1;
        meta.created_at = now;
        meta.last_access = now;
        meta.accesses = 0;
        Ok(true)
    }

    /// Zeroes the cached key. With `expected_generation`, nothing happens if
    /// another key was installed or cleared since that generation was
    /// observed. Returns `true` if the clear ran.
    async fn clear(
        &self,
        reason: ClearReason,
        from_monitor: bool,
        expected_generation: Option<u64>,
    ) -> bool {
        let mut slot = self.slot.write().await;
        {
            let mut meta = self.meta.lock().unwrap_or_else(PoisonError::into_inner);
            if expected_generation.is_some_and(|generation| generation != meta.generation) {
                tracing::debug!(reason = reason.as_ref(), "key changed before clear, skipping");
                return false;
            }
            meta.identity = None;
            meta.generation += 1;
            meta.accesses = 0;
        }

        if let Ok(mut monitor) = self.monitor.lock() {
            if let Some(handle) = monitor.take() {
                // The monitor cannot abort itself mid-clear.
                if !from_monitor {
                    handle.abort();
                }
            }
        }

        let had_key = slot.is_some();
        if let Some(mut key) = slot.take() {
            key.zeroize();
        }
        drop(slot);

        if had_key {
            tracing::info!(reason = reason.as_ref(), "master key cleared");
        }
        true
    }

    /// Expiry reason and the generation it was observed at.
    fn expired(&self, with_rotation: bool) -> Option<(ClearReason, u64)> {
        let meta = self.meta.lock().ok()?;
        meta.identity.as_ref()?;
        let reason = self.expiry_reason(&meta, Instant::now(), with_rotation)?;
        Some((reason, meta.generation))
    }

    fn expiry_reason(&self, meta: &Meta, now: Instant, with_rotation: bool) -> Option<ClearReason> {
        let age = now.saturating_duration_since(meta.created_at);
        let idle = now.saturating_duration_since(meta.last_access);
        if age >= self.config.max_age() {
            return Some(ClearReason::MaxAge);
        }
        if idle >= self.config.max_idle() {
            return Some(ClearReason::IdleTimeout);
        }
        if meta.accesses >= self.config.max_accesses {
            return Some(ClearReason::AccessLimit);
        }
        if with_rotation {
            let probability = self
                .config
                .rotation
                .probability(age, self.config.max_age())
                .clamp(0.0, 1.0);
            if probability > 0.0 && rand::thread_rng().gen_bool(probability) {
                return Some(ClearReason::Rotation);
            }
        }
        None
    }

    fn arm_monitor(this: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let period = this.config.check_interval();
        let weak: Weak<Self> = Arc::downgrade(this);
        let handle = runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if let Some((reason, generation)) = inner.expired(false) {
                    inner.clear(reason, true, Some(generation)).await;
                    break;
                }
            }
        });
        if let Ok(mut monitor) = this.monitor.lock() {
            if let Some(previous) = monitor.replace(handle) {
                previous.abort();
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut monitor) = self.monitor.lock() {
            if let Some(handle) = monitor.take() {
                handle.abort();
            }
        }
    }
}
