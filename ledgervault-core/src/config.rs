//! Runtime configuration for the vault engine.
//!
//! All settings have defaults, so an empty JSON object is a valid config.
//! Durations are expressed in whole seconds to keep the JSON form simple for
//! hosts that pass configuration across an FFI or extension boundary.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Master-key cache limits.
    pub key_lifecycle: KeyLifecycleConfig,
    /// Secure cache work factor and lifetimes.
    pub cache: CacheConfig,
    /// Pending-write queue behavior.
    pub queue: QueueConfig,
}

impl VaultConfig {
    /// Parses and validates a JSON config.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] if the JSON is malformed or a value is
    /// out of range.
    pub fn from_json(json: &str) -> VaultResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|err| VaultError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every section for out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Config`] naming the first offending field.
    pub fn validate(&self) -> VaultResult<()> {
        self.key_lifecycle.validate()?;
        self.cache.validate()?;
        self.queue.validate()
    }
}

/// Limits on how long a derived master key stays cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyLifecycleConfig {
    /// Maximum age since derivation.
    pub max_age_secs: u64,
    /// Maximum time since the last access.
    pub max_idle_secs: u64,
    /// Maximum number of accesses before the key is dropped.
    pub max_accesses: u64,
    /// Period of the background expiry check.
    pub check_interval_secs: u64,
    /// Randomized early rotation layered on top of the hard limits.
    pub rotation: RotationPolicy,
}

impl Default for KeyLifecycleConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 3600,
            max_idle_secs: 900,
            max_accesses: 1000,
            check_interval_secs: 60,
            rotation: RotationPolicy::default(),
        }
    }
}

impl KeyLifecycleConfig {
    /// Maximum age as a [`Duration`].
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Maximum idle time as a [`Duration`].
    #[must_use]
    pub const fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    /// Background check period as a [`Duration`].
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    fn validate(&self) -> VaultResult<()> {
        if self.max_age_secs == 0 || self.max_idle_secs == 0 || self.max_accesses == 0 {
            return Err(VaultError::Config(
                "key_lifecycle limits must be non-zero".to_string(),
            ));
        }
        if self.check_interval_secs == 0 {
            return Err(VaultError::Config(
                "key_lifecycle.check_interval_secs must be non-zero".to_string(),
            ));
        }
        self.rotation.validate()
    }
}

/// Probability curve for rotating a key before its hard age limit.
///
/// The chance of rotating on an access is zero until `start_after_secs`, then
/// rises linearly to `max_probability` at the configured maximum age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Age at which the rotation chance starts rising.
    pub start_after_secs: u64,
    /// Chance of rotation at the maximum age, in `[0, 1]`.
    pub max_probability: f64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            start_after_secs: 1800,
            max_probability: 0.0,
        }
    }
}

impl RotationPolicy {
    /// Rotation probability for a key of age `age` with hard limit `max_age`.
    #[must_use]
    pub fn probability(&self, age: Duration, max_age: Duration) -> f64 {
        let start = Duration::from_secs(self.start_after_secs);
        if self.max_probability <= 0.0 || age < start {
            return 0.0;
        }
        if max_age <= start {
            return self.max_probability;
        }
        let span = (max_age - start).as_secs_f64();
        let progress = ((age - start).as_secs_f64() / span).min(1.0);
        self.max_probability * progress
    }

    fn validate(&self) -> VaultResult<()> {
        if !(0.0..=1.0).contains(&self.max_probability) {
            return Err(VaultError::Config(format!(
                "rotation.max_probability must be within [0, 1], got {}",
                self.max_probability
            )));
        }
        Ok(())
    }
}

/// Secure cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Argon2id memory cost in KiB.
    pub memory_kib: u32,
    /// Argon2id passes.
    pub iterations: u32,
    /// Argon2id lanes.
    pub parallelism: u32,
    /// Lifetime of the session snapshot (identity + master key).
    pub session_ttl_secs: u64,
    /// Lifetime of decrypted credential lists.
    pub credentials_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        // Argon2id m=19 MiB, t=2, p=1 matches PBKDF2-SHA256 at 600k rounds.
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
            session_ttl_secs: 86_400,
            credentials_ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> VaultResult<()> {
        if self.iterations == 0 || self.parallelism == 0 {
            return Err(VaultError::Config(
                "cache work factor must be non-zero".to_string(),
            ));
        }
        if self.memory_kib < 8 * self.parallelism {
            return Err(VaultError::Config(format!(
                "cache.memory_kib must be at least {} for {} lanes",
                8 * self.parallelism,
                self.parallelism
            )));
        }
        if self.session_ttl_secs == 0 || self.credentials_ttl_secs == 0 {
            return Err(VaultError::Config("cache ttls must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Pending-write queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Period of the executor poll loop.
    pub poll_interval_secs: u64,
    /// How long a claim blocks other drains before the entry is retried.
    pub claim_lease_secs: u64,
    /// Failed attempts after which an entry is abandoned.
    pub max_attempts: u32,
    /// Capacity of the queue.
    pub max_entries: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            claim_lease_secs: 120,
            max_attempts: 5,
            max_entries: 256,
        }
    }
}

impl QueueConfig {
    /// Poll period as a [`Duration`].
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn validate(&self) -> VaultResult<()> {
        if self.poll_interval_secs == 0 || self.max_attempts == 0 || self.max_entries == 0 {
            return Err(VaultError::Config(
                "queue limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
