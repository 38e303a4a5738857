use crate::error::{CacheError, Result};

/// Default in-memory byte budget (the memory adapter evicts past this).
pub const DEFAULT_MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Advisory-lock acquisition attempts for backends without native CAS.
pub const DEFAULT_LOCK_ATTEMPTS: u32 = 25;

/// Sleep between advisory-lock attempts.
pub const DEFAULT_LOCK_BACKOFF_MICROS: u64 = 200;

/// Chance (percent) that a write opportunistically sweeps expired rows.
pub const DEFAULT_SWEEP_PROBABILITY: u8 = 10;

/// How long getter failures push out a stale entry's expiry, in seconds.
pub const DEFAULT_FAIL_EXTEND_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget for the in-memory adapter before LRU eviction kicks in.
    pub memory_limit_bytes: usize,
    /// Bounded retries when acquiring a per-key advisory lock.
    pub lock_attempts: u32,
    /// Backoff between lock attempts, microseconds.
    pub lock_backoff_micros: u64,
    /// Probability (0-100) of sweeping expired rows on relational writes.
    pub sweep_probability: u8,
    /// Default stale-extension window for get_set getter failures, seconds.
    pub fail_extend_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            lock_attempts: DEFAULT_LOCK_ATTEMPTS,
            lock_backoff_micros: DEFAULT_LOCK_BACKOFF_MICROS,
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
            fail_extend_secs: DEFAULT_FAIL_EXTEND_SECS,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(limit) = std::env::var("KVSTASH_MEMORY_LIMIT_BYTES") {
            config.memory_limit_bytes = limit.parse().map_err(|e| {
                CacheError::configuration(format!("invalid memory_limit_bytes: {e}"))
            })?;
        }

        if let Ok(attempts) = std::env::var("KVSTASH_LOCK_ATTEMPTS") {
            config.lock_attempts = attempts
                .parse()
                .map_err(|e| CacheError::configuration(format!("invalid lock_attempts: {e}")))?;
        }

        if let Ok(backoff) = std::env::var("KVSTASH_LOCK_BACKOFF_MICROS") {
            config.lock_backoff_micros = backoff.parse().map_err(|e| {
                CacheError::configuration(format!("invalid lock_backoff_micros: {e}"))
            })?;
        }

        if let Ok(prob) = std::env::var("KVSTASH_SWEEP_PROBABILITY") {
            config.sweep_probability = prob.parse().map_err(|e| {
                CacheError::configuration(format!("invalid sweep_probability: {e}"))
            })?;
            if config.sweep_probability > 100 {
                return Err(CacheError::configuration(
                    "sweep_probability must be 0-100",
                ));
            }
        }

        Ok(config)
    }
}
