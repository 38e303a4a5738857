//! # Expiry Policy
//!
//! Normalizes the heterogeneous expiry inputs callers are allowed to pass
//! (nothing, relative seconds, absolute timestamps, UTC datetime strings,
//! durations) into one canonical absolute unix timestamp, and implements
//! the probabilistic early-expiration check used for stampede protection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;

use crate::error::CacheError;

/// Integers up to this many seconds are relative; above it, absolute.
pub const THIRTY_DAYS_SECS: i64 = 30 * 24 * 60 * 60;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// An expiry as supplied by the caller.
///
/// `Seconds` follows the memcached convention: values up to 30 days are
/// seconds-from-now, larger values are absolute unix timestamps. Negative
/// values are already in the past, which is a meaningful state (it is how
/// pending deletes are staged), not an error.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Expiry {
    /// Never expires (canonical timestamp 0).
    #[default]
    Never,
    /// Raw integer: relative seconds if <= 30 days, absolute otherwise.
    Seconds(i64),
    /// Absolute point in time.
    At(DateTime<Utc>),
    /// Relative duration from now.
    After(Duration),
}

impl Expiry {
    /// Canonical absolute unix timestamp; 0 means never.
    pub fn normalize(&self) -> i64 {
        match self {
            Expiry::Never => 0,
            Expiry::Seconds(0) => 0,
            Expiry::Seconds(s) if *s <= THIRTY_DAYS_SECS => Utc::now().timestamp() + s,
            Expiry::Seconds(s) => *s,
            Expiry::At(dt) => dt.timestamp(),
            Expiry::After(d) => Utc::now().timestamp() + d.as_secs() as i64,
        }
    }

    /// Seconds from now until expiry. May be negative ("already expired",
    /// a valid state). 0 for values that never expire.
    pub fn ttl(&self) -> i64 {
        match self {
            Expiry::Never => 0,
            Expiry::Seconds(0) => 0,
            Expiry::Seconds(s) if *s <= THIRTY_DAYS_SECS => *s,
            Expiry::Seconds(s) => *s - Utc::now().timestamp(),
            Expiry::At(dt) => dt.timestamp() - Utc::now().timestamp(),
            Expiry::After(d) => d.as_secs() as i64,
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, Expiry::Never | Expiry::Seconds(0))
    }
}

impl From<i64> for Expiry {
    fn from(seconds: i64) -> Self {
        if seconds == 0 {
            Expiry::Never
        } else {
            Expiry::Seconds(seconds)
        }
    }
}

impl From<Duration> for Expiry {
    fn from(d: Duration) -> Self {
        Expiry::After(d)
    }
}

impl From<DateTime<Utc>> for Expiry {
    fn from(dt: DateTime<Utc>) -> Self {
        Expiry::At(dt)
    }
}

impl FromStr for Expiry {
    type Err = CacheError;

    /// Parse a `YYYY-MM-DD HH:MM:SS` string, assumed UTC.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let naive = NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).map_err(|e| {
            CacheError::configuration(format!("invalid expiry datetime {s:?}: {e}"))
        })?;
        Ok(Expiry::At(naive.and_utc()))
    }
}

/// Whether an entry that logically expires at `expiry` counts as expired
/// right now, including the probabilistic early cut-off.
///
/// The check is `e < now - ct * ln(r)` with `r ~ Uniform(0,1]`: the longer
/// a value took to compute, the earlier one unlucky caller starts
/// regenerating it, spreading the load that would otherwise land on all
/// callers at once at `e`. With no recorded computation time the term
/// vanishes and expiry is exact.
#[derive(Clone)]
pub struct EarlyExpiration {
    sample: Arc<dyn Fn() -> f64 + Send + Sync>,
}

impl fmt::Debug for EarlyExpiration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EarlyExpiration").finish_non_exhaustive()
    }
}

impl Default for EarlyExpiration {
    fn default() -> Self {
        Self::new(|| {
            // uniform over (0, 1]
            1.0 - rand::thread_rng().gen::<f64>()
        })
    }
}

impl EarlyExpiration {
    /// Build with an explicit random source. Tests inject a fixed sampler
    /// for deterministic outcomes.
    pub fn new(sample: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        Self {
            sample: Arc::new(sample),
        }
    }

    /// A sampler that always draws the same value.
    pub fn fixed(r: f64) -> Self {
        Self::new(move || r)
    }

    /// Apply the early-expiry check to an entry's stored metadata.
    pub fn is_expired(&self, expiry: i64, compute_micros: Option<u64>) -> bool {
        if expiry == 0 {
            return false;
        }
        let ct = compute_micros.unwrap_or(0) as f64 / 1_000_000.0;
        if ct <= 0.0 {
            return is_past(expiry);
        }
        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let r = (self.sample)().clamp(f64::MIN_POSITIVE, 1.0);
        (expiry as f64) < now - ct * r.ln()
    }
}

/// Exact expiry check at sub-second precision; 0 never expires. Adapters
/// use this for existence decisions so `get`, `add` and `delete` agree on
/// whether a key is live during the boundary second.
pub fn is_past(expiry: i64) -> bool {
    expiry != 0 && (expiry as f64) < Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Extra seconds a logically-expired value stays physically retrievable,
/// so it can serve as a stale fallback when regeneration fails:
/// `min(3600, max(60, ttl / 4))`.
pub fn stale_window(ttl: i64) -> i64 {
    (ttl / 4).clamp(60, 3600)
}
