//! # Store Contract
//!
//! The capability every backend implements: get/set/delete/CAS, counters,
//! multi-key variants, touch, clear and namespaced collections.
//!
//! `get` returns a full [`Lookup`] by value: state, token, expiry and (for
//! expired entries) the stale value all travel with the result. There is
//! no hidden "info about the last get" state on the adapter, so instances
//! can be shared freely across tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{CacheError, Result};
use crate::expiry::Expiry;
use crate::value::StorageValue;

/// Outcome classification of a `get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    /// Live value present.
    Hit,
    /// Key unknown to the backend.
    Miss,
    /// Key known but logically expired (possibly early, see
    /// [`EarlyExpiration`](crate::expiry::EarlyExpiration)); the stale
    /// value is still available as a regeneration fallback.
    Expired,
}

/// Everything a `get` observed, returned by value.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub state: LookupState,
    pub key: String,
    /// The live value, on a hit.
    pub value: Option<StorageValue>,
    /// CAS token for the stored value (present on hit and expired).
    pub token: Option<String>,
    /// Canonical expiry timestamp, 0 = never.
    pub expiry: i64,
    /// How long the value took to compute, microseconds.
    pub compute_micros: Option<u64>,
    /// The logically-expired value, when state is Expired.
    pub stale_value: Option<StorageValue>,
}

impl Lookup {
    pub fn miss(key: impl Into<String>) -> Self {
        Self {
            state: LookupState::Miss,
            key: key.into(),
            value: None,
            token: None,
            expiry: 0,
            compute_micros: None,
            stale_value: None,
        }
    }

    pub fn hit(
        key: impl Into<String>,
        value: StorageValue,
        token: String,
        expiry: i64,
        compute_micros: Option<u64>,
    ) -> Self {
        Self {
            state: LookupState::Hit,
            key: key.into(),
            value: Some(value),
            token: Some(token),
            expiry,
            compute_micros,
            stale_value: None,
        }
    }

    pub fn expired(
        key: impl Into<String>,
        stale_value: StorageValue,
        token: String,
        expiry: i64,
        compute_micros: Option<u64>,
    ) -> Self {
        Self {
            state: LookupState::Expired,
            key: key.into(),
            value: None,
            token: Some(token),
            expiry,
            compute_micros,
            stale_value: Some(stale_value),
        }
    }

    pub fn is_hit(&self) -> bool {
        self.state == LookupState::Hit
    }
}

/// Longest key any backend accepts, in bytes.
pub const MAX_KEY_BYTES: usize = 255;

/// Reject keys that no backend should ever see. Raised as a fault: a bad
/// key is a programming error, not a transient condition.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_key(key, "empty"));
    }
    if key.len() > MAX_KEY_BYTES {
        return Err(CacheError::invalid_key(
            key,
            format!("longer than {MAX_KEY_BYTES} bytes"),
        ));
    }
    if key.chars().any(|c| c.is_control()) {
        return Err(CacheError::invalid_key(key, "contains control characters"));
    }
    Ok(())
}

/// Collection names are restricted to a conservative charset that every
/// backend (including directories on disk) can represent.
pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CacheError::invalid_collection(name, "empty"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CacheError::invalid_collection(
            name,
            "only [A-Za-z0-9_-] allowed",
        ));
    }
    Ok(())
}

/// The uniform backend contract.
///
/// Conflicts and misses are values: `Ok(false)` for a failed conditional
/// write, `Ok(None)` for a counter that couldn't apply, a `Lookup` whose
/// state is Miss/Expired. `Err(_)` means the backend itself failed or the
/// caller broke the contract (invalid key/collection).
#[async_trait]
pub trait Store: Send + Sync {
    /// Look up a key. Applies the probabilistic early-expiry check.
    async fn get(&self, key: &str) -> Result<Lookup>;

    /// Store a value, recording how long it took to compute (drives early
    /// expiration). Writing an already-expired expiry deletes the key.
    async fn set_entry(
        &self,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool>;

    /// Conditional write: fails (`Ok(false)`) iff the key currently holds a
    /// live value whose token differs from `token`. Misses and expired
    /// entries accept the write.
    async fn cas_entry(
        &self,
        token: &str,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool>;

    /// Insert-if-absent. Expired entries count as absent.
    async fn add(&self, key: &str, value: StorageValue, expire: Expiry) -> Result<bool>;

    /// Remove a key; `Ok(false)` if it wasn't live.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Wipe this store (scoped to the collection, for collections).
    async fn clear(&self) -> Result<bool>;

    /// A namespaced sub-store, isolated from its siblings.
    fn collection(&self, name: &str) -> Result<Arc<dyn Store>>;

    /// Plain write without computation-time metadata.
    async fn set(&self, key: &str, value: StorageValue, expire: Expiry) -> Result<bool> {
        self.set_entry(key, value, expire, None).await
    }

    /// Plain CAS without computation-time metadata.
    async fn cas(
        &self,
        token: &str,
        key: &str,
        value: StorageValue,
        expire: Expiry,
    ) -> Result<bool> {
        self.cas_entry(token, key, value, expire, None).await
    }

    /// Fetch many keys; hits only, value + token per key.
    async fn get_multiple(
        &self,
        keys: &[&str],
    ) -> Result<HashMap<String, (StorageValue, String)>> {
        let mut found = HashMap::new();
        for key in keys {
            let lookup = self.get(key).await?;
            if let (Some(value), Some(token)) = (lookup.value, lookup.token) {
                found.insert((*key).to_string(), (value, token));
            }
        }
        Ok(found)
    }

    /// Store many values under one expiry; per-key success.
    async fn set_multiple(
        &self,
        items: HashMap<String, StorageValue>,
        expire: Expiry,
    ) -> Result<HashMap<String, bool>> {
        let mut success = HashMap::new();
        for (key, value) in items {
            let ok = self.set(&key, value, expire).await?;
            success.insert(key, ok);
        }
        Ok(success)
    }

    /// Delete many keys; per-key success.
    async fn delete_multiple(&self, keys: &[&str]) -> Result<HashMap<String, bool>> {
        let mut success = HashMap::new();
        for key in keys {
            let ok = self.delete(key).await?;
            success.insert((*key).to_string(), ok);
        }
        Ok(success)
    }

    /// Add `offset` to a numeric value, seeding with `initial` when the key
    /// is absent. `Ok(None)` when the arguments are invalid, the current
    /// value is non-numeric, or a concurrent writer interfered.
    async fn increment(
        &self,
        key: &str,
        offset: i64,
        initial: i64,
        expire: Expiry,
    ) -> Result<Option<i64>> {
        if offset <= 0 || initial < 0 {
            return Ok(None);
        }
        apply_offset(self, key, offset, initial, expire).await
    }

    /// Counterpart of [`increment`](Store::increment).
    async fn decrement(
        &self,
        key: &str,
        offset: i64,
        initial: i64,
        expire: Expiry,
    ) -> Result<Option<i64>> {
        if offset <= 0 || initial < 0 {
            return Ok(None);
        }
        apply_offset(self, key, -offset, initial, expire).await
    }

    /// Update a live key's expiry, keeping its value.
    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool> {
        let lookup = self.get(key).await?;
        match (lookup.state, lookup.value, lookup.token) {
            (LookupState::Hit, Some(value), Some(token)) => {
                self.cas_entry(&token, key, value, expire, lookup.compute_micros)
                    .await
            }
            _ => Ok(false),
        }
    }
}

/// Shared read-modify-CAS counter emulation for backends without a native
/// atomic increment. A CAS conflict (another writer got there first) is
/// reported as `Ok(None)`, not retried.
///
/// Takes any signed `offset` and `initial`: argument validation belongs to
/// the public entry points, and the transaction replay path folds counters
/// into net adjustments that may be negative.
pub(crate) async fn apply_offset<S: Store + ?Sized>(
    store: &S,
    key: &str,
    offset: i64,
    initial: i64,
    expire: Expiry,
) -> Result<Option<i64>> {
    let lookup = store.get(key).await?;
    if !lookup.is_hit() {
        let ok = store
            .add(key, StorageValue::Int(initial), expire)
            .await?;
        return Ok(if ok { Some(initial) } else { None });
    }
    let current = match lookup.value.as_ref().and_then(StorageValue::as_int) {
        Some(v) => v,
        None => return Ok(None),
    };
    let token = lookup.token.unwrap_or_default();
    let next = match current.checked_add(offset) {
        Some(next) => next,
        None => return Ok(None),
    };
    let ok = store
        .cas_entry(&token, key, StorageValue::Int(next), expire, None)
        .await?;
    Ok(if ok { Some(next) } else { None })
}

/// Non-object-safe conveniences, blanket-implemented for every store.
#[async_trait]
pub trait StoreExt: Store {
    /// Just the value, if live.
    async fn get_value(&self, key: &str) -> Result<Option<StorageValue>> {
        Ok(self.get(key).await?.value)
    }

    /// Read-through regeneration with stampede protection.
    ///
    /// On a hit the cached value is returned untouched. Otherwise `getter`
    /// runs and its result is stored together with its measured duration,
    /// which feeds the probabilistic early-expiry check on later reads. If
    /// the getter fails and the miss was an *expired* entry, the stale
    /// value's expiry is pushed out by `fail_extend` seconds (so other
    /// callers stop retrying the failing getter for a while) and the stale
    /// value is returned.
    async fn get_set<F, Fut>(
        &self,
        key: &str,
        getter: F,
        expire: Expiry,
        fail_extend: u64,
    ) -> Result<Option<StorageValue>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<StorageValue>> + Send,
    {
        let looked = self.get(key).await?;
        if looked.is_hit() {
            return Ok(looked.value);
        }
        let started = Instant::now();
        match getter().await {
            Ok(fresh) => {
                let compute_micros = started.elapsed().as_micros() as u64;
                self.set_entry(key, fresh.clone(), expire, Some(compute_micros))
                    .await?;
                Ok(Some(fresh))
            }
            Err(err) => {
                warn!(key = %key, error = %err, "get_set getter failed");
                if looked.state == LookupState::Expired && !expire.is_never() && fail_extend > 0 {
                    if let (Some(stale), Some(token)) =
                        (looked.stale_value.clone(), looked.token.as_deref())
                    {
                        let extended =
                            Expiry::Seconds(expire.normalize() + fail_extend as i64);
                        // best effort: a concurrent regeneration wins
                        let _ = self
                            .cas_entry(token, key, stale, extended, looked.compute_micros)
                            .await;
                    }
                }
                Ok(looked.stale_value)
            }
        }
    }
}

impl<S: Store + ?Sized> StoreExt for S {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(validate_key("plain-key").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a\tb").is_err());
        assert!(validate_key(&"x".repeat(256)).is_err());
        assert!(validate_key(&"x".repeat(255)).is_ok());
    }

    #[test]
    fn test_collection_name_validation() {
        assert!(validate_collection_name("sessions").is_ok());
        assert!(validate_collection_name("shard_07").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("a/b").is_err());
        assert!(validate_collection_name("..").is_err());
    }

    #[test]
    fn test_lookup_constructors() {
        let miss = Lookup::miss("k");
        assert_eq!(miss.state, LookupState::Miss);
        assert!(miss.value.is_none() && miss.token.is_none());

        let hit = Lookup::hit("k", StorageValue::from(1i64), "t".into(), 0, None);
        assert!(hit.is_hit());

        let expired = Lookup::expired("k", StorageValue::from(1i64), "t".into(), 5, Some(10));
        assert_eq!(expired.state, LookupState::Expired);
        assert!(expired.value.is_none());
        assert!(expired.stale_value.is_some());
    }
}
