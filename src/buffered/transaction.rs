//! # Deferred-Write Transaction
//!
//! A [`Store`] view combining a staging [`Buffer`] with a [`Defer`] queue:
//! reads prefer uncommitted local state, writes land in both the buffer
//! (immediate local visibility) and the queue (replayed for real on commit).
//!
//! Tokens handed out by a transaction are surrogates. The store's own token
//! for a key won't be valid by the time the deferred CAS actually runs, and
//! a value CAS'd locally never had a store token at all. Every read mints a
//! fresh surrogate id mapped to the content hash of the returned value;
//! `cas` resolves the surrogate back to that hash, verifies the key still
//! reads the same, and schedules the real CAS against the hash.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{Buffer, Defer};
use crate::error::Result;
use crate::expiry::Expiry;
use crate::store::{Lookup, Store};
use crate::value::{token_for, StorageValue};

#[derive(Default)]
struct TxInner {
    defer: Defer,
    /// Set while a clear is staged: reads must not fall through to the
    /// store, it's about to be wiped.
    suspended: bool,
    collections: HashMap<String, Arc<Transaction>>,
}

/// One open transaction over a real store (or over a parent transaction,
/// when nested).
pub struct Transaction {
    store: Arc<dyn Store>,
    buffer: Buffer,
    /// Surrogate token id -> content hash of the value it was minted for.
    tokens: DashMap<String, String>,
    inner: Mutex<TxInner>,
}

impl Transaction {
    pub fn new(buffer: Buffer, store: Arc<dyn Store>) -> Self {
        Self {
            store,
            buffer,
            tokens: DashMap::new(),
            inner: Mutex::new(TxInner::default()),
        }
    }

    /// Swap a lookup's token for a freshly minted surrogate.
    fn mint(&self, mut lookup: Lookup) -> Result<Lookup> {
        let subject = lookup.value.as_ref().or(lookup.stale_value.as_ref());
        let Some(subject) = subject else {
            return Ok(lookup);
        };
        let hash = token_for(subject)?;
        let surrogate = Uuid::new_v4().simple().to_string();
        self.tokens.insert(surrogate.clone(), hash);
        lookup.token = Some(surrogate);
        Ok(lookup)
    }

    /// Replay all deferred writes into the backing store. `Ok(false)` means
    /// the replay failed and was rolled back; see [`Defer::commit`].
    ///
    /// Memoized collection transactions commit first, so their writes reach
    /// the store's collections in the same pass.
    pub fn commit(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            self.tokens.clear();
            let (defer, children) = {
                let mut inner = self.inner.lock();
                inner.suspended = false;
                (
                    std::mem::take(&mut inner.defer),
                    inner.collections.values().cloned().collect::<Vec<_>>(),
                )
            };
            let mut committed = true;
            for child in children {
                committed &= child.commit().await?;
            }
            committed &= defer.commit(&self.store).await?;
            Ok(committed)
        })
    }

    /// Discard all deferred writes and transaction state. The store is
    /// untouched; staged local reads are simply abandoned.
    pub fn rollback(&self) {
        self.tokens.clear();
        let children = {
            let mut inner = self.inner.lock();
            inner.suspended = false;
            inner.defer.clear_writes();
            inner.collections.values().cloned().collect::<Vec<_>>()
        };
        for child in children {
            child.rollback();
        }
    }
}

#[async_trait]
impl Store for Transaction {
    async fn get(&self, key: &str) -> Result<Lookup> {
        let staged = self.buffer.get(key).await?;
        if staged.is_hit() {
            return self.mint(staged);
        }
        if self.inner.lock().suspended {
            // an uncommitted clear: the store's values are dead to us
            return Ok(Lookup::miss(key));
        }
        if self.buffer.expired(key).await? {
            // pending delete; the store still has the old value, don't
            // resurrect it
            return Ok(Lookup::miss(key));
        }
        let real = self.store.get(key).await?;
        self.mint(real)
    }

    async fn set_entry(
        &self,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        _compute_micros: Option<u64>,
    ) -> Result<bool> {
        if !self.buffer.set(key, value.clone(), expire).await? {
            return Ok(false);
        }
        self.inner.lock().defer.set(key, value, expire);
        Ok(true)
    }

    async fn cas_entry(
        &self,
        token: &str,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        _compute_micros: Option<u64>,
    ) -> Result<bool> {
        let original_hash = match self.tokens.get(token) {
            Some(hash) => hash.value().clone(),
            None => return Ok(false),
        };
        // the key must still read as the value the surrogate was minted for
        let current = self.get(key).await?;
        let current_hash = match current.value.as_ref() {
            Some(value) => token_for(value)?,
            None => return Ok(false),
        };
        if current_hash != original_hash {
            return Ok(false);
        }
        if !self.buffer.set(key, value.clone(), expire).await? {
            return Ok(false);
        }
        self.inner
            .lock()
            .defer
            .cas(original_hash, key, value, expire);
        Ok(true)
    }

    async fn add(&self, key: &str, value: StorageValue, expire: Expiry) -> Result<bool> {
        if self.get(key).await?.is_hit() {
            return Ok(false);
        }
        if !self.buffer.set(key, value.clone(), expire).await? {
            return Ok(false);
        }
        self.inner.lock().defer.add(key, value, expire);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let current = self.get(key).await?;
        let Some(value) = current.value else {
            return Ok(false);
        };
        // tombstone: keep the key known-but-expired locally so reads don't
        // fall through to the store's not-yet-deleted copy
        self.buffer.set(key, value, Expiry::from(-1)).await?;
        self.inner.lock().defer.delete(key);
        Ok(true)
    }

    async fn clear(&self) -> Result<bool> {
        let children: Vec<Arc<Transaction>> =
            self.inner.lock().collections.values().cloned().collect();
        for child in children {
            Store::clear(child.as_ref()).await?;
        }
        self.buffer.clear().await?;
        self.tokens.clear();
        let mut inner = self.inner.lock();
        inner.suspended = true;
        inner.defer.clear();
        Ok(true)
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn Store>> {
        let mut inner = self.inner.lock();
        if let Some(child) = inner.collections.get(name) {
            return Ok(child.clone());
        }
        let child = Arc::new(Transaction::new(
            self.buffer.collection(name)?,
            self.store.collection(name)?,
        ));
        inner.collections.insert(name.to_string(), child.clone());
        Ok(child)
    }

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
        let current = self.get(key).await?;
        let base = match current.value {
            Some(value) => match value.as_int() {
                Some(base) => base,
                None => return Ok(None),
            },
            None => initial - offset,
        };
        let Some(next) = base.checked_add(offset) else {
            return Ok(None);
        };
        if !self.buffer.set(key, StorageValue::Int(next), expire).await? {
            return Ok(None);
        }
        self.inner
            .lock()
            .defer
            .increment(key, offset, initial, expire);
        Ok(Some(next))
    }

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
        let current = self.get(key).await?;
        let base = match current.value {
            Some(value) => match value.as_int() {
                Some(base) => base,
                None => return Ok(None),
            },
            None => initial + offset,
        };
        let Some(next) = base.checked_sub(offset) else {
            return Ok(None);
        };
        if !self.buffer.set(key, StorageValue::Int(next), expire).await? {
            return Ok(None);
        }
        self.inner
            .lock()
            .defer
            .decrement(key, offset, initial, expire);
        Ok(Some(next))
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool> {
        let current = self.get(key).await?;
        let Some(value) = current.value else {
            return Ok(false);
        };
        if !self.buffer.set(key, value, expire).await? {
            return Ok(false);
        }
        self.inner.lock().defer.touch(key, expire);
        Ok(true)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("pending", &inner.defer.has_pending())
            .field("suspended", &inner.suspended)
            .finish_non_exhaustive()
    }
}
