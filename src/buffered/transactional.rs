//! # Explicit Transactions
//!
//! A stack of [`Transaction`]s over a base store. Operations always target
//! the innermost open transaction (or the base store when none is open), so
//! transactions nest naturally: an inner commit replays into the outer
//! transaction, not into the real store, and only the outermost commit
//! makes anything durable.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{Buffer, Transaction};
use crate::error::{CacheError, Result};
use crate::expiry::Expiry;
use crate::store::{Lookup, Store};
use crate::value::StorageValue;

/// Store wrapper with begin/commit/rollback.
pub struct Transactional {
    base: Arc<dyn Store>,
    stack: Mutex<Vec<Arc<Transaction>>>,
}

impl Transactional {
    pub fn new(base: Arc<dyn Store>) -> Self {
        Self {
            base,
            stack: Mutex::new(Vec::new()),
        }
    }

    /// Innermost open transaction, or the base store.
    fn top(&self) -> Arc<dyn Store> {
        match self.stack.lock().last() {
            Some(tx) => tx.clone(),
            None => self.base.clone(),
        }
    }

    /// Open a transaction. All writes are deferred until the matching
    /// [`commit`](Self::commit).
    pub fn begin(&self) {
        let mut stack = self.stack.lock();
        let parent: Arc<dyn Store> = match stack.last() {
            Some(tx) => tx.clone(),
            None => self.base.clone(),
        };
        debug!(depth = stack.len() + 1, "beginning cache transaction");
        stack.push(Arc::new(Transaction::new(Buffer::new(), parent)));
    }

    /// Commit the innermost transaction into its parent (the real store for
    /// the outermost one). `Ok(false)` means the replay failed and affected
    /// keys were best-effort restored.
    pub async fn commit(&self) -> Result<bool> {
        let tx = self
            .stack
            .lock()
            .pop()
            .ok_or_else(|| CacheError::unbegun("commit"))?;
        tx.commit().await
    }

    /// Discard the innermost transaction's pending writes.
    pub fn rollback(&self) -> Result<()> {
        let tx = self
            .stack
            .lock()
            .pop()
            .ok_or_else(|| CacheError::unbegun("rollback"))?;
        tx.rollback();
        Ok(())
    }

    /// Whether a transaction is currently open.
    pub fn in_transaction(&self) -> bool {
        !self.stack.lock().is_empty()
    }
}

impl Drop for Transactional {
    fn drop(&mut self) {
        // never let pending writes escape or panic the defer queue
        let mut stack = self.stack.lock();
        while let Some(tx) = stack.pop() {
            tx.rollback();
        }
    }
}

#[async_trait]
impl Store for Transactional {
    async fn get(&self, key: &str) -> Result<Lookup> {
        self.top().get(key).await
    }

    async fn set_entry(
        &self,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        self.top().set_entry(key, value, expire, compute_micros).await
    }

    async fn cas_entry(
        &self,
        token: &str,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        self.top()
            .cas_entry(token, key, value, expire, compute_micros)
            .await
    }

    async fn add(&self, key: &str, value: StorageValue, expire: Expiry) -> Result<bool> {
        self.top().add(key, value, expire).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.top().delete(key).await
    }

    async fn clear(&self) -> Result<bool> {
        self.top().clear().await
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn Store>> {
        Ok(Arc::new(Transactional::new(self.top().collection(name)?)))
    }

    async fn increment(
        &self,
        key: &str,
        offset: i64,
        initial: i64,
        expire: Expiry,
    ) -> Result<Option<i64>> {
        self.top().increment(key, offset, initial, expire).await
    }

    async fn decrement(
        &self,
        key: &str,
        offset: i64,
        initial: i64,
        expire: Expiry,
    ) -> Result<Option<i64>> {
        self.top().decrement(key, offset, initial, expire).await
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool> {
        self.top().touch(key, expire).await
    }
}

impl std::fmt::Debug for Transactional {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transactional")
            .field("depth", &self.stack.lock().len())
            .finish_non_exhaustive()
    }
}
