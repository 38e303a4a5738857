//! # Auto-Committing Buffer
//!
//! Request-scoped read caching without deferred semantics: every write goes
//! through a [`Transaction`] and is committed immediately, so all that's
//! left of the transaction machinery is the local buffer, which now also
//! caches plain reads. Anything read from or written to the store once is
//! served from memory afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Buffer, Transaction};
use crate::error::Result;
use crate::expiry::Expiry;
use crate::store::{Lookup, Store};
use crate::value::StorageValue;

/// Read-caching write-through front for any store.
pub struct Buffered {
    base: Arc<dyn Store>,
    buffer: Buffer,
    tx: Transaction,
    collections: Mutex<HashMap<String, Arc<Buffered>>>,
}

impl Buffered {
    pub fn new(base: Arc<dyn Store>) -> Self {
        let buffer = Buffer::new();
        let tx = Transaction::new(buffer.clone(), base.clone());
        Self {
            base,
            buffer,
            tx,
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Keep a read around locally so the next get skips the store.
    async fn remember(&self, key: &str, value: &StorageValue) -> Result<()> {
        if !self.buffer.get(key).await?.is_hit() && !self.buffer.expired(key).await? {
            self.buffer.set(key, value.clone(), Expiry::Never).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for Buffered {
    async fn get(&self, key: &str) -> Result<Lookup> {
        let lookup = self.tx.get(key).await?;
        if let Some(value) = lookup.value.as_ref() {
            self.remember(key, value).await?;
        }
        Ok(lookup)
    }

    async fn set_entry(
        &self,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        let applied = self.tx.set_entry(key, value, expire, compute_micros).await?;
        self.tx.commit().await?;
        Ok(applied)
    }

    async fn cas_entry(
        &self,
        token: &str,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        let applied = self
            .tx
            .cas_entry(token, key, value, expire, compute_micros)
            .await?;
        self.tx.commit().await?;
        Ok(applied)
    }

    async fn add(&self, key: &str, value: StorageValue, expire: Expiry) -> Result<bool> {
        let applied = self.tx.add(key, value, expire).await?;
        self.tx.commit().await?;
        Ok(applied)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let applied = self.tx.delete(key).await?;
        self.tx.commit().await?;
        Ok(applied)
    }

    async fn clear(&self) -> Result<bool> {
        let children: Vec<Arc<Buffered>> = self.collections.lock().values().cloned().collect();
        for child in children {
            Store::clear(child.as_ref()).await?;
        }
        let applied = Store::clear(&self.tx).await?;
        self.tx.commit().await?;
        Ok(applied)
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn Store>> {
        let mut collections = self.collections.lock();
        if let Some(child) = collections.get(name) {
            return Ok(child.clone());
        }
        let child = Arc::new(Buffered::new(self.base.collection(name)?));
        collections.insert(name.to_string(), child.clone());
        Ok(child)
    }

    async fn increment(
        &self,
        key: &str,
        offset: i64,
        initial: i64,
        expire: Expiry,
    ) -> Result<Option<i64>> {
        let applied = self.tx.increment(key, offset, initial, expire).await?;
        self.tx.commit().await?;
        Ok(applied)
    }

    async fn decrement(
        &self,
        key: &str,
        offset: i64,
        initial: i64,
        expire: Expiry,
    ) -> Result<Option<i64>> {
        let applied = self.tx.decrement(key, offset, initial, expire).await?;
        self.tx.commit().await?;
        Ok(applied)
    }

    async fn touch(&self, key: &str, expire: Expiry) -> Result<bool> {
        let applied = self.tx.touch(key, expire).await?;
        self.tx.commit().await?;
        Ok(applied)
    }
}

impl std::fmt::Debug for Buffered {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffered").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::store::StoreExt;

    fn wrapped() -> (Arc<dyn Store>, Buffered) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let buffered = Buffered::new(store.clone());
        (store, buffered)
    }

    #[tokio::test]
    async fn test_writes_commit_immediately() {
        let (store, buffered) = wrapped();
        buffered
            .set("k", StorageValue::from("v"), Expiry::Never)
            .await
            .unwrap();
        assert_eq!(
            store.get_value("k").await.unwrap(),
            Some(StorageValue::from("v"))
        );
    }

    #[tokio::test]
    async fn test_reads_are_cached_locally() {
        let (store, buffered) = wrapped();
        store
            .set("k", StorageValue::from("v1"), Expiry::Never)
            .await
            .unwrap();
        assert_eq!(
            buffered.get_value("k").await.unwrap(),
            Some(StorageValue::from("v1"))
        );

        // external change is invisible: the local copy wins now
        store
            .set("k", StorageValue::from("v2"), Expiry::Never)
            .await
            .unwrap();
        assert_eq!(
            buffered.get_value("k").await.unwrap(),
            Some(StorageValue::from("v1"))
        );
    }

    #[tokio::test]
    async fn test_delete_commits_and_masks() {
        let (store, buffered) = wrapped();
        store
            .set("k", StorageValue::from("v"), Expiry::Never)
            .await
            .unwrap();
        assert!(buffered.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().value.is_none());
        assert!(buffered.get("k").await.unwrap().value.is_none());
    }

    #[tokio::test]
    async fn test_counter_commits_each_step() {
        let (store, buffered) = wrapped();
        assert_eq!(
            buffered.increment("n", 1, 5, Expiry::Never).await.unwrap(),
            Some(5)
        );
        assert_eq!(
            store.get_value("n").await.unwrap(),
            Some(StorageValue::Int(5))
        );
        assert_eq!(
            buffered.increment("n", 1, 5, Expiry::Never).await.unwrap(),
            Some(6)
        );
        assert_eq!(
            store.get_value("n").await.unwrap(),
            Some(StorageValue::Int(6))
        );
    }

    #[tokio::test]
    async fn test_collection_writes_reach_store() {
        let (store, buffered) = wrapped();
        let scoped = buffered.collection("c").unwrap();
        scoped
            .set("k", StorageValue::from("v"), Expiry::Never)
            .await
            .unwrap();
        assert_eq!(
            store
                .collection("c")
                .unwrap()
                .get_value("k")
                .await
                .unwrap(),
            Some(StorageValue::from("v"))
        );
    }
}
