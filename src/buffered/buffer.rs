//! # Transaction Staging Buffer
//!
//! A [`MemoryStore`] in staging mode: unlimited and unevictable (dropping an
//! uncommitted write would corrupt the transaction) and retaining expired
//! entries as tombstones.
//!
//! The tombstone distinction is what makes pending deletes work: "I know
//! this key and it's gone here" must not fall through to the real store,
//! which still holds the not-yet-deleted value, while "never heard of this
//! key" must.

use crate::adapters::MemoryStore;
use crate::error::Result;
use crate::expiry::Expiry;
use crate::store::{Lookup, Store};
use crate::value::StorageValue;

/// Local staging store for a [`Transaction`](super::Transaction).
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    store: MemoryStore,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::buffer(),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Lookup> {
        self.store.get(key).await
    }

    pub async fn set(&self, key: &str, value: StorageValue, expire: Expiry) -> Result<bool> {
        self.store.set(key, value, expire).await
    }

    pub async fn clear(&self) -> Result<bool> {
        self.store.clear().await
    }

    /// Key known here but no longer retrievable: a tombstone (staged delete)
    /// or a staged value that has since expired. Distinct from a plain miss.
    pub async fn expired(&self, key: &str) -> Result<bool> {
        if !self.store.known(key)? {
            return Ok(false);
        }
        Ok(!self.get(key).await?.is_hit())
    }

    /// Prefix view over the same staging map.
    pub fn collection(&self, name: &str) -> Result<Buffer> {
        Ok(Buffer {
            store: self.store.derive_collection(name)?,
        })
    }
}
