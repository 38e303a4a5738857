//! # In-Memory Adapter
//!
//! No-storage cache: values live in a process-local map and die with it.
//! Useful on its own for testing application logic without a cache server,
//! and doubles as the engine behind the transaction layer's staging
//! [`Buffer`](crate::buffered::Buffer).
//!
//! The map is shared behind one mutex; collections are prefix views over
//! the same map, so a collection can be cleared through an explicit
//! prefix-scoped bulk delete instead of poking at a sibling's internals.
//! Entries are LRU-ordered and evicted once a byte budget is exceeded.
//! Logically-expired entries stick around for the stale-retention window so
//! `get_set` can fall back to them when regeneration fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::DEFAULT_MEMORY_LIMIT_BYTES;
use crate::error::Result;
use crate::expiry::{is_past, stale_window, EarlyExpiration, Expiry};
use crate::store::{validate_collection_name, validate_key, Lookup, Store};
use crate::value::{decode, encode, token_for_encoded, StorageValue};

/// Separator between a collection prefix and the keys under it. A control
/// character: keys are validated to never contain one, so prefixed keys
/// can't collide with sibling collections or parent keys.
const PREFIX_SEP: char = '\u{1f}';

#[derive(Debug, Clone)]
struct MemEntry {
    encoded: String,
    expiry: i64,
    /// When the stale copy stops being retrievable; 0 = kept forever.
    purge_at: i64,
    compute_micros: Option<u64>,
    touched: u64,
}

#[derive(Debug)]
struct MemoryInner {
    items: HashMap<String, MemEntry>,
    /// LRU index: touch sequence -> key.
    order: BTreeMap<u64, String>,
    seq: u64,
    size: usize,
    /// Byte budget; 0 = unlimited.
    limit: usize,
    /// Pinned stores (transaction buffers) must never silently drop state.
    evictable: bool,
    /// Buffers retain expired entries as tombstones instead of purging.
    keep_expired: bool,
}

impl MemoryInner {
    fn touch(&mut self, key: &str) {
        if let Some(entry) = self.items.get_mut(key) {
            self.order.remove(&entry.touched);
            self.seq += 1;
            entry.touched = self.seq;
            self.order.insert(self.seq, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<MemEntry> {
        let entry = self.items.remove(key)?;
        self.order.remove(&entry.touched);
        self.size -= entry.encoded.len();
        Some(entry)
    }

    /// Live check; purges stale entries past their retention window unless
    /// tombstones must be kept.
    fn exists(&mut self, key: &str) -> bool {
        let (expiry, purge_at) = match self.items.get(key) {
            Some(entry) => (entry.expiry, entry.purge_at),
            None => return false,
        };
        if is_past(expiry) {
            if !self.keep_expired && is_past(purge_at) {
                self.remove(key);
            }
            return false;
        }
        self.touch(key);
        true
    }

    fn insert(&mut self, key: String, encoded: String, expiry: i64, compute_micros: Option<u64>) {
        if let Some(old) = self.items.get(&key) {
            self.size -= old.encoded.len();
            let touched = old.touched;
            self.order.remove(&touched);
        }
        let purge_at = if expiry == 0 {
            0
        } else {
            expiry + stale_window(expiry - Utc::now().timestamp())
        };
        self.seq += 1;
        self.size += encoded.len();
        self.order.insert(self.seq, key.clone());
        self.items.insert(
            key,
            MemEntry {
                encoded,
                expiry,
                purge_at,
                compute_micros,
                touched: self.seq,
            },
        );
        self.evict();
    }

    fn set(&mut self, key: &str, encoded: String, expiry: i64, compute_micros: Option<u64>) {
        if is_past(expiry) && !self.keep_expired {
            // storing an already-expired value: just make sure it's gone
            self.remove(key);
            return;
        }
        self.insert(key.to_string(), encoded, expiry, compute_micros);
    }

    fn evict(&mut self) {
        if !self.evictable || self.limit == 0 {
            return;
        }
        while self.size > self.limit {
            let oldest = match self.order.keys().next().copied() {
                Some(seq) => seq,
                None => break,
            };
            match self.order.get(&oldest).cloned() {
                Some(key) => {
                    debug!(key = %key, "memory budget exceeded, evicting LRU entry");
                    if self.remove(&key).is_none() {
                        self.order.remove(&oldest);
                    }
                }
                None => break,
            }
        }
    }

    fn clear_prefix(&mut self, prefix: &str) {
        let doomed: Vec<String> = self
            .items
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in doomed {
            self.remove(&key);
        }
    }
}

/// In-process store over a shared, LRU-bounded map.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Mutex<MemoryInner>>,
    prefix: String,
    check: EarlyExpiration,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MEMORY_LIMIT_BYTES)
    }

    /// Byte-budgeted store; 0 means unlimited.
    pub fn with_limit(limit: usize) -> Self {
        Self::build(limit, true, false)
    }

    /// Staging-buffer mode: unlimited, pinned (uncommitted writes are never
    /// evicted) and tombstone-retaining (expired entries stay known).
    pub(crate) fn buffer() -> Self {
        Self::build(0, false, true)
    }

    fn build(limit: usize, evictable: bool, keep_expired: bool) -> Self {
        Self {
            shared: Arc::new(Mutex::new(MemoryInner {
                items: HashMap::new(),
                order: BTreeMap::new(),
                seq: 0,
                size: 0,
                limit,
                evictable,
                keep_expired,
            })),
            prefix: String::new(),
            check: EarlyExpiration::default(),
        }
    }

    /// Override the early-expiration sampler (deterministic in tests).
    pub fn with_early_expiration(mut self, check: EarlyExpiration) -> Self {
        self.check = check;
        self
    }

    fn full_key(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}{}", self.prefix, key))
    }

    /// Prefix view over the same shared map.
    pub(crate) fn derive_collection(&self, name: &str) -> Result<MemoryStore> {
        validate_collection_name(name)?;
        Ok(MemoryStore {
            shared: Arc::clone(&self.shared),
            prefix: format!("{}{}{}", self.prefix, name, PREFIX_SEP),
            check: self.check.clone(),
        })
    }

    /// Key known at all, live or expired. Tombstone probe for the buffer.
    pub(crate) fn known(&self, key: &str) -> Result<bool> {
        let full = self.full_key(key)?;
        Ok(self.shared.lock().items.contains_key(&full))
    }

    /// Current total byte size (whole shared map).
    pub fn size_bytes(&self) -> usize {
        self.shared.lock().size
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Lookup> {
        let full = self.full_key(key)?;
        let entry = {
            let mut inner = self.shared.lock();
            match inner.items.get(&full) {
                Some(entry) => {
                    let entry = entry.clone();
                    inner.touch(&full);
                    entry
                }
                None => return Ok(Lookup::miss(key)),
            }
        };
        let token = token_for_encoded(&entry.encoded);
        let value = decode(&entry.encoded)?;
        if self.check.is_expired(entry.expiry, entry.compute_micros) {
            return Ok(Lookup::expired(
                key,
                value,
                token,
                entry.expiry,
                entry.compute_micros,
            ));
        }
        Ok(Lookup::hit(
            key,
            value,
            token,
            entry.expiry,
            entry.compute_micros,
        ))
    }

    async fn set_entry(
        &self,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        let full = self.full_key(key)?;
        let encoded = encode(&value)?;
        let expiry = expire.normalize();
        self.shared
            .lock()
            .set(&full, encoded, expiry, compute_micros);
        Ok(true)
    }

    async fn cas_entry(
        &self,
        token: &str,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> Result<bool> {
        let full = self.full_key(key)?;
        let encoded = encode(&value)?;
        let expiry = expire.normalize();
        // compare and swap under one guard so concurrent callers holding
        // the same token can't both win
        let mut inner = self.shared.lock();
        if let Some(entry) = inner.items.get(&full) {
            let live = !self.check.is_expired(entry.expiry, entry.compute_micros);
            if live && token_for_encoded(&entry.encoded) != token {
                return Ok(false);
            }
        }
        inner.set(&full, encoded, expiry, compute_micros);
        Ok(true)
    }

    async fn add(&self, key: &str, value: StorageValue, expire: Expiry) -> Result<bool> {
        let full = self.full_key(key)?;
        let encoded = encode(&value)?;
        let expiry = expire.normalize();
        let mut inner = self.shared.lock();
        if inner.exists(&full) {
            return Ok(false);
        }
        inner.set(&full, encoded, expiry, None);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let full = self.full_key(key)?;
        let mut inner = self.shared.lock();
        let existed = inner.exists(&full);
        if existed {
            inner.remove(&full);
        }
        Ok(existed)
    }

    async fn clear(&self) -> Result<bool> {
        let mut inner = self.shared.lock();
        if self.prefix.is_empty() {
            inner.items.clear();
            inner.order.clear();
            inner.size = 0;
        } else {
            inner.clear_prefix(&self.prefix);
        }
        Ok(true)
    }

    fn collection(&self, name: &str) -> Result<Arc<dyn Store>> {
        Ok(Arc::new(self.derive_collection(name)?))
    }
}
