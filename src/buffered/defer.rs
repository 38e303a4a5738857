//! # Deferred Write Queue
//!
//! Records every pending mutation keyed by target key, folding redundant
//! operations at insertion time, then replays the queue against the real
//! store on commit.
//!
//! Replay is all-or-nothing at the queue level even though the underlying
//! store has no multi-key transactions: operations prone to conflict (CAS,
//! add) run first while backend state is freshest, and the values they
//! overwrite are snapshotted up front so a failure partway can restore the
//! keys this transaction already touched. Restoration itself goes through
//! CAS, so a concurrent writer that got there in the meantime is never
//! clobbered.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::expiry::Expiry;
use crate::store::{apply_offset, Store};
use crate::value::{token_for, StorageValue};

/// One pending operation per key; later operations fold into it.
#[derive(Debug, Clone)]
enum Pending {
    Set {
        value: StorageValue,
        expire: Expiry,
    },
    Add {
        value: StorageValue,
        expire: Expiry,
    },
    /// `original_token` is the content hash observed when the caller took
    /// its token, verified against the store again at replay time.
    Cas {
        original_token: String,
        value: StorageValue,
        expire: Expiry,
    },
    /// Signed net offset; replayed as increment or decrement by sign.
    Counter {
        offset: i64,
        initial: i64,
        expire: Expiry,
    },
    Touch {
        expire: Expiry,
    },
    Delete,
}

impl Pending {
    fn value_mut(&mut self) -> Option<(&mut StorageValue, &mut Expiry)> {
        match self {
            Pending::Set { value, expire }
            | Pending::Add { value, expire }
            | Pending::Cas { value, expire, .. } => Some((value, expire)),
            _ => None,
        }
    }

    fn expire_mut(&mut self) -> Option<&mut Expiry> {
        match self {
            Pending::Set { expire, .. }
            | Pending::Add { expire, .. }
            | Pending::Cas { expire, .. }
            | Pending::Counter { expire, .. }
            | Pending::Touch { expire } => Some(expire),
            Pending::Delete => None,
        }
    }
}

/// A materialized update ready to run, ordered by conflict risk.
enum Update {
    Clear,
    Cas {
        original_token: String,
        key: String,
        value: StorageValue,
        expire: Expiry,
    },
    Add {
        key: String,
        value: StorageValue,
        expire: Expiry,
    },
    Touch {
        key: String,
        expire: Expiry,
    },
    Counter {
        key: String,
        offset: i64,
        initial: i64,
        expire: Expiry,
    },
    SetMultiple {
        items: HashMap<String, StorageValue>,
        expire: Expiry,
    },
    DeleteMultiple(Vec<String>),
}

impl Update {
    /// Most failure-prone first: if something must roll back, the least
    /// work has been done.
    fn rank(&self) -> u8 {
        match self {
            Update::Clear => 0,
            Update::Cas { .. } => 1,
            Update::Add { .. } => 2,
            Update::Touch { .. } => 3,
            Update::Counter { .. } => 4,
            Update::SetMultiple { .. } => 5,
            Update::DeleteMultiple(_) => 6,
        }
    }
}

/// Per-key write queue for one transaction.
#[derive(Debug, Default)]
pub(crate) struct Defer {
    pending: HashMap<String, Pending>,
    flush: bool,
}

impl Defer {
    pub fn set(&mut self, key: &str, value: StorageValue, expire: Expiry) {
        self.pending
            .insert(key.to_string(), Pending::Set { value, expire });
    }

    pub fn add(&mut self, key: &str, value: StorageValue, expire: Expiry) {
        self.pending
            .insert(key.to_string(), Pending::Add { value, expire });
    }

    pub fn cas(&mut self, original_token: String, key: &str, value: StorageValue, expire: Expiry) {
        // a pending set/add/cas already owns this key's next commit, so the
        // token check is redundant: fold the new value straight in
        if let Some((pending_value, pending_expire)) =
            self.pending.get_mut(key).and_then(Pending::value_mut)
        {
            *pending_value = value;
            *pending_expire = expire;
            return;
        }
        self.pending.insert(
            key.to_string(),
            Pending::Cas {
                original_token,
                value,
                expire,
            },
        );
    }

    pub fn increment(&mut self, key: &str, offset: i64, initial: i64, expire: Expiry) {
        self.fold_counter(key, offset, initial, expire);
    }

    pub fn decrement(&mut self, key: &str, offset: i64, initial: i64, expire: Expiry) {
        self.fold_counter(key, -offset, initial, expire);
    }

    fn fold_counter(&mut self, key: &str, signed_offset: i64, initial: i64, expire: Expiry) {
        if let Some(pending) = self.pending.get_mut(key) {
            match pending {
                // counting on top of a value we're about to write: pre-compute
                Pending::Set {
                    value,
                    expire: pending_expire,
                }
                | Pending::Add {
                    value,
                    expire: pending_expire,
                }
                | Pending::Cas {
                    value,
                    expire: pending_expire,
                    ..
                } => {
                    if let Some(current) = value.as_int() {
                        *value = StorageValue::Int(current.saturating_add(signed_offset));
                        *pending_expire = expire;
                        return;
                    }
                    // non-numeric pending value: the counter supersedes it
                }
                Pending::Counter {
                    offset,
                    initial: pending_initial,
                    expire: pending_expire,
                } => {
                    *offset = offset.saturating_add(signed_offset);
                    *pending_initial = pending_initial.saturating_add(signed_offset);
                    *pending_expire = expire;
                    return;
                }
                // touch and delete are moot once a counter follows
                Pending::Touch { .. } | Pending::Delete => {}
            }
        }
        self.pending.insert(
            key.to_string(),
            Pending::Counter {
                offset: signed_offset,
                initial,
                expire,
            },
        );
    }

    pub fn touch(&mut self, key: &str, expire: Expiry) {
        // changing the expiry of a value we're already writing: just write
        // it with the new expiry
        if let Some(pending_expire) = self.pending.get_mut(key).and_then(Pending::expire_mut) {
            *pending_expire = expire;
            return;
        }
        self.pending.insert(key.to_string(), Pending::Touch { expire });
    }

    pub fn delete(&mut self, key: &str) {
        self.pending.insert(key.to_string(), Pending::Delete);
    }

    /// A flush makes every pending per-key write moot.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.flush = true;
    }

    /// Discard everything, including a pending flush.
    pub fn clear_writes(&mut self) {
        self.pending.clear();
        self.flush = false;
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty() || self.flush
    }

    /// Replay the queue against the real store. `Ok(false)` means some
    /// operation failed and every key this commit had already written was
    /// best-effort restored.
    pub async fn commit(mut self, store: &Arc<dyn Store>) -> Result<bool> {
        let pending = std::mem::take(&mut self.pending);
        let flush = std::mem::take(&mut self.flush);

        // snapshot keys whose current value we're about to overwrite
        let mut planned: HashMap<String, StorageValue> = HashMap::new();
        for (key, op) in &pending {
            if let Pending::Set { value, .. } | Pending::Cas { value, .. } = op {
                planned.insert(key.clone(), value.clone());
            }
        }
        let observed = if planned.is_empty() {
            HashMap::new()
        } else {
            let keys: Vec<&str> = planned.keys().map(String::as_str).collect();
            store.get_multiple(&keys).await?
        };

        let updates = Self::materialize(pending, flush);
        for update in updates {
            let applied = match Self::apply(store, update).await {
                Ok(applied) => applied,
                Err(err) => {
                    warn!(error = %err, "deferred write failed");
                    false
                }
            };
            if !applied {
                Self::revert(store, &observed, &planned).await;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Turn the per-key queue into an ordered update list, batching sets by
    /// expiry and deletes into one call.
    fn materialize(pending: HashMap<String, Pending>, flush: bool) -> Vec<Update> {
        let mut updates = Vec::new();
        if flush {
            updates.push(Update::Clear);
        }
        let mut set_groups: HashMap<i64, HashMap<String, StorageValue>> = HashMap::new();
        let mut deletes = Vec::new();
        for (key, op) in pending {
            match op {
                Pending::Set { value, expire } => {
                    set_groups
                        .entry(expire.normalize())
                        .or_default()
                        .insert(key, value);
                }
                Pending::Delete => deletes.push(key),
                Pending::Add { value, expire } => updates.push(Update::Add { key, value, expire }),
                Pending::Cas {
                    original_token,
                    value,
                    expire,
                } => updates.push(Update::Cas {
                    original_token,
                    key,
                    value,
                    expire,
                }),
                Pending::Counter {
                    offset,
                    initial,
                    expire,
                } => updates.push(Update::Counter {
                    key,
                    offset,
                    initial,
                    expire,
                }),
                Pending::Touch { expire } => updates.push(Update::Touch { key, expire }),
            }
        }
        for (normalized, items) in set_groups {
            updates.push(Update::SetMultiple {
                items,
                expire: expiry_from_normalized(normalized),
            });
        }
        if !deletes.is_empty() {
            updates.push(Update::DeleteMultiple(deletes));
        }
        updates.sort_by_key(Update::rank);
        updates
    }

    async fn apply(store: &Arc<dyn Store>, update: Update) -> Result<bool> {
        match update {
            Update::Clear => store.clear().await,
            Update::Cas {
                original_token,
                key,
                value,
                expire,
            } => {
                // the token recorded at staging time is a content hash, not
                // a store token; re-read, verify the value is still the one
                // the caller saw, then CAS with the store's live token
                let current = store.get(&key).await?;
                let (Some(seen), Some(live_token)) =
                    (current.value.as_ref(), current.token.as_deref())
                else {
                    return Ok(false);
                };
                if token_for(seen)? != original_token {
                    return Ok(false);
                }
                store.cas(live_token, &key, value, expire).await
            }
            Update::Add { key, value, expire } => store.add(&key, value, expire).await,
            Update::Touch { key, expire } => store.touch(&key, expire).await,
            Update::Counter {
                key,
                offset,
                initial,
                expire,
            } => {
                // the folded net offset and adjusted initial may be
                // negative, which the public increment/decrement entry
                // points reject; replay through the raw apply instead
                let applied = apply_offset(store.as_ref(), &key, offset, initial, expire).await?;
                Ok(applied.is_some())
            }
            Update::SetMultiple { items, expire } => {
                let success = store.set_multiple(items, expire).await?;
                Ok(success.values().all(|ok| *ok))
            }
            Update::DeleteMultiple(keys) => {
                // a key that's already gone isn't a consistency problem
                let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                store.delete_multiple(&refs).await?;
                Ok(true)
            }
        }
    }

    /// Undo this commit's own writes. A key whose current value isn't what
    /// we wrote belongs to someone else now and is left alone; so is a key
    /// whose restoring CAS loses a race.
    async fn revert(
        store: &Arc<dyn Store>,
        observed: &HashMap<String, (StorageValue, String)>,
        planned: &HashMap<String, StorageValue>,
    ) {
        for (key, (old_value, _)) in observed {
            let current = match store.get(key).await {
                Ok(current) => current,
                Err(err) => {
                    warn!(key = %key, error = %err, "rollback read failed");
                    continue;
                }
            };
            if current.value.as_ref() != planned.get(key) {
                continue;
            }
            let Some(token) = current.token.as_deref() else {
                continue;
            };
            let expire = expiry_from_normalized(current.expiry);
            debug!(key = %key, "restoring pre-transaction value");
            let _ = store.cas(token, key, old_value.clone(), expire).await;
        }
    }
}

fn expiry_from_normalized(normalized: i64) -> Expiry {
    if normalized == 0 {
        Expiry::Never
    } else {
        Expiry::Seconds(normalized)
    }
}

impl Drop for Defer {
    fn drop(&mut self) {
        if !self.pending.is_empty() && !std::thread::panicking() {
            panic!("cache transaction destroyed without having been committed or rolled back");
        }
    }
}
