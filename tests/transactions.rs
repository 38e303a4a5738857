//! End-to-end tests for the transaction layer: isolation, commit atomicity
//! of intent, operation folding and the auto-committing wrapper.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use proptest::prelude::*;

use kvstash::{
    Buffered, Expiry, Lookup, MemoryStore, StorageValue, Store, StoreExt, Transactional,
};

/// Store double that counts physical write calls.
#[derive(Debug)]
struct CountingStore {
    inner: MemoryStore,
    writes: AtomicUsize,
}

impl CountingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            writes: AtomicUsize::new(0),
        }
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn get(&self, key: &str) -> kvstash::Result<Lookup> {
        self.inner.get(key).await
    }

    async fn set_entry(
        &self,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> kvstash::Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.set_entry(key, value, expire, compute_micros).await
    }

    async fn cas_entry(
        &self,
        token: &str,
        key: &str,
        value: StorageValue,
        expire: Expiry,
        compute_micros: Option<u64>,
    ) -> kvstash::Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .cas_entry(token, key, value, expire, compute_micros)
            .await
    }

    async fn add(&self, key: &str, value: StorageValue, expire: Expiry) -> kvstash::Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.add(key, value, expire).await
    }

    async fn delete(&self, key: &str) -> kvstash::Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }

    async fn clear(&self) -> kvstash::Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.clear().await
    }

    fn collection(&self, name: &str) -> kvstash::Result<Arc<dyn Store>> {
        self.inner.collection(name)
    }
}

#[tokio::test]
async fn transaction_isolation() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let cache = Transactional::new(store.clone());

    cache.begin();
    cache
        .set("k", StorageValue::from("v"), Expiry::Never)
        .await
        .unwrap();
    // locally visible, store never touched
    assert_eq!(
        cache.get_value("k").await.unwrap(),
        Some(StorageValue::from("v"))
    );
    assert!(store.get("k").await.unwrap().value.is_none());

    // a local delete must not be resurrected by the store's copy
    store
        .set("ghost", StorageValue::from("real"), Expiry::Never)
        .await
        .unwrap();
    assert!(cache.delete("ghost").await.unwrap());
    store.delete("ghost").await.unwrap();
    store
        .set("ghost", StorageValue::from("external"), Expiry::Never)
        .await
        .unwrap();
    assert!(cache.get("ghost").await.unwrap().value.is_none());

    assert!(cache.commit().await.unwrap());
    assert!(store.get("k").await.unwrap().is_hit());
}

#[tokio::test]
async fn failed_commit_restores_written_keys() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .set("a", StorageValue::from("a-initial"), Expiry::Never)
        .await
        .unwrap();
    store
        .set("b", StorageValue::from("b-initial"), Expiry::Never)
        .await
        .unwrap();

    let cache = Transactional::new(store.clone());
    cache.begin();

    // cas both keys through the transaction
    let token_a = cache.get("a").await.unwrap().token.unwrap();
    assert!(cache
        .cas(&token_a, "a", StorageValue::from("a-new"), Expiry::Never)
        .await
        .unwrap());
    let token_b = cache.get("b").await.unwrap().token.unwrap();
    assert!(cache
        .cas(&token_b, "b", StorageValue::from("b-new"), Expiry::Never)
        .await
        .unwrap());

    // external writer changes "b" behind the transaction's back
    store
        .set("b", StorageValue::from("b-external"), Expiry::Never)
        .await
        .unwrap();

    assert!(!cache.commit().await.unwrap());
    // "a" is back to its pre-transaction value (if it was written at all),
    // "b" shows the external mutation
    assert_eq!(
        store.get_value("a").await.unwrap(),
        Some(StorageValue::from("a-initial"))
    );
    assert_eq!(
        store.get_value("b").await.unwrap(),
        Some(StorageValue::from("b-external"))
    );
}

#[tokio::test]
async fn folding_produces_a_single_physical_write() {
    let counting = Arc::new(CountingStore::new());
    let store: Arc<dyn Store> = counting.clone();
    let cache = Transactional::new(store);

    cache.begin();
    cache
        .set("k", StorageValue::Int(1), Expiry::Never)
        .await
        .unwrap();
    assert_eq!(
        cache.increment("k", 5, 0, Expiry::Never).await.unwrap(),
        Some(6)
    );
    assert_eq!(counting.writes(), 0, "nothing physical before commit");

    assert!(cache.commit().await.unwrap());
    assert_eq!(counting.writes(), 1, "set + increment must fold");
    assert_eq!(
        counting.get_value("k").await.unwrap(),
        Some(StorageValue::Int(6))
    );
}

#[tokio::test]
async fn nested_cas_commits_into_outer() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .set("k", StorageValue::from("v1"), Expiry::Never)
        .await
        .unwrap();
    let cache = Transactional::new(store.clone());

    cache.begin();
    cache.begin();
    // the token seen inside the inner transaction is a surrogate over a
    // surrogate; the replay must still resolve it layer by layer
    let token = cache.get("k").await.unwrap().token.unwrap();
    assert!(cache
        .cas(&token, "k", StorageValue::from("v2"), Expiry::Never)
        .await
        .unwrap());

    assert!(cache.commit().await.unwrap(), "inner commit into outer");
    assert_eq!(
        store.get_value("k").await.unwrap(),
        Some(StorageValue::from("v1")),
        "store untouched until the outer commit"
    );
    assert_eq!(
        cache.get_value("k").await.unwrap(),
        Some(StorageValue::from("v2"))
    );

    assert!(cache.commit().await.unwrap());
    assert_eq!(
        store.get_value("k").await.unwrap(),
        Some(StorageValue::from("v2"))
    );
}

#[tokio::test]
async fn nested_counters_with_negative_net_commit() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .set("n", StorageValue::Int(10), Expiry::Never)
        .await
        .unwrap();
    let cache = Transactional::new(store.clone());

    cache.begin();
    assert_eq!(
        cache.increment("n", 2, 0, Expiry::Never).await.unwrap(),
        Some(12)
    );
    assert_eq!(
        cache.decrement("n", 5, 0, Expiry::Never).await.unwrap(),
        Some(7)
    );
    assert!(cache.commit().await.unwrap(), "negative net offset must fold");
    assert_eq!(
        store.get_value("n").await.unwrap(),
        Some(StorageValue::Int(7))
    );
}

#[tokio::test]
async fn increment_refuses_on_overflow() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .set("n", StorageValue::Int(i64::MAX), Expiry::Never)
        .await
        .unwrap();
    assert_eq!(store.increment("n", 1, 0, Expiry::Never).await.unwrap(), None);
    assert_eq!(
        store.get_value("n").await.unwrap(),
        Some(StorageValue::Int(i64::MAX))
    );

    let cache = Transactional::new(store.clone());
    cache.begin();
    assert_eq!(cache.increment("n", 1, 0, Expiry::Never).await.unwrap(), None);
    assert!(cache.commit().await.unwrap());
}

#[tokio::test]
async fn clear_in_transaction_suspends_reads() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .set("k", StorageValue::from("v"), Expiry::Never)
        .await
        .unwrap();
    let cache = Transactional::new(store.clone());

    cache.begin();
    assert!(cache.clear().await.unwrap());
    assert!(cache.get("k").await.unwrap().value.is_none());
    // store still intact until commit
    assert!(store.get("k").await.unwrap().is_hit());

    assert!(cache.commit().await.unwrap());
    assert!(store.get("k").await.unwrap().value.is_none());
}

#[tokio::test]
async fn set_multiple_commits_per_expiry_batch() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let cache = Transactional::new(store.clone());

    cache.begin();
    let mut items = HashMap::new();
    items.insert("a".to_string(), StorageValue::Int(1));
    items.insert("b".to_string(), StorageValue::Int(2));
    let success = cache.set_multiple(items, Expiry::from(600)).await.unwrap();
    assert!(success.values().all(|ok| *ok));

    assert!(cache.commit().await.unwrap());
    assert_eq!(
        store.get_value("a").await.unwrap(),
        Some(StorageValue::Int(1))
    );
    assert_eq!(
        store.get_value("b").await.unwrap(),
        Some(StorageValue::Int(2))
    );
}

#[tokio::test]
async fn buffered_commits_writes_immediately() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let buffered = Buffered::new(store.clone());

    buffered
        .set("k", StorageValue::from("v"), Expiry::Never)
        .await
        .unwrap();
    assert!(store.get("k").await.unwrap().is_hit());

    // reads are answered locally once seen
    store
        .set("k", StorageValue::from("changed"), Expiry::Never)
        .await
        .unwrap();
    assert_eq!(
        buffered.get_value("k").await.unwrap(),
        Some(StorageValue::from("v"))
    );
}

#[derive(Debug, Clone, Copy)]
enum CounterOp {
    Increment(i64),
    Decrement(i64),
}

fn counter_ops() -> impl Strategy<Value = Vec<CounterOp>> {
    prop::collection::vec(
        prop_oneof![
            (1i64..50).prop_map(CounterOp::Increment),
            (1i64..50).prop_map(CounterOp::Decrement),
        ],
        1..8,
    )
}

proptest! {
    // a folded counter sequence lands on the same value as applying the
    // operations one by one
    #[test]
    fn counter_folding_matches_sequential_application(start in 0i64..1000, ops in counter_ops()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            store.set("n", StorageValue::Int(start), Expiry::Never).await.unwrap();

            let cache = Transactional::new(store.clone());
            cache.begin();
            let mut expected = start;
            for op in &ops {
                match op {
                    CounterOp::Increment(offset) => {
                        expected += offset;
                        cache.increment("n", *offset, 0, Expiry::Never).await.unwrap();
                    }
                    CounterOp::Decrement(offset) => {
                        expected -= offset;
                        cache.decrement("n", *offset, 0, Expiry::Never).await.unwrap();
                    }
                }
            }
            prop_assert!(cache.commit().await.unwrap());
            prop_assert_eq!(
                store.get_value("n").await.unwrap(),
                Some(StorageValue::Int(expected))
            );
            Ok(())
        })?;
    }
}
