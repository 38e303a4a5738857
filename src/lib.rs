//! # kvstash
//!
//! Polymorphic key-value cache with optimistic concurrency (CAS), stampede
//! protection and a deferred-write transaction layer.
//!
//! Every backend implements one [`Store`](store::Store) contract: get/set
//! with normalized expiry, content-hash CAS tokens, insert-if-absent,
//! counters, multi-key variants and namespaced collections. On top of the
//! adapters sit the buffering wrappers: [`Buffered`](buffered::Buffered)
//! gives request-scoped read caching with immediate writes, while
//! [`Transactional`](buffered::Transactional) defers writes until an
//! explicit commit, folding redundant operations and replaying them in
//! conflict-risk order with best-effort rollback.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kvstash::{MemoryStore, Store, StoreExt, Transactional, Expiry, StorageValue};
//!
//! # async fn example() -> kvstash::Result<()> {
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let cache = Transactional::new(store);
//!
//! cache.begin();
//! cache.set("greeting", StorageValue::from("hello"), Expiry::from(300)).await?;
//! cache.increment("visits", 1, 1, Expiry::Never).await?;
//! cache.commit().await?;
//!
//! let greeting = cache.get_value("greeting").await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod buffered;
pub mod config;
pub mod error;
pub mod expiry;
pub mod logging;
pub mod store;
pub mod value;

pub use adapters::{FilesystemStore, MemoryStore, PostgresStore};
pub use buffered::{Buffered, Transaction, Transactional};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use expiry::{EarlyExpiration, Expiry};
pub use logging::init_structured_logging;
pub use store::{Lookup, LookupState, Store, StoreExt};
pub use value::StorageValue;
