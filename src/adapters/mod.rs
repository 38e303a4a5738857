//! # Backend Adapters
//!
//! Concrete [`Store`](crate::store::Store) implementations. Each adapter is
//! mechanical CRUD against its backend plus the shared CAS/expiry protocol:
//! content-hash tokens, probabilistic early expiration on reads, and
//! expired-means-absent write semantics.

pub mod filesystem;
pub mod memory;
pub mod postgres;

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
pub use postgres::PostgresStore;
