//! # Buffered and Transactional Wrappers
//!
//! The write-buffering layer over any [`Store`](crate::store::Store):
//!
//! - [`Buffer`]: pinned in-memory staging store with tombstone support
//! - [`Defer`]: per-key write queue with folding, risk-ordered replay and
//!   best-effort rollback
//! - [`Transaction`]: a Store view where reads prefer uncommitted local
//!   state and writes are deferred until commit
//! - [`Buffered`]: auto-committing wrapper giving request-scoped read
//!   caching without deferred semantics
//! - [`Transactional`]: explicit, nestable begin/commit/rollback over a
//!   stack of transactions

mod buffer;
mod buffered;
mod defer;
mod transaction;
mod transactional;

pub use buffer::Buffer;
pub use buffered::Buffered;
pub(crate) use defer::Defer;
pub use transaction::Transaction;
pub use transactional::Transactional;
