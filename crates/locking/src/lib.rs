//! Lock Coordinator for short-lived, key-based mutual exclusion.
//!
//! A lock is a key set in a shared store only if absent, with a fixed TTL.
//! There is no fencing token: a holder that stalls past the TTL can race the
//! next acquirer, so critical sections must stay well below the TTL.

pub mod coordinator;
pub mod error;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use coordinator::{LockConfig, LockCoordinator, LockGuard, MIN_LOCK_TTL};
pub use error::{LockError, Result};
pub use memory::InMemoryLockStore;
pub use redis_store::RedisLockStore;
pub use store::LockStore;
