//! Lock error types.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the lock store.
///
/// Both variants mean the lock state is unknown, so callers must treat them
/// as "not acquired".
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock store could not be reached or rejected the command.
    #[error("Lock store unavailable: {0}")]
    Unavailable(String),

    /// The lock store did not answer in time.
    #[error("Lock store timed out after {0:?}")]
    Timeout(Duration),
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::Unavailable(err.to_string())
    }
}

/// Result type for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;
