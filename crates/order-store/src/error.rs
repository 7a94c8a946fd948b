use thiserror::Error;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An order with this idempotency key has already been committed.
    #[error("Duplicate idempotency key: {0}")]
    DuplicateIdempotencyKey(String),

    /// An order with this external reference already exists.
    #[error("Duplicate order reference: {0}")]
    DuplicateReference(String),

    /// A payment is already registered for this order or gateway key.
    #[error("Duplicate payment: {0}")]
    DuplicatePayment(String),

    /// The requested record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A conditional transition was requested that the state machine forbids.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// A stored value could not be mapped back onto the domain model.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// A value does not fit the stored column.
    #[error("Value out of range: {0}")]
    OutOfRange(String),

    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for failures a caller may retry as-is.
    ///
    /// Constraint violations are permanent: the same row will be refused again.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(sqlx::Error::Database(db)) => {
                matches!(db.kind(), sqlx::error::ErrorKind::Other)
            }
            StoreError::Database(_) => true,
            _ => false,
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!StoreError::OutOfRange("quantity".into()).is_transient());
        assert!(!StoreError::DuplicateReference("ORD-1".into()).is_transient());
    }
}
