use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use crate::validation::ValidationReport;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] DieselError),

    #[error("connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("snapshot failed validation with {} error(s)", .0.errors.len())]
    Validation(ValidationReport),

    #[error("unsafe database path: {0}")]
    UnsafePath(String),

    #[error("snapshot version {found} is newer than the latest known version {latest}")]
    UnsupportedVersion { found: i64, latest: i64 },

    #[error("database swap failed: {0}")]
    Swap(String),

    #[error("database handle is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    /// Lock and serialization failures surface to the caller as-is; they are
    /// not retried inside the store.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(DieselError::DatabaseError(kind, info)) => {
                matches!(kind, DatabaseErrorKind::SerializationFailure)
                    || info.message().contains("deadlock detected")
                    || info.message().contains("database is locked")
            }
            Self::Pool(_) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::Database(DieselError::NotFound)
        )
    }
}
