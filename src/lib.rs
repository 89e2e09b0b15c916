//! # Entity Store - Unified Entity Persistence
//!
//! One identity scheme, one filter vocabulary, one ordering convention and
//! one pagination contract over two very different backing stores.
//!
//! Entity Store provides:
//! - Self-describing uids that encode type and ancestry
//! - A hierarchical, eventually consistent document store with cursor paging
//! - A SQLite-backed relational store with offset paging and upserts
//! - Subquery limiting with in-memory post-filtering
//! - A retrying, transactional connection manager
//! - A write lifecycle with before/after hooks

pub mod uid;
pub mod value;
pub mod entity;
pub mod query;
pub mod pagination;
pub mod storage;
pub mod repository;
pub mod config;
pub mod ui;

// Re-exports for convenient access
pub use uid::{Kinded, Uid};
pub use value::{Properties, PropertyType, Value};
pub use entity::{BackendKind, Entity, EntityMeta, EntitySchema, Record};
pub use query::{Filter, FilterOp, Limit, Order, Query, QueryOutcome};
pub use pagination::{Cursor, CursorResult};
pub use storage::{DatastoreBackend, SqliteStore, StorageBackend};
pub use repository::{Registry, Repository};

/// Result type alias for entity store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for entity store operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid uid: {0}")]
    InvalidUid(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transient storage failure after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Storage error: {0}")]
    Storage(rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Hook rejected write: {0}")]
    Hook(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// Coarse error categories callers map failures onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input. Retrying won't help.
    Validation,
    /// The store was unavailable and retries ran out.
    Transient,
    /// A unique value or uid is already taken.
    Conflict,
    /// Any other storage failure.
    Storage,
    /// A bug or an unsupported call.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidUid(_)
            | Error::Validation(_)
            | Error::PermissionDenied(_)
            | Error::Hook(_)
            | Error::Json(_) => ErrorKind::Validation,
            Error::Transient { .. } => ErrorKind::Transient,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Storage(_) | Error::Io(_) => ErrorKind::Storage,
            Error::Unsupported(_) => ErrorKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi;

        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                Error::Conflict(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Validation(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => Error::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_unique_violation_is_conflict() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (name TEXT UNIQUE)", []).unwrap();
        conn.execute("INSERT INTO t (name) VALUES ('a')", []).unwrap();
        let err: Error = conn
            .execute("INSERT INTO t (name) VALUES ('a')", [])
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_not_null_violation_is_validation() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (name TEXT NOT NULL)", []).unwrap();
        let err: Error = conn
            .execute("INSERT INTO t (name) VALUES (NULL)", [])
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_other_failures_are_storage() {
        let conn = Connection::open_in_memory().unwrap();
        let err: Error = conn.execute("SELECT * FROM missing", []).unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
