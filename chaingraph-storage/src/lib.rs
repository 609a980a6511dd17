//! ScyllaDB/Cassandra implementations of the chaingraph storage gateways.
//!
//! One [`session::StoreSession`] per keyspace; [`raw::ScyllaRawStore`] reads
//! the append-only raw tables, [`transformed::ScyllaTransformedStore`]
//! serves the bootstrap reads and the grouped, retried batch writes of the
//! delta updater.

pub mod raw;
pub mod retry;
pub mod schema;
pub mod session;
pub mod transformed;

mod values;

pub use raw::ScyllaRawStore;
pub use session::StoreSession;
pub use transformed::ScyllaTransformedStore;

use chaingraph_common::storage::StorageError;
use scylla::transport::errors::{DbError, QueryError};

/// Maps driver errors onto the engine's error taxonomy. Timeouts and
/// overload conditions stay retryable, everything schema-shaped is fatal.
pub(crate) fn map_query_error(err: QueryError) -> StorageError {
    match err {
        QueryError::DbError(DbError::WriteTimeout { .. }, msg) => StorageError::WriteTimeout(msg),
        QueryError::DbError(DbError::ReadTimeout { .. }, msg) |
        QueryError::DbError(DbError::Unavailable { .. }, msg) |
        QueryError::DbError(DbError::Overloaded, msg) |
        QueryError::DbError(DbError::TruncateError, msg) => StorageError::Unavailable(msg),
        QueryError::DbError(DbError::Invalid, msg) |
        QueryError::DbError(DbError::SyntaxError, msg) => StorageError::WriteRejected(msg),
        QueryError::DbError(DbError::AlreadyExists { .. }, msg) => StorageError::Corrupt(msg),
        QueryError::TimeoutError | QueryError::RequestTimeout(_) => {
            StorageError::WriteTimeout("request timed out".into())
        }
        QueryError::IoError(e) => StorageError::Unavailable(e.to_string()),
        other => StorageError::Unexpected(other.to_string()),
    }
}

pub(crate) fn map_parse_error(err: impl std::fmt::Display) -> StorageError {
    StorageError::Corrupt(err.to_string())
}
