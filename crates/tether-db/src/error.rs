//! # Database Error Types
//!
//! ```text
//!   sqlx::Error / MigrateError
//!        │
//!        ▼
//!   DbError ──► SyncError::DatabaseError      (tether-sync)
//!        │        ├── cache reads: logged, treated as a miss
//!        │        └── queue writes: returned, in-memory queue untouched
//!        │
//!        └─ CorruptRow ──► SyncError::InvalidOperation
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A `UNIQUE` or `PRIMARY KEY` constraint rejected a write, e.g. an
    /// operation id or `seq` inserted twice.
    #[error("Duplicate value for {table}.{column}")]
    Duplicate { table: String, column: String },

    /// A stored row no longer decodes into a domain value: unknown
    /// table/kind/state text, or a payload that is not JSON.
    #[error("Corrupt row {id}: {reason}")]
    CorruptRow { id: String, reason: String },

    #[error("Could not open database: {0}")]
    Open(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Query failed: {0}")]
    Query(String),

    /// Every pooled connection stayed busy past the acquire timeout.
    #[error("Database busy")]
    Busy,

    #[error("Database is closed")]
    Closed,

    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn corrupt(id: impl Into<String>, reason: impl ToString) -> Self {
        DbError::CorruptRow {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn open(err: impl ToString) -> Self {
        DbError::Open(err.to_string())
    }
}

/// SQLite reports constraint failures as text:
/// `UNIQUE constraint failed: sync_operations.seq`.
fn duplicate_from_message(msg: &str) -> Option<DbError> {
    let target = msg
        .strip_prefix("UNIQUE constraint failed: ")
        .or_else(|| msg.strip_prefix("PRIMARY KEY constraint failed: "))?;
    // Composite keys list every column; the first names the table.
    let first = target.split(", ").next().unwrap_or(target);
    let (table, column) = first.split_once('.').unwrap_or(("", first));
    Some(DbError::Duplicate {
        table: table.to_string(),
        column: column.to_string(),
    })
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("row", "unknown"),
            sqlx::Error::Database(db_err) => duplicate_from_message(db_err.message())
                .unwrap_or_else(|| DbError::Query(db_err.message().to_string())),
            sqlx::Error::PoolTimedOut => DbError::Busy,
            sqlx::Error::PoolClosed => DbError::Closed,
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::Migration(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_message_parsing() {
        match duplicate_from_message("UNIQUE constraint failed: sync_operations.seq") {
            Some(DbError::Duplicate { table, column }) => {
                assert_eq!(table, "sync_operations");
                assert_eq!(column, "seq");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(duplicate_from_message("no such table: kv_store").is_none());
    }
}
