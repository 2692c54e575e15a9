//! # Sync Operation Repository
//!
//! Persistence for the mutation queue.
//!
//! ## Write-Ahead Queue
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Data service write (e.g. update_profile)                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  INSERT INTO sync_operations (..., state = 'pending')                  │
//! │       │          ← row is durable before the caller gets an id         │
//! │       ▼                                                                 │
//! │  Sync service attempt                                                   │
//! │       │                                                                 │
//! │       ├── ok:        UPDATE ... state = 'completed', completed_at      │
//! │       ├── retryable: UPDATE ... state = 'pending', attempts + 1,       │
//! │       │                         next_attempt_at = now + backoff        │
//! │       └── terminal:  UPDATE ... state = 'failed', last_error           │
//! │                                                                         │
//! │  clear_completed: DELETE ... WHERE state = 'completed'                 │
//! │  discard_failed:  DELETE ... WHERE state = 'failed'                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Rows are decoded one at a time so a single corrupt row cannot hide
//! the rest of the queue; see [`OperationScan`].

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use tether_core::{OperationKind, OperationState, SyncOperation, SyncTable};

use crate::error::{DbError, DbResult};

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: String,
    seq: i64,
    table_name: String,
    kind: String,
    resource_id: Option<String>,
    payload: String,
    state: String,
    attempts: i64,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    attempted_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl OperationRow {
    fn into_operation(self) -> DbResult<SyncOperation> {
        let corrupt = |reason: String| DbError::corrupt(self.id.clone(), reason);

        let table: SyncTable = self.table_name.parse().map_err(|e| corrupt(format!("{e}")))?;
        let kind: OperationKind = self.kind.parse().map_err(|e| corrupt(format!("{e}")))?;
        let state: OperationState = self.state.parse().map_err(|e| corrupt(format!("{e}")))?;
        let payload = serde_json::from_str(&self.payload)
            .map_err(|e| corrupt(format!("payload is not JSON: {e}")))?;
        let attempts =
            u32::try_from(self.attempts).map_err(|_| corrupt(format!("attempts = {}", self.attempts)))?;

        Ok(SyncOperation {
            id: self.id,
            seq: self.seq,
            table,
            kind,
            resource_id: self.resource_id,
            payload,
            state,
            attempts,
            last_error: self.last_error,
            created_at: self.created_at,
            attempted_at: self.attempted_at,
            next_attempt_at: self.next_attempt_at,
            completed_at: self.completed_at,
        })
    }
}

/// A persisted row that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptOperation {
    pub id: String,
    pub seq: i64,
    pub reason: String,
}

/// Result of reading the whole queue.
#[derive(Debug, Default)]
pub struct OperationScan {
    /// Decoded operations in `seq` order.
    pub operations: Vec<SyncOperation>,
    pub corrupt: Vec<CorruptOperation>,
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the `sync_operations` table.
#[derive(Debug, Clone)]
pub struct SyncOperationRepository {
    pool: SqlitePool,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, seq, table_name, kind, resource_id, payload, state, attempts,
           last_error, created_at, attempted_at, next_attempt_at, completed_at
    FROM sync_operations
"#;

impl SyncOperationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SyncOperationRepository { pool }
    }

    /// Persists a new operation.
    pub async fn insert(&self, op: &SyncOperation) -> DbResult<()> {
        let payload = serde_json::to_string(&op.payload).map_err(|e| DbError::corrupt(&op.id, e))?;

        debug!(
            op_id = %op.id,
            seq = op.seq,
            table = %op.table,
            kind = %op.kind,
            "Persisting sync operation"
        );

        sqlx::query(
            r#"
            INSERT INTO sync_operations (
                id, seq, table_name, kind, resource_id, payload, state,
                attempts, last_error, created_at, attempted_at, next_attempt_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&op.id)
        .bind(op.seq)
        .bind(op.table)
        .bind(op.kind)
        .bind(&op.resource_id)
        .bind(payload)
        .bind(op.state)
        .bind(i64::from(op.attempts))
        .bind(&op.last_error)
        .bind(op.created_at)
        .bind(op.attempted_at)
        .bind(op.next_attempt_at)
        .bind(op.completed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Writes the mutable fields of an existing operation.
    pub async fn update(&self, op: &SyncOperation) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_operations SET
                state = ?2,
                attempts = ?3,
                last_error = ?4,
                attempted_at = ?5,
                next_attempt_at = ?6,
                completed_at = ?7
            WHERE id = ?1
            "#,
        )
        .bind(&op.id)
        .bind(op.state)
        .bind(i64::from(op.attempts))
        .bind(&op.last_error)
        .bind(op.attempted_at)
        .bind(op.next_attempt_at)
        .bind(op.completed_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("SyncOperation", &op.id));
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<SyncOperation>> {
        let row: Option<OperationRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(OperationRow::into_operation).transpose()
    }

    /// Reads every operation in `seq` order, separating undecodable rows.
    pub async fn scan(&self) -> DbResult<OperationScan> {
        let rows: Vec<OperationRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY seq ASC"))
            .fetch_all(&self.pool)
            .await?;

        let mut scan = OperationScan::default();
        for row in rows {
            let (id, seq) = (row.id.clone(), row.seq);
            match row.into_operation() {
                Ok(op) => scan.operations.push(op),
                Err(e) => {
                    warn!(op_id = %id, seq, error = %e, "Undecodable sync operation row");
                    scan.corrupt.push(CorruptOperation {
                        id,
                        seq,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(scan)
    }

    /// Marks an undecodable row failed without touching its other columns.
    pub async fn quarantine(&self, id: &str, reason: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE sync_operations SET state = 'failed', last_error = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns every in-flight operation to pending (crash recovery).
    pub async fn requeue_in_flight(&self) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE sync_operations SET state = 'pending' WHERE state = 'in_flight'",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Deletes completed operations. Returns the number removed.
    pub async fn delete_completed(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM sync_operations WHERE state = 'completed'")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes failed operations, quarantined rows included.
    pub async fn delete_failed(&self) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM sync_operations WHERE state = 'failed'")
            .execute(&self.pool)
            .await?;

        debug!(removed = result.rows_affected(), "Deleted failed sync operations");
        Ok(result.rows_affected())
    }

    /// Highest `seq` in the table, 0 when empty.
    pub async fn max_seq(&self) -> DbResult<i64> {
        let seq: Option<i64> = sqlx::query_scalar("SELECT MAX(seq) FROM sync_operations")
            .fetch_one(&self.pool)
            .await?;

        Ok(seq.unwrap_or(0))
    }

    pub async fn count_by_state(&self, state: OperationState) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_operations WHERE state = ?1")
            .bind(state)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// =============================================================================
// Tests
// =============================================================================
