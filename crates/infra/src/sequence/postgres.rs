//! Postgres-backed sequence allocator.
//!
//! Allocation is a single upsert on the `sequences` table:
//!
//! ```sql
//! INSERT INTO sequences (name, last_value) VALUES ($1, $2)
//! ON CONFLICT (name) DO UPDATE SET last_value = sequences.last_value + 1
//! RETURNING last_value
//! ```
//!
//! The upsert takes a row lock on the sequence row that is held until the
//! surrounding transaction ends, so concurrent callers for the same name queue
//! behind each other and each sees the previous caller's committed value. Two
//! first-time callers racing on the insert are resolved by the primary key:
//! the loser waits and then takes the update branch. A rolled-back transaction
//! leaves the counter untouched.
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | `SequenceError` |
//! |------------|----------|-----------------|
//! | Database (numeric out of range) | `22003` | `AllocationFailed` (sequence exhausted) |
//! | Database (serialization / deadlock) | `40001` / `40P01` | `AllocationFailed` |
//! | Database (other) | any | `AllocationFailed` |
//! | PoolClosed, Io, PoolTimedOut, ... | n/a | `AllocationFailed` |

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, instrument, warn};

use super::r#trait::{
    check_initial_value, validate_request, SequenceAllocator, SequenceError, SequenceName,
};
use crate::db::{pg_codes::*, sql_state};

/// Sequence allocator persisted in Postgres; safe across processes.
#[derive(Debug, Clone)]
pub struct PostgresSequenceAllocator {
    pool: Arc<PgPool>,
}

impl PostgresSequenceAllocator {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Allocate in a transaction of its own; the value is issued at commit.
    #[instrument(skip(self), fields(sequence = %name), err)]
    pub async fn allocate(
        &self,
        name: &SequenceName,
        initial_value: i64,
    ) -> Result<i64, SequenceError> {
        check_initial_value(initial_value)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let value = match allocate_in_tx(&mut tx, name, initial_value).await {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "rolling back sequence allocation");
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(value, "allocated sequence value");
        Ok(value)
    }
}

#[async_trait]
impl SequenceAllocator for PostgresSequenceAllocator {
    async fn next_value(&self, name: &str, initial_value: i64) -> Result<i64, SequenceError> {
        let name = validate_request(name, initial_value)?;
        self.allocate(&name, initial_value).await
    }
}

/// Allocate the next value inside a caller-owned transaction.
///
/// The row lock is held until `tx` commits or rolls back, and the value is
/// only issued if `tx` commits. Used when the value must be persisted
/// atomically with other writes (e.g. an invoice number).
pub async fn allocate_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    name: &SequenceName,
    initial_value: i64,
) -> Result<i64, SequenceError> {
    check_initial_value(initial_value)?;
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO sequences (name, last_value)
        VALUES ($1, $2)
        ON CONFLICT (name)
        DO UPDATE SET last_value = sequences.last_value + 1
        RETURNING last_value
        "#,
    )
    .bind(name.as_str())
    .bind(initial_value)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("allocate", e))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SequenceError {
    let msg = match sql_state(&err).as_deref() {
        Some(NUMERIC_VALUE_OUT_OF_RANGE) => format!("sequence exhausted in {operation}"),
        Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => {
            format!("concurrent allocation conflict in {operation}: {err}")
        }
        _ => match &err {
            sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
            sqlx::Error::PoolTimedOut => format!("timed out acquiring connection in {operation}"),
            _ => format!("sqlx error in {operation}: {err}"),
        },
    };
    SequenceError::AllocationFailed(msg)
}
