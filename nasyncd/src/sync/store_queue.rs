use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::model::{NewOperation, OperationState, QueuedOperation};
use super::store::{StoreError, SyncStore};

const OP_SELECT: &str = "SELECT id, folder_id, kind, path, dest_path, modified, size, attempt,
    state, retry_at, last_error, enqueued_at FROM ops_queue";

impl SyncStore {
    /// Appends an operation, or refreshes the newest queued operation for the same path
    /// when it has the same kind and target and is not in flight. Returns the row id.
    pub async fn insert_op(&self, op: &NewOperation, now_ms: i64) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let newest = sqlx::query(&format!(
            "{OP_SELECT} WHERE folder_id = ?1 AND path = ?2 ORDER BY id DESC LIMIT 1"
        ))
        .bind(&op.folder_id)
        .bind(&op.path)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = newest.as_ref() {
            let existing = op_from_row(row)?;
            if existing.kind == op.kind
                && existing.dest_path == op.dest_path
                && existing.state != OperationState::InFlight
            {
                sqlx::query("UPDATE ops_queue SET modified = ?2, size = ?3 WHERE id = ?1")
                    .bind(existing.id)
                    .bind(op.modified.or(existing.modified))
                    .bind(op.size.or(existing.size).map(|size| size as i64))
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                return Ok(existing.id);
            }
        }

        let result = sqlx::query(
            "INSERT INTO ops_queue (folder_id, kind, path, dest_path, modified, size, attempt, state, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'pending', ?7)",
        )
        .bind(&op.folder_id)
        .bind(op.kind.as_str())
        .bind(&op.path)
        .bind(&op.dest_path)
        .bind(op.modified)
        .bind(op.size.map(|size| size as i64))
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_op(&self, id: i64) -> Result<Option<QueuedOperation>, StoreError> {
        let row = sqlx::query(&format!("{OP_SELECT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(op_from_row).transpose()
    }

    /// Leases the oldest due pending operation of the folder whose paths are not touched
    /// by any earlier queued operation, flipping it to in-flight.
    pub async fn lease_next_op(
        &self,
        folder_id: &str,
        now_ms: i64,
    ) -> Result<Option<QueuedOperation>, StoreError> {
        loop {
            let row = sqlx::query(
                "SELECT o.id FROM ops_queue o
                 WHERE o.folder_id = ?1
                   AND o.state = 'pending'
                   AND (o.retry_at IS NULL OR o.retry_at <= ?2)
                   AND NOT EXISTS (
                       SELECT 1 FROM ops_queue e
                       WHERE e.folder_id = o.folder_id
                         AND e.id < o.id
                         AND (e.path = o.path
                              OR e.dest_path = o.path
                              OR e.path = o.dest_path
                              OR e.dest_path = o.dest_path)
                   )
                 ORDER BY o.id ASC
                 LIMIT 1",
            )
            .bind(folder_id)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else {
                return Ok(None);
            };
            let id: i64 = row.try_get("id")?;

            let leased = sqlx::query(
                "UPDATE ops_queue SET state = 'in_flight' WHERE id = ?1 AND state = 'pending'",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            if leased.rows_affected() == 1 {
                return self.get_op(id).await;
            }
        }
    }

    pub async fn delete_op(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM ops_queue WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes the operation unless a worker currently holds it.
    pub async fn delete_idle_op(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM ops_queue WHERE id = ?1 AND state != 'in_flight'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_op_state(
        &self,
        id: i64,
        state: OperationState,
        attempt: u32,
        retry_at: Option<i64>,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE ops_queue SET state = ?2, attempt = ?3, retry_at = ?4, last_error = ?5
             WHERE id = ?1",
        )
        .bind(id)
        .bind(state.as_str())
        .bind(i64::from(attempt))
        .bind(retry_at)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn release_op(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE ops_queue SET state = 'pending' WHERE id = ?1 AND state = 'in_flight'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// User retry: back to pending with a fresh attempt budget.
    pub async fn reset_op(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE ops_queue
             SET state = 'pending', attempt = 0, retry_at = NULL, last_error = NULL
             WHERE id = ?1 AND state IN ('pending', 'needs_attention')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_ops(&self, folder_id: &str) -> Result<Vec<QueuedOperation>, StoreError> {
        let rows = sqlx::query(&format!("{OP_SELECT} WHERE folder_id = ?1 ORDER BY id ASC"))
            .bind(folder_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(op_from_row).collect()
    }

    pub async fn list_all_ops(&self) -> Result<Vec<QueuedOperation>, StoreError> {
        let rows = sqlx::query(&format!("{OP_SELECT} ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(op_from_row).collect()
    }

    pub async fn recover_in_flight_ops(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE ops_queue SET state = 'pending' WHERE state = 'in_flight'")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

fn op_from_row(row: &SqliteRow) -> Result<QueuedOperation, StoreError> {
    let kind: String = row.try_get("kind")?;
    let state: String = row.try_get("state")?;
    let size: Option<i64> = row.try_get("size")?;
    let attempt: i64 = row.try_get("attempt")?;
    Ok(QueuedOperation {
        id: row.try_get("id")?,
        folder_id: row.try_get("folder_id")?,
        kind: kind.parse()?,
        path: row.try_get("path")?,
        dest_path: row.try_get("dest_path")?,
        modified: row.try_get("modified")?,
        size: size.map(|size| size.max(0) as u64),
        attempt: attempt.clamp(0, i64::from(u32::MAX)) as u32,
        state: state.parse()?,
        retry_at: row.try_get("retry_at")?,
        last_error: row.try_get("last_error")?,
        enqueued_at: row.try_get("enqueued_at")?,
    })
}
