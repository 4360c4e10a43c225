use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::error::ErrorClass;
use super::model::{
    ConflictResolution, FileConflict, SyncFolderConfig, SyncStatus, UnknownVariant, VersionInfo,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data directory is unavailable")]
    MissingDataDir,
    #[error("corrupt column: {0}")]
    Decode(#[from] UnknownVariant),
    #[error("corrupt exclude patterns: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} already exists")]
    Duplicate(String),
    #[error("{0} not found")]
    NotFound(String),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Duplicate(_) => ErrorClass::Validation,
            StoreError::NotFound(_) => ErrorClass::NotFound,
            _ => ErrorClass::FatalStorage,
        }
    }
}

/// SQLite-backed durable state: folders, queued operations, conflicts and checkpoints.
#[derive(Clone)]
pub struct SyncStore {
    pub(crate) pool: SqlitePool,
}

impl SyncStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .synchronous(SqliteSynchronous::Full);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    /// Private in-memory database. A single connection keeps every query on the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_folder(&self, folder: &SyncFolderConfig) -> Result<(), StoreError> {
        let patterns = serde_json::to_string(&folder.exclude_patterns)?;
        let result = sqlx::query(
            "INSERT INTO sync_folders (
                id, device_id, local_root, remote_path, sync_type, auto_sync,
                conflict_policy, exclude_patterns, last_sync, status, last_error, created
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(&folder.id)
        .bind(&folder.device_id)
        .bind(&folder.local_root)
        .bind(&folder.remote_path)
        .bind(folder.sync_type.as_str())
        .bind(if folder.auto_sync { 1 } else { 0 })
        .bind(folder.conflict_policy.as_str())
        .bind(patterns)
        .bind(folder.last_sync)
        .bind(folder.status.as_str())
        .bind(&folder.last_error)
        .bind(super::model::now_millis())
        .execute(&self.pool)
        .await;
        map_unique(result, || format!("remote path {}", folder.remote_path))?;
        Ok(())
    }

    /// Rewrites the user-editable columns. Status and sync bookkeeping are left alone.
    pub async fn update_folder(&self, folder: &SyncFolderConfig) -> Result<bool, StoreError> {
        let patterns = serde_json::to_string(&folder.exclude_patterns)?;
        let result = sqlx::query(
            "UPDATE sync_folders
             SET local_root = ?2, remote_path = ?3, sync_type = ?4, auto_sync = ?5,
                 conflict_policy = ?6, exclude_patterns = ?7
             WHERE id = ?1",
        )
        .bind(&folder.id)
        .bind(&folder.local_root)
        .bind(&folder.remote_path)
        .bind(folder.sync_type.as_str())
        .bind(if folder.auto_sync { 1 } else { 0 })
        .bind(folder.conflict_policy.as_str())
        .bind(patterns)
        .execute(&self.pool)
        .await;
        let result = map_unique(result, || format!("remote path {}", folder.remote_path))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_folder(&self, id: &str) -> Result<Option<SyncFolderConfig>, StoreError> {
        let row = sqlx::query(&format!("{FOLDER_SELECT} WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    pub async fn find_folder_by_remote(
        &self,
        device_id: &str,
        remote_path: &str,
    ) -> Result<Option<SyncFolderConfig>, StoreError> {
        let row = sqlx::query(&format!(
            "{FOLDER_SELECT} WHERE device_id = ?1 AND remote_path = ?2"
        ))
        .bind(device_id)
        .bind(remote_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(folder_from_row).transpose()
    }

    pub async fn list_folders(&self) -> Result<Vec<SyncFolderConfig>, StoreError> {
        let rows = sqlx::query(&format!("{FOLDER_SELECT} ORDER BY created ASC, id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(folder_from_row).collect()
    }

    /// Removes the folder and everything keyed by it in one transaction.
    pub async fn delete_folder(&self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in ["ops_queue", "conflicts", "checkpoints"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE folder_id = ?1"))
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM sync_folders WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_folder_status(
        &self,
        id: &str,
        status: SyncStatus,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE sync_folders SET status = ?2, last_error = ?3 WHERE id = ?1")
                .bind(id)
                .bind(status.as_str())
                .bind(last_error)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Compare-and-set `idle|error -> syncing`. Exactly one concurrent caller wins.
    pub async fn try_begin_pass(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sync_folders SET status = 'syncing'
             WHERE id = ?1 AND status IN ('idle', 'error')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Leaves `syncing`; a folder paused mid-pass keeps its `paused` status.
    pub async fn finish_pass(
        &self,
        id: &str,
        error: Option<&str>,
        now_ms: i64,
    ) -> Result<bool, StoreError> {
        let result = match error {
            None => {
                sqlx::query(
                    "UPDATE sync_folders SET status = 'idle', last_error = NULL, last_sync = ?2
                     WHERE id = ?1 AND status = 'syncing'",
                )
                .bind(id)
                .bind(now_ms)
                .execute(&self.pool)
                .await?
            }
            Some(message) => {
                sqlx::query(
                    "UPDATE sync_folders SET status = 'error', last_error = ?2
                     WHERE id = ?1 AND status = 'syncing'",
                )
                .bind(id)
                .bind(message)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    /// Leaves `syncing` without recording a finished pass, for cancelled passes.
    pub async fn release_pass(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE sync_folders SET status = 'idle' WHERE id = ?1 AND status = 'syncing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn recover_syncing_folders(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE sync_folders SET status = 'idle' WHERE status = 'syncing'")
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn upsert_conflict(&self, conflict: &FileConflict) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO conflicts (
                folder_id, path, conflict_type,
                local_exists, local_size, local_modified, local_preview,
                remote_exists, remote_size, remote_modified, remote_preview,
                detected_at, resolution
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(folder_id, path) DO UPDATE SET
                conflict_type = excluded.conflict_type,
                local_exists = excluded.local_exists,
                local_size = excluded.local_size,
                local_modified = excluded.local_modified,
                local_preview = excluded.local_preview,
                remote_exists = excluded.remote_exists,
                remote_size = excluded.remote_size,
                remote_modified = excluded.remote_modified,
                remote_preview = excluded.remote_preview,
                detected_at = excluded.detected_at,
                resolution = excluded.resolution",
        )
        .bind(&conflict.folder_id)
        .bind(&conflict.path)
        .bind(conflict.conflict_type.as_str())
        .bind(if conflict.local.exists { 1 } else { 0 })
        .bind(conflict.local.size.map(|size| size as i64))
        .bind(conflict.local.modified)
        .bind(&conflict.local.preview)
        .bind(if conflict.remote.exists { 1 } else { 0 })
        .bind(conflict.remote.size.map(|size| size as i64))
        .bind(conflict.remote.modified)
        .bind(&conflict.remote.preview)
        .bind(conflict.detected_at)
        .bind(conflict.resolution.map(|resolution| resolution.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_conflict(
        &self,
        folder_id: &str,
        path: &str,
    ) -> Result<Option<FileConflict>, StoreError> {
        let row = sqlx::query(&format!(
            "{CONFLICT_SELECT} WHERE folder_id = ?1 AND path = ?2"
        ))
        .bind(folder_id)
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conflict_from_row).transpose()
    }

    pub async fn list_conflicts(&self, folder_id: &str) -> Result<Vec<FileConflict>, StoreError> {
        let rows = sqlx::query(&format!(
            "{CONFLICT_SELECT} WHERE folder_id = ?1 ORDER BY path ASC"
        ))
        .bind(folder_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conflict_from_row).collect()
    }

    /// Conflicts whose chosen resolution was recorded but not fully applied.
    pub async fn list_resolved_conflicts(&self) -> Result<Vec<FileConflict>, StoreError> {
        let rows = sqlx::query(&format!(
            "{CONFLICT_SELECT} WHERE resolution IS NOT NULL ORDER BY folder_id, path"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(conflict_from_row).collect()
    }

    pub async fn set_conflict_resolution(
        &self,
        folder_id: &str,
        path: &str,
        resolution: ConflictResolution,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE conflicts SET resolution = ?3 WHERE folder_id = ?1 AND path = ?2",
        )
        .bind(folder_id)
        .bind(path)
        .bind(resolution.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_conflict(&self, folder_id: &str, path: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM conflicts WHERE folder_id = ?1 AND path = ?2")
            .bind(folder_id)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stores `modified` unless a newer checkpoint already exists.
    pub async fn upsert_checkpoint(
        &self,
        folder_id: &str,
        path: &str,
        modified: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO checkpoints (folder_id, path, modified)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(folder_id, path) DO UPDATE SET
                modified = MAX(checkpoints.modified, excluded.modified)",
        )
        .bind(folder_id)
        .bind(path)
        .bind(modified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_checkpoint(
        &self,
        folder_id: &str,
        path: &str,
    ) -> Result<Option<i64>, StoreError> {
        let row =
            sqlx::query("SELECT modified FROM checkpoints WHERE folder_id = ?1 AND path = ?2")
                .bind(folder_id)
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|row| row.try_get("modified")).transpose()?)
    }

    pub async fn list_checkpoints(
        &self,
        folder_id: &str,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let rows = sqlx::query("SELECT path, modified FROM checkpoints WHERE folder_id = ?1")
            .bind(folder_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get("path")?, row.try_get("modified")?);
        }
        Ok(out)
    }

    pub async fn delete_checkpoint(&self, folder_id: &str, path: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM checkpoints WHERE folder_id = ?1 AND path = ?2")
            .bind(folder_id)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const FOLDER_SELECT: &str = "SELECT id, device_id, local_root, remote_path, sync_type, auto_sync,
    conflict_policy, exclude_patterns, last_sync, status, last_error FROM sync_folders";

const CONFLICT_SELECT: &str = "SELECT folder_id, path, conflict_type,
    local_exists, local_size, local_modified, local_preview,
    remote_exists, remote_size, remote_modified, remote_preview,
    detected_at, resolution FROM conflicts";

fn folder_from_row(row: &SqliteRow) -> Result<SyncFolderConfig, StoreError> {
    let sync_type: String = row.try_get("sync_type")?;
    let policy: String = row.try_get("conflict_policy")?;
    let status: String = row.try_get("status")?;
    let patterns: String = row.try_get("exclude_patterns")?;
    let auto_sync: i64 = row.try_get("auto_sync")?;
    Ok(SyncFolderConfig {
        id: row.try_get("id")?,
        device_id: row.try_get("device_id")?,
        local_root: row.try_get("local_root")?,
        remote_path: row.try_get("remote_path")?,
        sync_type: sync_type.parse()?,
        auto_sync: auto_sync != 0,
        conflict_policy: policy.parse()?,
        exclude_patterns: serde_json::from_str(&patterns)?,
        last_sync: row.try_get("last_sync")?,
        status: status.parse()?,
        last_error: row.try_get("last_error")?,
    })
}

fn conflict_from_row(row: &SqliteRow) -> Result<FileConflict, StoreError> {
    let conflict_type: String = row.try_get("conflict_type")?;
    let resolution: Option<String> = row.try_get("resolution")?;
    Ok(FileConflict {
        folder_id: row.try_get("folder_id")?,
        path: row.try_get("path")?,
        conflict_type: conflict_type.parse()?,
        local: version_from_row(row, "local")?,
        remote: version_from_row(row, "remote")?,
        detected_at: row.try_get("detected_at")?,
        resolution: resolution.map(|value| value.parse()).transpose()?,
    })
}

fn version_from_row(row: &SqliteRow, side: &str) -> Result<VersionInfo, StoreError> {
    let exists: i64 = row.try_get(format!("{side}_exists").as_str())?;
    let size: Option<i64> = row.try_get(format!("{side}_size").as_str())?;
    Ok(VersionInfo {
        exists: exists != 0,
        size: size.map(|size| size.max(0) as u64),
        modified: row.try_get(format!("{side}_modified").as_str())?,
        preview: row.try_get(format!("{side}_preview").as_str())?,
    })
}

fn map_unique<T>(
    result: Result<T, sqlx::Error>,
    what: impl FnOnce() -> String,
) -> Result<T, StoreError> {
    match result {
        Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
            Err(StoreError::Duplicate(what()))
        }
        other => Ok(other?),
    }
}

fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("nasync").join("sync.db"))
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
