use std::collections::HashSet;
use std::path::{Path, PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::clock::now_unix;
use super::queue::{NewWorkItem, WorkItem};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const NODE_COLUMNS: &str = "id, account_id, watcher_id, remote_node_id, remote_folder_path, \
     local_file_path, local_folder_path, file_update_at, last_uploaded_at, last_downloaded_at, \
     is_folder, is_file, upload_in_progress, download_in_progress, is_deleted";

pub const DEFAULT_AUDIT_RETENTION: i64 = 1000;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("record not found after insert: {0}")]
    MissingRecord(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
}

/// Lifecycle position of a record, derived from its columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Known locally but the remote create has not produced an id yet.
    Creating,
    Synced,
    UploadPending,
    DownloadPending,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInput {
    pub account_id: i64,
    pub watcher_id: i64,
    pub remote_node_id: Option<String>,
    pub remote_folder_path: String,
    pub local_file_path: String,
    pub local_folder_path: String,
    pub file_update_at: i64,
    pub last_uploaded_at: i64,
    pub last_downloaded_at: i64,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: i64,
    pub account_id: i64,
    pub watcher_id: i64,
    pub remote_node_id: Option<String>,
    pub remote_folder_path: String,
    pub local_file_path: String,
    pub local_folder_path: String,
    pub file_update_at: i64,
    pub last_uploaded_at: i64,
    pub last_downloaded_at: i64,
    pub kind: NodeKind,
    pub upload_in_progress: bool,
    pub download_in_progress: bool,
    pub is_deleted: bool,
}

impl NodeRecord {
    pub fn is_folder(&self) -> bool {
        self.kind == NodeKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn has_synced(&self) -> bool {
        self.last_uploaded_at > 0 || self.last_downloaded_at > 0
    }

    pub fn last_transfer_at(&self) -> i64 {
        self.last_uploaded_at.max(self.last_downloaded_at)
    }

    pub fn name(&self) -> &str {
        Path::new(&self.local_file_path)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("")
    }

    pub fn state(&self) -> NodeState {
        if self.is_deleted {
            NodeState::Deleted
        } else if self.upload_in_progress {
            NodeState::UploadPending
        } else if self.download_in_progress {
            NodeState::DownloadPending
        } else if self.remote_node_id.is_none() {
            NodeState::Creating
        } else {
            NodeState::Synced
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub id: i64,
    pub account_id: Option<i64>,
    pub context: String,
    pub message: String,
    pub created_at: i64,
}

pub struct IndexStore {
    pool: SqlitePool,
    audit_retention: i64,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            audit_retention: DEFAULT_AUDIT_RETENTION,
        }
    }

    pub fn with_audit_retention(mut self, retention: i64) -> Self {
        self.audit_retention = retention.max(1);
        self
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        tracing::info!(path = %db_path.display(), "index opened");
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_by_local_path(
        &self,
        account_id: i64,
        local_path: &str,
    ) -> Result<Option<NodeRecord>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE account_id = ?1 AND local_file_path = ?2 AND is_deleted = 0"
        ))
        .bind(account_id)
        .bind(local_path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    pub async fn get_by_remote_node_id(
        &self,
        account_id: i64,
        remote_node_id: &str,
    ) -> Result<Option<NodeRecord>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE account_id = ?1 AND remote_node_id = ?2 AND is_deleted = 0
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(account_id)
        .bind(remote_node_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(node_from_row).transpose()
    }

    /// Live records at `folder` or anywhere below it.
    pub async fn list_by_prefix(
        &self,
        account_id: i64,
        folder: &str,
    ) -> Result<Vec<NodeRecord>, IndexError> {
        let folder = folder.trim_end_matches('/');
        let prefix = format!("{folder}/");
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE account_id = ?1 AND is_deleted = 0
               AND (local_file_path = ?2 OR substr(local_file_path, 1, length(?3)) = ?3)
             ORDER BY local_file_path ASC"
        ))
        .bind(account_id)
        .bind(folder)
        .bind(&prefix)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    /// Live records of a watcher whose local path is not among `present`.
    pub async fn get_missing(
        &self,
        account_id: i64,
        watcher_id: i64,
        present: &HashSet<String>,
    ) -> Result<Vec<NodeRecord>, IndexError> {
        let candidates = serde_json::to_string(&present.iter().collect::<Vec<_>>())?;
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE account_id = ?1 AND watcher_id = ?2 AND is_deleted = 0
               AND local_file_path NOT IN (SELECT value FROM json_each(?3))
             ORDER BY local_file_path ASC"
        ))
        .bind(account_id)
        .bind(watcher_id)
        .bind(candidates)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(node_from_row).collect()
    }

    /// Drops any row stored for the path and inserts a fresh one.
    pub async fn insert_replace(&self, input: &NodeInput) -> Result<NodeRecord, IndexError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM nodes WHERE account_id = ?1 AND local_file_path = ?2")
            .bind(input.account_id)
            .bind(&input.local_file_path)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO nodes (
                account_id, watcher_id, remote_node_id, remote_folder_path,
                local_file_path, local_folder_path, file_update_at,
                last_uploaded_at, last_downloaded_at, is_folder, is_file
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(input.account_id)
        .bind(input.watcher_id)
        .bind(&input.remote_node_id)
        .bind(&input.remote_folder_path)
        .bind(&input.local_file_path)
        .bind(&input.local_folder_path)
        .bind(input.file_update_at)
        .bind(input.last_uploaded_at)
        .bind(input.last_downloaded_at)
        .bind(input.kind == NodeKind::Folder)
        .bind(input.kind == NodeKind::File)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_by_local_path(input.account_id, &input.local_file_path)
            .await?
            .ok_or_else(|| IndexError::MissingRecord(input.local_file_path.clone()))
    }

    /// The single deletion entry point: flags the record at `local_path` and
    /// every live descendant as deleted. Returns the number of rows retired.
    pub async fn mark_deleted(&self, account_id: i64, local_path: &str) -> Result<u64, IndexError> {
        let folder = local_path.trim_end_matches('/');
        let prefix = format!("{folder}/");
        let result = sqlx::query(
            "UPDATE nodes
             SET is_deleted = 1, upload_in_progress = 0, download_in_progress = 0
             WHERE account_id = ?1 AND is_deleted = 0
               AND (local_file_path = ?2 OR substr(local_file_path, 1, length(?3)) = ?3)",
        )
        .bind(account_id)
        .bind(folder)
        .bind(&prefix)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Physically removes rows already retired by [`IndexStore::mark_deleted`].
    pub async fn purge_deleted(&self, account_id: i64) -> Result<u64, IndexError> {
        let result = sqlx::query("DELETE FROM nodes WHERE account_id = ?1 AND is_deleted = 1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Claims the upload soft lock. Fails when a download holds the record.
    pub async fn set_upload_progress(&self, id: i64, active: bool) -> Result<bool, IndexError> {
        let result = if active {
            sqlx::query(
                "UPDATE nodes SET upload_in_progress = 1
                 WHERE id = ?1 AND download_in_progress = 0 AND is_deleted = 0",
            )
            .bind(id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE nodes SET upload_in_progress = 0 WHERE id = ?1")
                .bind(id)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() == 1)
    }

    /// Claims the download soft lock. Fails when an upload holds the record.
    pub async fn set_download_progress(&self, id: i64, active: bool) -> Result<bool, IndexError> {
        let result = if active {
            sqlx::query(
                "UPDATE nodes SET download_in_progress = 1
                 WHERE id = ?1 AND upload_in_progress = 0 AND is_deleted = 0",
            )
            .bind(id)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query("UPDATE nodes SET download_in_progress = 0 WHERE id = ?1")
                .bind(id)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() == 1)
    }

    pub async fn update_modified_time(&self, id: i64, file_update_at: i64) -> Result<(), IndexError> {
        sqlx::query("UPDATE nodes SET file_update_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(file_update_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_upload(
        &self,
        id: i64,
        uploaded_at: i64,
        file_update_at: i64,
    ) -> Result<(), IndexError> {
        sqlx::query(
            "UPDATE nodes
             SET last_uploaded_at = MAX(last_uploaded_at, ?2), file_update_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(uploaded_at)
        .bind(file_update_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_download(
        &self,
        id: i64,
        downloaded_at: i64,
        file_update_at: i64,
    ) -> Result<(), IndexError> {
        sqlx::query(
            "UPDATE nodes
             SET last_downloaded_at = MAX(last_downloaded_at, ?2), file_update_at = ?3
             WHERE id = ?1",
        )
        .bind(id)
        .bind(downloaded_at)
        .bind(file_update_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_remote_node_id(
        &self,
        id: i64,
        remote_node_id: &str,
        remote_folder_path: &str,
    ) -> Result<(), IndexError> {
        sqlx::query("UPDATE nodes SET remote_node_id = ?2, remote_folder_path = ?3 WHERE id = ?1")
            .bind(id)
            .bind(remote_node_id)
            .bind(remote_folder_path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears soft locks left behind by a process that died mid-transfer.
    pub async fn clear_stale_progress(&self) -> Result<u64, IndexError> {
        let result = sqlx::query(
            "UPDATE nodes SET upload_in_progress = 0, download_in_progress = 0
             WHERE upload_in_progress = 1 OR download_in_progress = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_live(&self, account_id: i64) -> Result<i64, IndexError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM nodes WHERE account_id = ?1 AND is_deleted = 0")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn enqueue_work(&self, item: &NewWorkItem) -> Result<i64, IndexError> {
        let result = sqlx::query(
            "INSERT INTO work_queue (account_id, watcher_id, file_path, root_node_id, priority, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(account_id, file_path) DO UPDATE SET
                watcher_id = excluded.watcher_id,
                root_node_id = excluded.root_node_id,
                priority = MAX(work_queue.priority, excluded.priority)",
        )
        .bind(item.account_id)
        .bind(item.watcher_id)
        .bind(&item.file_path)
        .bind(&item.root_node_id)
        .bind(item.priority)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Removes and returns the next work item; each enqueue is handed out once.
    pub async fn claim_next_work(&self) -> Result<Option<WorkItem>, IndexError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, account_id, watcher_id, file_path, root_node_id, priority, created_at
             FROM work_queue
             ORDER BY priority DESC, created_at ASC, id ASC
             LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let item = WorkItem {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            watcher_id: row.try_get("watcher_id")?,
            file_path: row.try_get("file_path")?,
            root_node_id: row.try_get("root_node_id")?,
            priority: row.try_get("priority")?,
            created_at: row.try_get("created_at")?,
        };

        sqlx::query("DELETE FROM work_queue WHERE id = ?1")
            .bind(item.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some(item))
    }

    pub async fn queue_len(&self, account_id: Option<i64>) -> Result<i64, IndexError> {
        let count: i64 = match account_id {
            Some(account_id) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM work_queue WHERE account_id = ?1")
                    .bind(account_id)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM work_queue")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count)
    }

    pub async fn record_error(
        &self,
        account_id: Option<i64>,
        context: &str,
        message: &str,
    ) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO error_log (account_id, context, message, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(account_id)
        .bind(context)
        .bind(message)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        self.trim_audit("error_log").await
    }

    pub async fn record_event(
        &self,
        account_id: Option<i64>,
        kind: &str,
        local_path: &str,
        remote_node_id: Option<&str>,
    ) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO event_log (account_id, kind, local_path, remote_node_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(account_id)
        .bind(kind)
        .bind(local_path)
        .bind(remote_node_id)
        .bind(now_unix())
        .execute(&self.pool)
        .await?;
        self.trim_audit("event_log").await
    }

    pub async fn list_errors(&self) -> Result<Vec<AuditEntry>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, account_id, context, message, created_at FROM error_log ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AuditEntry {
                id: row.try_get("id")?,
                account_id: row.try_get("account_id")?,
                context: row.try_get("context")?,
                message: row.try_get("message")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    /// `(kind, local_path)` pairs from the event log, oldest first.
    pub async fn list_events(&self) -> Result<Vec<(String, String)>, IndexError> {
        let rows = sqlx::query("SELECT kind, local_path FROM event_log ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get("kind")?, row.try_get("local_path")?)))
            .collect()
    }

    async fn trim_audit(&self, table: &'static str) -> Result<(), IndexError> {
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE id <= (SELECT MAX(id) FROM {table}) - ?1"
        ))
        .bind(self.audit_retention)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn node_from_row(row: &SqliteRow) -> Result<NodeRecord, IndexError> {
    let is_folder: bool = row.try_get("is_folder")?;
    Ok(NodeRecord {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        watcher_id: row.try_get("watcher_id")?,
        remote_node_id: row.try_get("remote_node_id")?,
        remote_folder_path: row.try_get("remote_folder_path")?,
        local_file_path: row.try_get("local_file_path")?,
        local_folder_path: row.try_get("local_folder_path")?,
        file_update_at: row.try_get("file_update_at")?,
        last_uploaded_at: row.try_get("last_uploaded_at")?,
        last_downloaded_at: row.try_get("last_downloaded_at")?,
        kind: if is_folder {
            NodeKind::Folder
        } else {
            NodeKind::File
        },
        upload_in_progress: row.try_get("upload_in_progress")?,
        download_in_progress: row.try_get("download_in_progress")?,
        is_deleted: row.try_get("is_deleted")?,
    })
}

pub fn default_db_path() -> Result<PathBuf, IndexError> {
    let mut path = dirs::data_dir().ok_or(IndexError::MissingDataDir)?;
    path.push("docsyncd");
    path.push("index.db");
    Ok(path)
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
