use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use thiserror::Error;
use url::Url;

use crate::sync::clock::now_unix;
use crate::sync::index::{IndexError, IndexStore};
use crate::sync::paths::{PathError, watcher_local_root};

pub const DEFAULT_SYNC_FREQUENCY_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub instance_url: String,
    pub username: Option<String>,
    pub sync_path: PathBuf,
    pub sync_enabled: bool,
    pub sync_frequency: Duration,
    pub sync_in_progress: bool,
    pub last_synced_at: i64,
}

/// One watched remote folder and the local subtree it mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchMapping {
    pub id: i64,
    pub account_id: i64,
    pub site_id: String,
    pub document_library_node: String,
    pub watch_node: String,
    pub watch_folder: String,
}

impl WatchMapping {
    pub fn local_root(&self, account: &Account) -> Result<PathBuf, PathError> {
        watcher_local_root(&account.sync_path, &self.site_id, &self.watch_folder)
    }
}

#[derive(Debug, Error)]
pub enum AccountsFileError {
    #[error("failed to read accounts file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse accounts file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("account {id} has an invalid instance url: {source}")]
    InvalidUrl { id: i64, source: url::ParseError },
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Accounts and watch mappings seeded into the index at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsFile {
    pub accounts: Vec<AccountSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountSeed {
    pub id: i64,
    pub instance_url: String,
    #[serde(default)]
    pub username: Option<String>,
    pub sync_path: String,
    #[serde(default = "default_enabled")]
    pub sync_enabled: bool,
    #[serde(default = "default_frequency")]
    pub sync_frequency: u64,
    #[serde(default)]
    pub watchers: Vec<WatcherSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherSeed {
    pub site_id: String,
    pub document_library_node: String,
    pub watch_node: String,
    pub watch_folder: String,
}

fn default_enabled() -> bool {
    true
}

fn default_frequency() -> u64 {
    DEFAULT_SYNC_FREQUENCY_SECS
}

impl AccountsFile {
    pub fn load(path: &Path) -> Result<Self, AccountsFileError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, AccountsFileError> {
        let file: AccountsFile = serde_json::from_str(raw)?;
        for account in &file.accounts {
            Url::parse(&account.instance_url).map_err(|source| AccountsFileError::InvalidUrl {
                id: account.id,
                source,
            })?;
        }
        Ok(file)
    }
}

impl IndexStore {
    pub async fn upsert_account(&self, seed: &AccountSeed, sync_path: &Path) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO accounts (id, instance_url, username, sync_path, sync_enabled, sync_frequency)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                instance_url = excluded.instance_url,
                username = excluded.username,
                sync_path = excluded.sync_path,
                sync_enabled = excluded.sync_enabled,
                sync_frequency = excluded.sync_frequency",
        )
        .bind(seed.id)
        .bind(&seed.instance_url)
        .bind(&seed.username)
        .bind(sync_path.to_string_lossy().as_ref())
        .bind(seed.sync_enabled)
        .bind(seed.sync_frequency.max(1) as i64)
        .execute(self.pool())
        .await?;

        for watcher in &seed.watchers {
            sqlx::query(
                "INSERT INTO watchers (account_id, site_id, document_library_node, watch_node, watch_folder)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(account_id, watch_node) DO UPDATE SET
                    site_id = excluded.site_id,
                    document_library_node = excluded.document_library_node,
                    watch_folder = excluded.watch_folder",
            )
            .bind(seed.id)
            .bind(&watcher.site_id)
            .bind(&watcher.document_library_node)
            .bind(&watcher.watch_node)
            .bind(&watcher.watch_folder)
            .execute(self.pool())
            .await?;
        }
        Ok(())
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, instance_url, username, sync_path, sync_enabled, sync_frequency,
                    sync_in_progress, last_synced_at
             FROM accounts ORDER BY id ASC",
        )
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, IndexError> {
        let row = sqlx::query(
            "SELECT id, instance_url, username, sync_path, sync_enabled, sync_frequency,
                    sync_in_progress, last_synced_at
             FROM accounts WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn list_watchers(&self, account_id: i64) -> Result<Vec<WatchMapping>, IndexError> {
        let rows = sqlx::query(
            "SELECT id, account_id, site_id, document_library_node, watch_node, watch_folder
             FROM watchers WHERE account_id = ?1 ORDER BY id ASC",
        )
        .bind(account_id)
        .fetch_all(self.pool())
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(WatchMapping {
                id: row.try_get("id")?,
                account_id: row.try_get("account_id")?,
                site_id: row.try_get("site_id")?,
                document_library_node: row.try_get("document_library_node")?,
                watch_node: row.try_get("watch_node")?,
                watch_folder: row.try_get("watch_folder")?,
            });
        }
        Ok(out)
    }

    /// Takes the per-account pass lock. Returns false when a pass is running.
    pub async fn try_begin_sync(&self, account_id: i64) -> Result<bool, IndexError> {
        let result = sqlx::query(
            "UPDATE accounts SET sync_in_progress = 1 WHERE id = ?1 AND sync_in_progress = 0",
        )
        .bind(account_id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Releases the pass lock unconditionally; stamps the time on success.
    pub async fn finish_sync(&self, account_id: i64, succeeded: bool) -> Result<(), IndexError> {
        if succeeded {
            sqlx::query(
                "UPDATE accounts SET sync_in_progress = 0, last_synced_at = ?2 WHERE id = ?1",
            )
            .bind(account_id)
            .bind(now_unix())
            .execute(self.pool())
            .await?;
        } else {
            sqlx::query("UPDATE accounts SET sync_in_progress = 0 WHERE id = ?1")
                .bind(account_id)
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    pub async fn clear_stale_sync_flags(&self) -> Result<u64, IndexError> {
        let result = sqlx::query("UPDATE accounts SET sync_in_progress = 0 WHERE sync_in_progress = 1")
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

fn account_from_row(row: &SqliteRow) -> Result<Account, IndexError> {
    let sync_path: String = row.try_get("sync_path")?;
    let sync_frequency: i64 = row.try_get("sync_frequency")?;
    Ok(Account {
        id: row.try_get("id")?,
        instance_url: row.try_get("instance_url")?,
        username: row.try_get("username")?,
        sync_path: PathBuf::from(sync_path),
        sync_enabled: row.try_get("sync_enabled")?,
        sync_frequency: Duration::from_secs(sync_frequency.max(1) as u64),
        sync_in_progress: row.try_get("sync_in_progress")?,
        last_synced_at: row.try_get("last_synced_at")?,
    })
}
