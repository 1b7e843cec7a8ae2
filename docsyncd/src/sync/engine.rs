use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::clock::{mtime_unix, now_unix};
use super::guard::{Direction, GuardInput, LoopGuard, Verdict};
use super::index::{IndexError, IndexStore, NodeInput, NodeKind, NodeRecord};
use super::paths::{PathError, is_within, local_relative, path_key, remote_folder_for_local};
use super::transport::{CreateOutcome, DeleteOutcome, RemoteEntry, RemoteTransport, TransportError};
use crate::accounts::{Account, WatchMapping};

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("remote entry {0} has no parent path")]
    MissingParentPath(String),
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transport(err) if err.is_transient())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub guard_window: Duration,
    pub page_size: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            guard_window: super::guard::DEFAULT_GUARD_WINDOW,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// A watch mapping resolved against its account's local root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchScope {
    pub mapping: WatchMapping,
    pub local_root: PathBuf,
}

impl WatchScope {
    pub fn resolve(account: &Account, mapping: WatchMapping) -> Result<Self, PathError> {
        let local_root = mapping.local_root(account)?;
        Ok(Self {
            mapping,
            local_root,
        })
    }

    pub fn contains(&self, path: &Path) -> bool {
        is_within(path, &self.local_root) && path != self.local_root
    }

    /// Remote folder path that `local_path`'s parent corresponds to.
    pub fn remote_parent_for(&self, local_path: &Path) -> Option<String> {
        let parent = local_path.parent()?;
        remote_folder_for_local(&self.mapping.watch_folder, &self.local_root, parent)
    }

    /// `relativePath` for creates under the watch node; `None` at the top level.
    pub fn relative_parent_for(&self, local_path: &Path) -> Option<String> {
        let parent = local_path.parent()?;
        local_relative(&self.local_root, parent).filter(|p| !p.is_empty())
    }
}

/// Counters for one reconciliation pass or worker step.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub downloaded: usize,
    pub uploaded: usize,
    pub created_local: usize,
    pub created_remote: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    pub renamed: usize,
    pub failures: usize,
}

impl PassStats {
    pub fn merge(&mut self, other: PassStats) {
        self.downloaded += other.downloaded;
        self.uploaded += other.uploaded;
        self.created_local += other.created_local;
        self.created_remote += other.created_remote;
        self.deleted_local += other.deleted_local;
        self.deleted_remote += other.deleted_remote;
        self.renamed += other.renamed;
        self.failures += other.failures;
    }

    pub fn is_quiet(&self) -> bool {
        *self == PassStats::default()
    }
}

pub struct SyncEngine {
    pub(crate) index: IndexStore,
    pub(crate) transport: Arc<dyn RemoteTransport>,
    pub(crate) guard: LoopGuard,
    pub(crate) page_size: u32,
}

impl SyncEngine {
    pub fn new(index: IndexStore, transport: Arc<dyn RemoteTransport>, settings: EngineSettings) -> Self {
        Self {
            index,
            transport,
            guard: LoopGuard::new(settings.guard_window),
            page_size: settings.page_size.max(1),
        }
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub async fn scopes_for(&self, account: &Account) -> Result<Vec<WatchScope>, EngineError> {
        let mappings = self.index.list_watchers(account.id).await?;
        let mut scopes = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            match WatchScope::resolve(account, mapping) {
                Ok(scope) => scopes.push(scope),
                Err(err) => {
                    self.note_failure(Some(account.id), "watcher", &EngineError::Path(err))
                        .await;
                }
            }
        }
        Ok(scopes)
    }

    pub(crate) fn guard_allows(
        &self,
        direction: Direction,
        record: Option<&NodeRecord>,
        candidate_mtime: Option<i64>,
        in_scope: bool,
        path: &str,
    ) -> bool {
        let verdict = self.guard.decide(
            direction,
            GuardInput {
                record,
                candidate_mtime,
                in_scope,
                now: now_unix(),
            },
        );
        match verdict {
            Verdict::Allow => true,
            Verdict::Suppress(reason) => {
                tracing::debug!(path, ?direction, ?reason, "transfer suppressed by guard");
                false
            }
        }
    }

    /// Logs a per-path failure and appends it to the error audit log.
    pub(crate) async fn note_failure(&self, account_id: Option<i64>, context: &str, err: &EngineError) {
        tracing::warn!(account = ?account_id, context, error = %err, "sync step failed");
        if let Err(log_err) = self
            .index
            .record_error(account_id, context, &err.to_string())
            .await
        {
            tracing::warn!(error = %log_err, "failed to write error log");
        }
    }

    pub(crate) async fn note_event(
        &self,
        account_id: i64,
        kind: &str,
        local_path: &str,
        remote_node_id: Option<&str>,
    ) {
        tracing::info!(account = account_id, kind, path = local_path, node = ?remote_node_id, "sync event");
        if let Err(err) = self
            .index
            .record_event(Some(account_id), kind, local_path, remote_node_id)
            .await
        {
            tracing::warn!(error = %err, "failed to write event log");
        }
    }

    /// Deletes the local copy of `record` and retires it with its descendants.
    pub(crate) async fn remove_local_mirror(
        &self,
        account: &Account,
        record: &NodeRecord,
    ) -> Result<(), EngineError> {
        remove_local_path(Path::new(&record.local_file_path)).await?;
        self.index
            .mark_deleted(account.id, &record.local_file_path)
            .await?;
        self.note_event(
            account.id,
            "local-delete",
            &record.local_file_path,
            record.remote_node_id.as_deref(),
        )
        .await;
        Ok(())
    }

    /// Propagates a local removal. Paths never synchronized cost no remote call.
    pub async fn delete_remote_for_local(
        &self,
        account: &Account,
        scope: &WatchScope,
        local_path: &Path,
    ) -> Result<PassStats, EngineError> {
        let mut stats = PassStats::default();
        let key = path_key(local_path);
        let Some(record) = self.index.get_by_local_path(account.id, &key).await? else {
            tracing::debug!(account = account.id, path = %key, "removed path was never synced");
            return Ok(stats);
        };
        if record.upload_in_progress || record.download_in_progress {
            tracing::debug!(account = account.id, path = %key, "removal skipped, transfer in flight");
            return Ok(stats);
        }
        if !self.guard_allows(Direction::Upload, Some(&record), None, scope.contains(local_path), &key) {
            return Ok(stats);
        }

        if let Some(node_id) = record.remote_node_id.as_deref() {
            match self.transport.delete_node(account, node_id).await? {
                DeleteOutcome::Deleted => stats.deleted_remote += 1,
                DeleteOutcome::AlreadyGone => {
                    tracing::debug!(account = account.id, node = node_id, "remote node already gone");
                }
            }
            self.note_event(account.id, "remote-delete", &key, Some(node_id))
                .await;
        }
        self.index.mark_deleted(account.id, &key).await?;
        Ok(stats)
    }

    /// First push of a local path that has no record yet.
    pub(crate) async fn create_remote(
        &self,
        account: &Account,
        scope: &WatchScope,
        local_path: &Path,
        is_dir: bool,
    ) -> Result<PassStats, EngineError> {
        let mut stats = PassStats::default();
        let key = path_key(local_path);
        if !self.guard_allows(Direction::Upload, None, None, scope.contains(local_path), &key) {
            return Ok(stats);
        }
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative = scope.relative_parent_for(local_path);
        let expected_parent = scope
            .remote_parent_for(local_path)
            .unwrap_or_else(|| scope.mapping.watch_folder.clone());
        let watch_node = scope.mapping.watch_node.as_str();

        let outcome = if is_dir {
            self.transport
                .create_folder(account, watch_node, &name, relative.as_deref())
                .await?
        } else {
            self.transport
                .upload_file(account, watch_node, local_path, relative.as_deref(), false)
                .await?
        };

        // Lost a create race: the winner's record already carries the remote id.
        if matches!(outcome, CreateOutcome::AlreadyExists)
            && let Some(existing) = self.index.get_by_local_path(account.id, &key).await?
        {
            tracing::debug!(account = account.id, path = %key, record = existing.id, "record created concurrently, kept");
            return Ok(stats);
        }

        let local_mtime = tokio::fs::metadata(local_path)
            .await
            .map(|meta| mtime_unix(&meta))
            .unwrap_or(0);
        let now = now_unix();
        let input = match &outcome {
            CreateOutcome::Created(entry) => NodeInput {
                remote_node_id: Some(entry.id.clone()),
                remote_folder_path: entry.parent_path.clone().unwrap_or(expected_parent),
                file_update_at: entry.modified_at,
                last_uploaded_at: now,
                ..self.node_input(account, scope, local_path, is_dir)
            },
            // The name already exists remotely: keep the local version as synced.
            CreateOutcome::AlreadyExists => NodeInput {
                remote_node_id: None,
                remote_folder_path: expected_parent,
                file_update_at: local_mtime,
                last_uploaded_at: local_mtime,
                ..self.node_input(account, scope, local_path, is_dir)
            },
        };
        let record = self.index.insert_replace(&input).await?;

        match outcome {
            CreateOutcome::Created(entry) => {
                stats.created_remote += 1;
                self.note_event(account.id, "remote-create", &key, Some(&entry.id))
                    .await;
            }
            CreateOutcome::AlreadyExists => {
                tracing::info!(account = account.id, path = %key, record = record.id, "remote already has this name");
            }
        }
        Ok(stats)
    }

    /// Pushes new content of an already tracked file.
    pub(crate) async fn upload_existing(
        &self,
        account: &Account,
        scope: &WatchScope,
        record: &NodeRecord,
        local_mtime: i64,
    ) -> Result<PassStats, EngineError> {
        let mut stats = PassStats::default();
        if !self.index.set_upload_progress(record.id, true).await? {
            tracing::debug!(account = account.id, path = %record.local_file_path, "upload skipped, download in flight");
            return Ok(stats);
        }

        let local_path = PathBuf::from(&record.local_file_path);
        let result = self
            .transport
            .upload_file(
                account,
                &scope.mapping.watch_node,
                &local_path,
                scope.relative_parent_for(&local_path).as_deref(),
                true,
            )
            .await;

        let finished = match result {
            Ok(CreateOutcome::Created(entry)) => {
                self.apply_upload(record, &entry).await.map(|_| Some(entry.id))
            }
            Ok(CreateOutcome::AlreadyExists) => self
                .index
                .record_upload(record.id, local_mtime, local_mtime)
                .await
                .map(|_| None)
                .map_err(EngineError::from),
            Err(err) => Err(err.into()),
        };
        self.index.set_upload_progress(record.id, false).await?;

        let node = finished?;
        stats.uploaded += 1;
        self.note_event(account.id, "upload", &record.local_file_path, node.as_deref())
            .await;
        Ok(stats)
    }

    async fn apply_upload(&self, record: &NodeRecord, entry: &RemoteEntry) -> Result<(), EngineError> {
        if record.remote_node_id.as_deref() != Some(entry.id.as_str()) {
            let folder = entry
                .parent_path
                .clone()
                .unwrap_or_else(|| record.remote_folder_path.clone());
            self.index
                .set_remote_node_id(record.id, &entry.id, &folder)
                .await?;
        }
        self.index
            .record_upload(record.id, now_unix(), entry.modified_at)
            .await?;
        Ok(())
    }

    pub(crate) fn node_input(
        &self,
        account: &Account,
        scope: &WatchScope,
        local_path: &Path,
        is_dir: bool,
    ) -> NodeInput {
        let local_folder_path = local_path
            .parent()
            .map(path_key)
            .unwrap_or_default();
        NodeInput {
            account_id: account.id,
            watcher_id: scope.mapping.id,
            remote_node_id: None,
            remote_folder_path: scope.mapping.watch_folder.clone(),
            local_file_path: path_key(local_path),
            local_folder_path,
            file_update_at: 0,
            last_uploaded_at: 0,
            last_downloaded_at: 0,
            kind: if is_dir { NodeKind::Folder } else { NodeKind::File },
        }
    }
}

/// Removes a file or a whole folder; a missing path is already removed.
pub(crate) async fn remove_local_path(path: &Path) -> std::io::Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}

#[cfg(test)]
#[path = "engine_tests/mod.rs"]
mod tests;
