use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use super::clock::mtime_unix;
use super::engine::{EngineError, PassStats, SyncEngine, WatchScope};
use super::guard::Direction;
use super::index::NodeRecord;
use super::paths::{is_partial, path_key};
use super::transport::NodeLookup;
use crate::accounts::Account;

impl SyncEngine {
    /// Walks the local subtree of one watch mapping and pushes what the remote
    /// is missing. Every path is reconciled on its own; failures are logged
    /// and the walk continues.
    pub async fn reconcile_upload(
        &self,
        account: &Account,
        scope: &WatchScope,
    ) -> Result<PassStats, EngineError> {
        let mut stats = PassStats::default();
        let mut worklist: VecDeque<PathBuf> = VecDeque::new();
        tokio::fs::create_dir_all(&scope.local_root).await?;
        push_children(&scope.local_root, &mut worklist).await?;

        while let Some(path) = worklist.pop_front() {
            match self.reconcile_local_path(account, scope, &path).await {
                Ok(step) => stats.merge(step),
                Err(err) => {
                    stats.failures += 1;
                    self.note_failure(Some(account.id), "upload", &err).await;
                }
            }
            // Folders dropped as remote deletions are not descended into.
            if tokio::fs::metadata(&path).await.is_ok_and(|meta| meta.is_dir())
                && let Err(err) = push_children(&path, &mut worklist).await
            {
                stats.failures += 1;
                self.note_failure(Some(account.id), "upload", &EngineError::from(err)).await;
            }
        }
        Ok(stats)
    }

    async fn reconcile_local_path(
        &self,
        account: &Account,
        scope: &WatchScope,
        path: &Path,
    ) -> Result<PassStats, EngineError> {
        let meta = tokio::fs::metadata(path).await?;
        let is_dir = meta.is_dir();
        if !is_dir && meta.len() == 0 {
            return Ok(PassStats::default());
        }
        let key = path_key(path);
        let Some(record) = self.index.get_by_local_path(account.id, &key).await? else {
            return self.create_remote(account, scope, path, is_dir).await;
        };
        if record.download_in_progress {
            tracing::debug!(account = account.id, path = %key, "download in flight, skipped");
            return Ok(PassStats::default());
        }

        let local_mtime = mtime_unix(&meta);
        let window = self.guard.window_secs();
        if !is_dir
            && local_mtime > record.last_uploaded_at + window
            && local_mtime > record.last_downloaded_at + window
        {
            if self.guard_allows(
                Direction::Upload,
                Some(&record),
                Some(local_mtime),
                scope.contains(path),
                &key,
            ) {
                return self.upload_existing(account, scope, &record, local_mtime).await;
            }
            return Ok(PassStats::default());
        }

        if record.has_synced() {
            return self.confirm_remote(account, &record).await;
        }
        Ok(PassStats::default())
    }

    /// One GET to check a synced record still exists where we left it. A 404
    /// or a move elsewhere drops the local mirror.
    pub(crate) async fn confirm_remote(
        &self,
        account: &Account,
        record: &NodeRecord,
    ) -> Result<PassStats, EngineError> {
        let mut stats = PassStats::default();
        let Some(node_id) = record.remote_node_id.as_deref() else {
            return Ok(stats);
        };
        let relocated = match self.transport.get_node(account, node_id).await? {
            NodeLookup::NotFound => true,
            NodeLookup::Found(entry) => entry
                .parent_path
                .as_deref()
                .is_some_and(|parent| parent.trim_end_matches('/') != record.remote_folder_path.trim_end_matches('/')),
        };
        if relocated {
            self.remove_local_mirror(account, record).await?;
            stats.deleted_local += 1;
        }
        Ok(stats)
    }
}

async fn push_children(dir: &Path, worklist: &mut VecDeque<PathBuf>) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut children = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_partial(&path) {
            children.push(path);
        }
    }
    children.sort();
    worklist.extend(children);
    Ok(())
}
