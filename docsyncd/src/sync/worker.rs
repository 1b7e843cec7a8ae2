use std::path::Path;

use super::clock::mtime_unix;
use super::engine::{EngineError, PassStats, SyncEngine};
use super::guard::Direction;
use super::queue::WorkItem;
use super::transport::NodeLookup;

/// Result of one worker tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTick {
    Idle,
    Processed(PassStats),
    /// The remote answered 5xx or timed out; the caller should slow down.
    Transient,
}

impl SyncEngine {
    /// Claims one work item and reconciles its path. The item is removed from
    /// the queue on claim, so every outcome consumes it.
    pub async fn process_next_work_item(&self) -> Result<WorkerTick, EngineError> {
        let Some(item) = self.index.claim_next_work().await? else {
            return Ok(WorkerTick::Idle);
        };

        match self.process_work_item(&item).await {
            Ok(stats) => Ok(WorkerTick::Processed(stats)),
            Err(err) if err.is_transient() => {
                self.note_failure(Some(item.account_id), "worker", &err).await;
                Ok(WorkerTick::Transient)
            }
            Err(err) => {
                self.note_failure(Some(item.account_id), "worker", &err).await;
                Ok(WorkerTick::Processed(PassStats {
                    failures: 1,
                    ..PassStats::default()
                }))
            }
        }
    }

    async fn process_work_item(&self, item: &WorkItem) -> Result<PassStats, EngineError> {
        let Some(account) = self.index.get_account(item.account_id).await? else {
            return Ok(PassStats::default());
        };
        if !account.sync_enabled {
            return Ok(PassStats::default());
        }
        let Some(scope) = self
            .scopes_for(&account)
            .await?
            .into_iter()
            .find(|scope| scope.mapping.id == item.watcher_id)
        else {
            tracing::debug!(account = account.id, watcher = item.watcher_id, "work item for unknown watcher");
            return Ok(PassStats::default());
        };

        let path = Path::new(&item.file_path);
        let Ok(meta) = tokio::fs::metadata(path).await else {
            tracing::debug!(account = account.id, path = %item.file_path, "queued path vanished");
            return Ok(PassStats::default());
        };
        let is_dir = meta.is_dir();
        if !is_dir && meta.len() == 0 {
            tracing::debug!(account = account.id, path = %item.file_path, "empty file skipped");
            return Ok(PassStats::default());
        }

        let Some(record) = self
            .index
            .get_by_local_path(account.id, &item.file_path)
            .await?
        else {
            return self.create_remote(&account, &scope, path, is_dir).await;
        };

        let local_mtime = mtime_unix(&meta);
        let Some(node_id) = record.remote_node_id.clone() else {
            // Created after a conflict; push again once the content moved on.
            if !is_dir
                && local_mtime > record.last_transfer_at() + self.guard.window_secs()
                && self.guard_allows(Direction::Upload, Some(&record), Some(local_mtime), scope.contains(path), &item.file_path)
            {
                return self.upload_existing(&account, &scope, &record, local_mtime).await;
            }
            return Ok(PassStats::default());
        };

        let entry = match self.transport.get_node(&account, &node_id).await? {
            NodeLookup::NotFound => {
                self.remove_local_mirror(&account, &record).await?;
                return Ok(PassStats {
                    deleted_local: 1,
                    ..PassStats::default()
                });
            }
            NodeLookup::Found(entry) => entry,
        };

        if entry
            .parent_path
            .as_deref()
            .is_some_and(|parent| parent.trim_end_matches('/') != record.remote_folder_path.trim_end_matches('/'))
        {
            self.remove_local_mirror(&account, &record).await?;
            return Ok(PassStats {
                deleted_local: 1,
                ..PassStats::default()
            });
        }

        if !is_dir
            && local_mtime > entry.modified_at
            && !record.upload_in_progress
            && !record.download_in_progress
            && self.guard_allows(
                Direction::Upload,
                Some(&record),
                Some(local_mtime),
                scope.contains(path),
                &item.file_path,
            )
        {
            return self.upload_existing(&account, &scope, &record, local_mtime).await;
        }
        Ok(PassStats::default())
    }
}
