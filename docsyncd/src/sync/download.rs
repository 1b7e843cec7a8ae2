use std::collections::{HashSet, VecDeque};
use std::path::Path;

use super::clock::{mtime_unix, now_unix};
use super::engine::{EngineError, PassStats, SyncEngine, WatchScope, remove_local_path};
use super::guard::Direction;
use super::index::{NodeInput, NodeRecord};
use super::paths::{local_path_for_remote, path_key};
use super::transport::{DeleteOutcome, RemoteEntry};
use crate::accounts::Account;

/// What the walk should do with a folder entry after reconciling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Descend {
    Yes,
    No,
}

impl SyncEngine {
    /// Walks the remote tree of one watch mapping breadth first and brings the
    /// local tree and the index in line with it.
    pub async fn reconcile_download(
        &self,
        account: &Account,
        scope: &WatchScope,
    ) -> Result<PassStats, EngineError> {
        let pass_start = now_unix();
        let mut stats = PassStats::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut renamed: HashSet<String> = HashSet::new();
        let mut complete = true;
        let mut worklist = VecDeque::from([scope.mapping.watch_node.clone()]);

        tokio::fs::create_dir_all(&scope.local_root).await?;

        while let Some(folder_id) = worklist.pop_front() {
            let mut skip_count = 0u32;
            loop {
                let page = match self
                    .transport
                    .list_children(account, &folder_id, skip_count, self.page_size)
                    .await
                {
                    Ok(page) => page,
                    Err(err) => {
                        complete = false;
                        stats.failures += 1;
                        self.note_failure(Some(account.id), "list-children", &EngineError::from(err))
                            .await;
                        break;
                    }
                };

                for entry in &page.entries {
                    let target = match entry_target(scope, entry) {
                        Ok(target) => target,
                        Err(err) => {
                            complete = false;
                            stats.failures += 1;
                            self.note_failure(Some(account.id), "download", &err).await;
                            continue;
                        }
                    };
                    seen.insert(path_key(&target));

                    match self
                        .reconcile_remote_entry(account, scope, entry, &target, &mut renamed, &mut stats)
                        .await
                    {
                        Ok(Descend::Yes) if entry.is_folder => worklist.push_back(entry.id.clone()),
                        Ok(_) => {}
                        Err(err) => {
                            complete = false;
                            stats.failures += 1;
                            self.note_failure(Some(account.id), "download", &err).await;
                        }
                    }
                }

                if !page.has_more || page.entries.is_empty() {
                    break;
                }
                skip_count += page.entries.len() as u32;
            }
        }

        if complete {
            self.sweep_remote_deletions(account, scope, &seen, pass_start, &mut stats)
                .await?;
        } else {
            tracing::info!(account = account.id, watcher = scope.mapping.id, "walk incomplete, deletion sweep skipped");
        }

        Ok(stats)
    }

    async fn reconcile_remote_entry(
        &self,
        account: &Account,
        scope: &WatchScope,
        entry: &RemoteEntry,
        target: &Path,
        renamed: &mut HashSet<String>,
        stats: &mut PassStats,
    ) -> Result<Descend, EngineError> {
        let key = path_key(target);
        let parent_path = entry
            .parent_path
            .clone()
            .ok_or_else(|| EngineError::MissingParentPath(entry.id.clone()))?;

        if let Some(previous) = self.index.get_by_remote_node_id(account.id, &entry.id).await?
            && previous.local_file_path != key
        {
            if previous.upload_in_progress || previous.download_in_progress {
                return Ok(Descend::No);
            }
            self.remove_local_mirror(account, &previous).await?;
            renamed.insert(entry.id.clone());
            stats.renamed += 1;
            stats.deleted_local += 1;
            self.note_event(account.id, "remote-rename", &key, Some(&entry.id))
                .await;
        }

        let record = self.index.get_by_local_path(account.id, &key).await?;
        let local_meta = tokio::fs::metadata(target).await.ok();

        let Some(record) = record else {
            return self
                .materialize_new(account, scope, entry, target, &parent_path, local_meta, stats)
                .await;
        };

        if record.upload_in_progress || record.download_in_progress {
            tracing::debug!(account = account.id, path = %key, "entry busy, skipped");
            return Ok(Descend::No);
        }

        let record = match record.remote_node_id.as_deref() {
            Some(_) => record,
            None => {
                self.index
                    .set_remote_node_id(record.id, &entry.id, &parent_path)
                    .await?;
                NodeRecord {
                    remote_node_id: Some(entry.id.clone()),
                    remote_folder_path: parent_path.clone(),
                    ..record
                }
            }
        };

        let Some(local_meta) = local_meta else {
            if record.remote_folder_path == parent_path && !renamed.contains(&entry.id) {
                // Removed locally while we were not watching: local deletion wins.
                if self.guard_allows(Direction::Upload, Some(&record), None, scope.contains(target), &key) {
                    if self.transport.delete_node(account, &entry.id).await? == DeleteOutcome::Deleted {
                        stats.deleted_remote += 1;
                    }
                    self.index.mark_deleted(account.id, &key).await?;
                    self.note_event(account.id, "remote-delete", &key, Some(&entry.id))
                        .await;
                }
                return Ok(Descend::No);
            }
            return self
                .materialize_new(account, scope, entry, target, &parent_path, None, stats)
                .await;
        };

        if entry.is_folder {
            return Ok(Descend::Yes);
        }

        let local_mtime = mtime_unix(&local_meta);
        if entry.modified_at > record.file_update_at.max(local_mtime)
            && self.guard_allows(
                Direction::Download,
                Some(&record),
                Some(entry.modified_at),
                scope.contains(target),
                &key,
            )
        {
            self.refresh_download(account, &record, entry, target, stats)
                .await?;
        } else if entry.modified_at > record.file_update_at && entry.modified_at <= local_mtime {
            // Local copy is at least as new: only track the remote time.
            self.index
                .update_modified_time(record.id, entry.modified_at)
                .await?;
        }
        Ok(Descend::No)
    }

    #[allow(clippy::too_many_arguments)]
    async fn materialize_new(
        &self,
        account: &Account,
        scope: &WatchScope,
        entry: &RemoteEntry,
        target: &Path,
        parent_path: &str,
        local_meta: Option<std::fs::Metadata>,
        stats: &mut PassStats,
    ) -> Result<Descend, EngineError> {
        let key = path_key(target);
        if !self.guard_allows(Direction::Download, None, Some(entry.modified_at), scope.contains(target), &key) {
            return Ok(Descend::No);
        }
        let base = NodeInput {
            remote_node_id: Some(entry.id.clone()),
            remote_folder_path: parent_path.to_string(),
            file_update_at: entry.modified_at,
            ..self.node_input(account, scope, target, entry.is_folder)
        };

        if entry.is_folder {
            if local_meta.as_ref().is_some_and(|meta| !meta.is_dir()) {
                remove_local_path(target).await?;
            }
            tokio::fs::create_dir_all(target).await?;
            self.index
                .insert_replace(&NodeInput {
                    last_downloaded_at: now_unix(),
                    ..base
                })
                .await?;
            stats.created_local += 1;
            self.note_event(account.id, "local-create", &key, Some(&entry.id))
                .await;
            return Ok(Descend::Yes);
        }

        // An untracked local file newer than the remote one is adopted as-is;
        // the upload pass will push it.
        if let Some(meta) = local_meta.as_ref()
            && meta.is_file()
            && mtime_unix(meta) >= entry.modified_at
        {
            if let Some(existing) = self.index.get_by_local_path(account.id, &key).await? {
                tracing::debug!(account = account.id, path = %key, record = existing.id, "record appeared meanwhile, kept");
                return Ok(Descend::No);
            }
            self.index.insert_replace(&base).await?;
            tracing::info!(account = account.id, path = %key, "adopted untracked local file");
            return Ok(Descend::No);
        }

        if local_meta.as_ref().is_some_and(|meta| meta.is_dir()) {
            remove_local_path(target).await?;
        }
        self.transport.download_file(account, entry, target).await?;
        self.index
            .insert_replace(&NodeInput {
                last_downloaded_at: now_unix(),
                ..base
            })
            .await?;
        stats.downloaded += 1;
        self.note_event(account.id, "download", &key, Some(&entry.id))
            .await;
        Ok(Descend::No)
    }

    async fn refresh_download(
        &self,
        account: &Account,
        record: &NodeRecord,
        entry: &RemoteEntry,
        target: &Path,
        stats: &mut PassStats,
    ) -> Result<(), EngineError> {
        if !self.index.set_download_progress(record.id, true).await? {
            return Ok(());
        }
        let result = self.transport.download_file(account, entry, target).await;
        let finished = match result {
            Ok(()) => self
                .index
                .record_download(record.id, now_unix(), entry.modified_at)
                .await
                .map_err(EngineError::from),
            Err(err) => Err(err.into()),
        };
        self.index.set_download_progress(record.id, false).await?;
        finished?;

        stats.downloaded += 1;
        self.note_event(account.id, "download", &record.local_file_path, Some(&entry.id))
            .await;
        Ok(())
    }

    /// After a complete walk, records the remote no longer lists are removed
    /// locally, unless they were touched after the walk began.
    async fn sweep_remote_deletions(
        &self,
        account: &Account,
        scope: &WatchScope,
        seen: &HashSet<String>,
        pass_start: i64,
        stats: &mut PassStats,
    ) -> Result<(), EngineError> {
        let missing = self
            .index
            .get_missing(account.id, scope.mapping.id, seen)
            .await?;
        let mut removed: Vec<String> = Vec::new();
        for record in missing {
            if record.remote_node_id.is_none()
                || record.upload_in_progress
                || record.download_in_progress
                || record.last_transfer_at() >= pass_start
            {
                continue;
            }
            // Children of a folder removed in this sweep are already gone.
            if removed
                .iter()
                .any(|folder| Path::new(&record.local_file_path).starts_with(folder))
            {
                continue;
            }
            match self.remove_local_mirror(account, &record).await {
                Ok(()) => {
                    stats.deleted_local += 1;
                    removed.push(record.local_file_path.clone());
                }
                Err(err) => {
                    stats.failures += 1;
                    self.note_failure(Some(account.id), "remote-deletion-sweep", &err)
                        .await;
                }
            }
        }
        Ok(())
    }
}

fn entry_target(scope: &WatchScope, entry: &RemoteEntry) -> Result<std::path::PathBuf, EngineError> {
    let parent = entry
        .parent_path
        .as_deref()
        .ok_or_else(|| EngineError::MissingParentPath(entry.id.clone()))?;
    Ok(local_path_for_remote(
        &scope.local_root,
        &scope.mapping.watch_folder,
        parent,
        &entry.name,
    )?)
}
