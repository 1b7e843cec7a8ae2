use super::engine::{EngineError, PassStats, SyncEngine, WatchScope};
use crate::accounts::Account;

impl SyncEngine {
    /// Full pass for one account under its `sync_in_progress` lock: per watch
    /// mapping, download reconciliation then upload reconciliation. Returns
    /// `None` when another pass already holds the lock.
    pub async fn sync_account(&self, account_id: i64) -> Result<Option<PassStats>, EngineError> {
        let account = self
            .index
            .get_account(account_id)
            .await?
            .ok_or(EngineError::AccountNotFound(account_id))?;
        if !self.index.try_begin_sync(account.id).await? {
            tracing::info!(account = account.id, "pass already running, skipped");
            return Ok(None);
        }

        let result = self.run_pass(&account).await;
        let succeeded = matches!(&result, Ok(stats) if stats.failures == 0);
        if let Err(err) = self.index.finish_sync(account.id, succeeded).await {
            tracing::warn!(account = account.id, error = %err, "failed to release sync lock");
        }
        let stats = result?;

        match self.index.purge_deleted(account.id).await {
            Ok(purged) if purged > 0 => tracing::debug!(account = account.id, purged, "retired records purged"),
            Ok(_) => {}
            Err(err) => tracing::warn!(account = account.id, error = %err, "purge failed"),
        }
        tracing::info!(
            account = account.id,
            downloaded = stats.downloaded,
            uploaded = stats.uploaded,
            created_local = stats.created_local,
            created_remote = stats.created_remote,
            deleted_local = stats.deleted_local,
            deleted_remote = stats.deleted_remote,
            renamed = stats.renamed,
            failures = stats.failures,
            "pass finished"
        );
        Ok(Some(stats))
    }

    async fn run_pass(&self, account: &Account) -> Result<PassStats, EngineError> {
        let mut stats = PassStats::default();
        for scope in self.scopes_for(account).await? {
            stats.merge(self.run_scope(account, &scope).await);
        }
        Ok(stats)
    }

    async fn run_scope(&self, account: &Account, scope: &WatchScope) -> PassStats {
        let mut stats = PassStats::default();
        match self.reconcile_download(account, scope).await {
            Ok(step) => stats.merge(step),
            Err(err) => {
                stats.failures += 1;
                self.note_failure(Some(account.id), "download-pass", &err).await;
            }
        }
        match self.reconcile_upload(account, scope).await {
            Ok(step) => stats.merge(step),
            Err(err) => {
                stats.failures += 1;
                self.note_failure(Some(account.id), "upload-pass", &err).await;
            }
        }
        stats
    }
}
