use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::debounce::Debouncer;
use super::engine::{EngineError, PassStats, SyncEngine, WatchScope};
use super::local_watcher::{ChangeClassifier, FsChange, LocalEvent};
use super::paths::path_key;
use super::queue::NewWorkItem;
use crate::accounts::Account;

impl SyncEngine {
    /// Fast path for one logical local change: creates and edits are queued
    /// for the worker, removals go straight to the remote.
    pub async fn handle_local_event(
        &self,
        account: &Account,
        scopes: &[WatchScope],
        event: &LocalEvent,
    ) -> Result<PassStats, EngineError> {
        let Some(scope) = scope_for(scopes, event) else {
            tracing::debug!(account = account.id, path = %event.path.display(), "event outside every watch mapping");
            return Ok(PassStats::default());
        };

        match event.change {
            FsChange::Created | FsChange::Changed => {
                let item = NewWorkItem::for_path(
                    account.id,
                    scope.mapping.id,
                    path_key(&event.path),
                    scope.mapping.watch_node.clone(),
                    event.is_dir,
                );
                self.index.enqueue_work(&item).await?;
                tracing::debug!(account = account.id, path = %item.file_path, "queued");
                Ok(PassStats::default())
            }
            FsChange::Removed => self.delete_remote_for_local(account, scope, &event.path).await,
        }
    }
}

/// The most specific mapping containing the event path.
fn scope_for<'a>(scopes: &'a [WatchScope], event: &LocalEvent) -> Option<&'a WatchScope> {
    scopes
        .iter()
        .filter(|scope| scope.contains(&event.path))
        .max_by_key(|scope| scope.local_root.components().count())
}

/// Debounces raw notifications for one account and dispatches the
/// classified changes to the engine.
pub struct AccountWatch {
    engine: Arc<SyncEngine>,
    account: Account,
    scopes: Vec<WatchScope>,
    debouncer: Debouncer,
    classifier: ChangeClassifier,
}

impl AccountWatch {
    pub fn new(
        engine: Arc<SyncEngine>,
        account: Account,
        scopes: Vec<WatchScope>,
        window: Duration,
    ) -> Self {
        let classifier = ChangeClassifier::prime(&account.sync_path);
        Self {
            engine,
            account,
            scopes,
            debouncer: Debouncer::new(window),
            classifier,
        }
    }

    pub fn note(&mut self, path: PathBuf, now: Instant) {
        self.debouncer.touch(path, now);
    }

    /// Dispatches every path that has been quiet for a full window. Returns
    /// the number of logical events handled.
    pub async fn flush(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        for path in self.debouncer.drain_ready(now) {
            let Some(event) = self.classifier.observe(&path) else {
                continue;
            };
            handled += 1;
            if let Err(err) = self
                .engine
                .handle_local_event(&self.account, &self.scopes, &event)
                .await
            {
                self.engine
                    .note_failure(Some(self.account.id), "watcher", &err)
                    .await;
            }
        }
        handled
    }

    /// Runs until cancelled or the notification channel closes. A flush
    /// already in progress finishes before the loop exits.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PathBuf>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.debouncer.window());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(path) => self.note(path, Instant::now()),
                    None => break,
                },
                _ = tick.tick() => {
                    self.flush(Instant::now()).await;
                }
            }
        }
        tracing::info!(account = self.account.id, "local watcher stopped");
    }
}
