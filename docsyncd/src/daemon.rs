use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::accounts::{Account, AccountsFile, WatchMapping};
use crate::storage::CredentialStore;
use crate::sync::backoff::FailurePacer;
use crate::sync::debounce::DEFAULT_DEBOUNCE;
use crate::sync::engine::{DEFAULT_PAGE_SIZE, EngineSettings, PassStats, SyncEngine};
use crate::sync::guard::DEFAULT_GUARD_WINDOW;
use crate::sync::index::{DEFAULT_AUDIT_RETENTION, IndexStore, default_db_path};
use crate::sync::local_watcher::start_notify_watcher;
use crate::sync::transport::{DEFAULT_HTTP_TIMEOUT, HttpTransport};
use crate::sync::watch::AccountWatch;
use crate::sync::worker::WorkerTick;

const DEFAULT_WORKER_PAUSE_MS: u64 = 1000;
const DEFAULT_WORKER_BACKOFF_MAX_SECS: u64 = 60;
const DEFAULT_ACCOUNT_REFRESH_SECS: u64 = 30;
const MIN_DEBOUNCE_MS: u64 = 50;
const MAX_PAGE_SIZE: u64 = 1000;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub home_dir: PathBuf,
    pub db_path: PathBuf,
    pub accounts_file: Option<PathBuf>,
    pub guard_window: Duration,
    pub worker_pause: Duration,
    pub worker_backoff_max: Duration,
    pub debounce: Duration,
    pub http_timeout: Duration,
    pub page_size: u32,
    pub account_refresh: Duration,
    pub audit_retention: i64,
    pub enable_local_watcher: bool,
    pub auth_header: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let default_db = default_db_path().context("failed to resolve index location")?;
        Ok(Self::from_lookup(&home, default_db, |name| std::env::var(name).ok()))
    }

    pub fn from_lookup<F>(home: &Path, default_db: PathBuf, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("DOCSYNC_DB_PATH")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or(default_db);
        let accounts_file = lookup("DOCSYNC_ACCOUNTS_FILE")
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, home));
        let guard_window = Duration::from_secs(read_u64(
            &lookup,
            "DOCSYNC_GUARD_WINDOW_SECS",
            DEFAULT_GUARD_WINDOW.as_secs(),
        ));
        let worker_pause = Duration::from_millis(read_u64(
            &lookup,
            "DOCSYNC_WORKER_PAUSE_MS",
            DEFAULT_WORKER_PAUSE_MS,
        ));
        let worker_backoff_max = Duration::from_secs(read_u64(
            &lookup,
            "DOCSYNC_WORKER_BACKOFF_MAX_SECS",
            DEFAULT_WORKER_BACKOFF_MAX_SECS,
        ));
        let debounce = Duration::from_millis(
            read_u64(&lookup, "DOCSYNC_DEBOUNCE_MS", DEFAULT_DEBOUNCE.as_millis() as u64).max(MIN_DEBOUNCE_MS),
        );
        let http_timeout = Duration::from_secs(
            read_u64(&lookup, "DOCSYNC_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT.as_secs()).max(1),
        );
        let page_size =
            read_u64(&lookup, "DOCSYNC_PAGE_SIZE", u64::from(DEFAULT_PAGE_SIZE)).clamp(1, MAX_PAGE_SIZE) as u32;
        let account_refresh = Duration::from_secs(
            read_u64(&lookup, "DOCSYNC_ACCOUNT_REFRESH_SECS", DEFAULT_ACCOUNT_REFRESH_SECS).max(1),
        );
        let audit_retention =
            read_u64(&lookup, "DOCSYNC_AUDIT_RETENTION", DEFAULT_AUDIT_RETENTION as u64).max(1) as i64;
        let enable_local_watcher = read_bool(&lookup, "DOCSYNC_ENABLE_LOCAL_WATCHER", true);
        let auth_header = lookup("DOCSYNC_AUTH_HEADER").filter(|value| !value.trim().is_empty());

        Self {
            home_dir: home.to_path_buf(),
            db_path,
            accounts_file,
            guard_window,
            worker_pause,
            worker_backoff_max,
            debounce,
            http_timeout,
            page_size,
            account_refresh,
            audit_retention,
            enable_local_watcher,
            auth_header,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            guard_window: self.guard_window,
            page_size: self.page_size,
        }
    }
}

/// Per-account summary printed by `--status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStatus {
    pub id: i64,
    pub instance_url: String,
    pub sync_enabled: bool,
    pub sync_in_progress: bool,
    pub live_records: i64,
    pub queued: i64,
    pub last_synced_at: i64,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "account {} ({}) enabled={} syncing={} records={} queued={} last_sync={}",
            self.id,
            self.instance_url,
            self.sync_enabled,
            self.sync_in_progress,
            self.live_records,
            self.queued,
            format_timestamp(self.last_synced_at)
        )
    }
}

/// Everything that, when changed, requires restarting an account's tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AccountFingerprint {
    instance_url: String,
    sync_path: PathBuf,
    sync_frequency: Duration,
    watchers: Vec<WatchMapping>,
}

struct AccountTasks {
    fingerprint: AccountFingerprint,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    _watcher: Option<notify::RecommendedWatcher>,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    transport: Arc<HttpTransport>,
}

impl DaemonRuntime {
    /// Opens the index and wires the engine.
    ///
    /// Only the long-running daemon passes `recover_stale`: a one-shot CLI
    /// invocation may run next to a live daemon whose locks must survive.
    pub async fn bootstrap(config: DaemonConfig, recover_stale: bool) -> anyhow::Result<Self> {
        let index = IndexStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open index at {:?}", config.db_path))?
            .with_audit_retention(config.audit_retention);

        if recover_stale {
            let stale_locks = index.clear_stale_sync_flags().await?;
            let stale_transfers = index.clear_stale_progress().await?;
            if stale_locks > 0 || stale_transfers > 0 {
                tracing::warn!(
                    stale_locks,
                    stale_transfers,
                    "cleared flags left behind by a previous run"
                );
            }
        }

        if let Some(path) = &config.accounts_file {
            seed_accounts(&index, path, &config.home_dir).await?;
        }

        let credentials = CredentialStore::from_env_header(config.auth_header.clone());
        let transport = Arc::new(HttpTransport::new(credentials, config.http_timeout));
        let engine = Arc::new(SyncEngine::new(
            index,
            transport.clone(),
            config.engine_settings(),
        ));

        Ok(Self {
            config,
            engine,
            transport,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            db = %self.config.db_path.display(),
            local_watcher = self.config.enable_local_watcher,
            guard_window_secs = self.config.guard_window.as_secs(),
            "docsyncd started"
        );

        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(worker_loop(
            Arc::clone(&self.engine),
            self.config.worker_pause,
            self.config.worker_backoff_max,
            shutdown.child_token(),
        ));

        let mut running: HashMap<i64, AccountTasks> = HashMap::new();
        let mut refresh = tokio::time::interval(self.config.account_refresh);
        loop {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("failed waiting for shutdown signal")?;
                    tracing::info!("shutdown requested");
                    break;
                }
                _ = refresh.tick() => {
                    if let Err(err) = self.supervise(&mut running, &shutdown).await {
                        tracing::warn!(error = %err, "account refresh failed");
                    }
                }
            }
        }

        shutdown.cancel();
        for (_, tasks) in running.drain() {
            stop_account(tasks).await;
        }
        let _ = worker.await;
        Ok(())
    }

    /// Starts, restarts or tears down per-account tasks to match the index.
    async fn supervise(
        &self,
        running: &mut HashMap<i64, AccountTasks>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut wanted: HashMap<i64, (Account, AccountFingerprint)> = HashMap::new();
        for account in self.engine.index().list_accounts().await? {
            if !account.sync_enabled {
                continue;
            }
            let watchers = self.engine.index().list_watchers(account.id).await?;
            let fingerprint = AccountFingerprint {
                instance_url: account.instance_url.clone(),
                sync_path: account.sync_path.clone(),
                sync_frequency: account.sync_frequency,
                watchers,
            };
            wanted.insert(account.id, (account, fingerprint));
        }

        let current: HashMap<i64, AccountFingerprint> = running
            .iter()
            .map(|(id, tasks)| (*id, tasks.fingerprint.clone()))
            .collect();
        let desired: HashMap<i64, AccountFingerprint> = wanted
            .iter()
            .map(|(id, (_, fingerprint))| (*id, fingerprint.clone()))
            .collect();
        let plan = plan_supervision(&current, &desired);

        for id in plan.stop {
            if let Some(tasks) = running.remove(&id) {
                tracing::info!(account = id, "stopping account tasks");
                stop_account(tasks).await;
                self.transport.forget_account(id);
            }
        }
        for id in plan.start {
            let Some((account, fingerprint)) = wanted.remove(&id) else {
                continue;
            };
            match self.start_account(account, fingerprint, shutdown).await {
                Ok(tasks) => {
                    running.insert(id, tasks);
                }
                Err(err) => {
                    tracing::warn!(account = id, error = %err, "failed to start account tasks");
                }
            }
        }
        Ok(())
    }

    async fn start_account(
        &self,
        account: Account,
        fingerprint: AccountFingerprint,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<AccountTasks> {
        tokio::fs::create_dir_all(&account.sync_path)
            .await
            .with_context(|| format!("failed to create sync path {:?}", account.sync_path))?;
        let cancel = shutdown.child_token();
        let mut handles = Vec::new();

        handles.push(tokio::spawn(periodic_passes(
            Arc::clone(&self.engine),
            account.id,
            account.sync_frequency,
            cancel.clone(),
        )));

        let watcher = if self.config.enable_local_watcher {
            let scopes = self.engine.scopes_for(&account).await?;
            match start_notify_watcher(&account.sync_path) {
                Ok((watcher, rx)) => {
                    let watch = AccountWatch::new(
                        Arc::clone(&self.engine),
                        account.clone(),
                        scopes,
                        self.config.debounce,
                    );
                    handles.push(tokio::spawn(watch.run(rx, cancel.clone())));
                    Some(watcher)
                }
                Err(err) => {
                    tracing::warn!(account = account.id, error = %err, "failed to start local watcher");
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            account = account.id,
            path = %account.sync_path.display(),
            frequency_secs = account.sync_frequency.as_secs(),
            watchers = fingerprint.watchers.len(),
            "account tasks started"
        );
        Ok(AccountTasks {
            fingerprint,
            cancel,
            handles,
            _watcher: watcher,
        })
    }

    /// One full pass for `account_id`, or for every enabled account.
    pub async fn sync_now(
        &self,
        account_id: Option<i64>,
    ) -> anyhow::Result<Vec<(i64, Option<PassStats>)>> {
        let ids: Vec<i64> = match account_id {
            Some(id) => vec![id],
            None => self
                .engine
                .index()
                .list_accounts()
                .await?
                .into_iter()
                .filter(|account| account.sync_enabled)
                .map(|account| account.id)
                .collect(),
        };

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let stats = self
                .engine
                .sync_account(id)
                .await
                .with_context(|| format!("sync of account {id} failed"))?;
            results.push((id, stats));
        }
        Ok(results)
    }

    pub async fn status(&self) -> anyhow::Result<Vec<AccountStatus>> {
        let index = self.engine.index();
        let mut out = Vec::new();
        for account in index.list_accounts().await? {
            out.push(AccountStatus {
                id: account.id,
                instance_url: account.instance_url.clone(),
                sync_enabled: account.sync_enabled,
                sync_in_progress: account.sync_in_progress,
                live_records: index.count_live(account.id).await?,
                queued: index.queue_len(Some(account.id)).await?,
                last_synced_at: account.last_synced_at,
            });
        }
        Ok(out)
    }
}

async fn seed_accounts(index: &IndexStore, path: &Path, home: &Path) -> anyhow::Result<()> {
    let file = AccountsFile::load(path)
        .with_context(|| format!("failed to load accounts file {path:?}"))?;
    for seed in &file.accounts {
        let sync_path = expand_with_home(&seed.sync_path, home);
        index
            .upsert_account(seed, &sync_path)
            .await
            .with_context(|| format!("failed to seed account {}", seed.id))?;
    }
    tracing::info!(accounts = file.accounts.len(), "accounts seeded");
    Ok(())
}

async fn stop_account(tasks: AccountTasks) {
    tasks.cancel.cancel();
    for handle in tasks.handles {
        let _ = handle.await;
    }
}

async fn periodic_passes(
    engine: Arc<SyncEngine>,
    account_id: i64,
    frequency: Duration,
    cancel: CancellationToken,
) {
    loop {
        match engine.sync_account(account_id).await {
            Ok(_) => {}
            Err(err) => tracing::warn!(account = account_id, error = %err, "pass failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(frequency) => {}
        }
    }
}

async fn worker_loop(
    engine: Arc<SyncEngine>,
    pause: Duration,
    backoff_max: Duration,
    cancel: CancellationToken,
) {
    let mut pacer = FailurePacer::new(pause, backoff_max);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pacer.next_pause()) => {}
        }
        match engine.process_next_work_item().await {
            Ok(WorkerTick::Transient) => {
                pacer.record_transient_failure();
                tracing::info!(streak = pacer.streak(), "worker backing off");
            }
            Ok(WorkerTick::Processed(stats)) => {
                pacer.record_success();
                if !stats.is_quiet() {
                    tracing::debug!(?stats, "work item processed");
                }
            }
            Ok(WorkerTick::Idle) => pacer.record_success(),
            Err(err) => tracing::warn!(error = %err, "worker error"),
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
