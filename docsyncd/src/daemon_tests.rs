use super::*;
use tempfile::tempdir;

fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

#[test]
fn expands_tilde_to_home_sync_dir() {
    let home = PathBuf::from("/tmp/home-user");
    assert_eq!(
        expand_with_home("~/Documents/Sync", &home),
        PathBuf::from("/tmp/home-user/Documents/Sync")
    );
    assert_eq!(expand_with_home("~", &home), home);
    assert_eq!(expand_with_home("/srv/sync", &home), PathBuf::from("/srv/sync"));
}

#[test]
fn config_uses_defaults_without_overrides() {
    let home = PathBuf::from("/home/u");
    let config = DaemonConfig::from_lookup(&home, PathBuf::from("/data/index.db"), lookup_from(&[]));
    assert_eq!(config.db_path, PathBuf::from("/data/index.db"));
    assert!(config.accounts_file.is_none());
    assert_eq!(config.guard_window, Duration::from_secs(10));
    assert_eq!(config.worker_pause, Duration::from_millis(1000));
    assert_eq!(config.debounce, Duration::from_millis(1200));
    assert_eq!(config.page_size, 100);
    assert!(config.enable_local_watcher);
    assert!(config.auth_header.is_none());
}

#[test]
fn config_reads_overrides_and_clamps() {
    let home = PathBuf::from("/home/u");
    let config = DaemonConfig::from_lookup(
        &home,
        PathBuf::from("/data/index.db"),
        lookup_from(&[
            ("DOCSYNC_DB_PATH", "~/state/index.db"),
            ("DOCSYNC_ACCOUNTS_FILE", "~/accounts.json"),
            ("DOCSYNC_GUARD_WINDOW_SECS", "30"),
            ("DOCSYNC_DEBOUNCE_MS", "5"),
            ("DOCSYNC_PAGE_SIZE", "0"),
            ("DOCSYNC_ENABLE_LOCAL_WATCHER", "off"),
            ("DOCSYNC_AUTH_HEADER", "Basic abc"),
            ("DOCSYNC_AUDIT_RETENTION", "not-a-number"),
        ]),
    );
    assert_eq!(config.db_path, PathBuf::from("/home/u/state/index.db"));
    assert_eq!(config.accounts_file, Some(PathBuf::from("/home/u/accounts.json")));
    assert_eq!(config.guard_window, Duration::from_secs(30));
    assert_eq!(config.debounce, Duration::from_millis(MIN_DEBOUNCE_MS));
    assert_eq!(config.page_size, 1);
    assert!(!config.enable_local_watcher);
    assert_eq!(config.auth_header.as_deref(), Some("Basic abc"));
    assert_eq!(config.audit_retention, DEFAULT_AUDIT_RETENTION);
    assert_eq!(config.engine_settings().guard_window, Duration::from_secs(30));
}

#[test]
fn unrecognized_bool_falls_back_to_default() {
    let lookup = lookup_from(&[("FLAG", "maybe")]);
    assert!(read_bool(&lookup, "FLAG", true));
    assert!(!read_bool(&lookup, "FLAG", false));
    assert!(read_bool(&lookup_from(&[("FLAG", "YES")]), "FLAG", false));
}

#[test]
fn supervision_plan_starts_stops_and_restarts() {
    let current: HashMap<i64, &str> = [(1, "a"), (2, "b"), (3, "c")].into_iter().collect();
    let desired: HashMap<i64, &str> = [(1, "a"), (2, "b2"), (4, "d")].into_iter().collect();

    let plan = plan_supervision(&current, &desired);
    assert_eq!(plan.stop, vec![2, 3]);
    assert_eq!(plan.start, vec![2, 4]);
}

#[test]
fn supervision_plan_is_empty_when_nothing_changed() {
    let current: HashMap<i64, u8> = [(1, 0)].into_iter().collect();
    assert_eq!(plan_supervision(&current, &current.clone()), SupervisionPlan::default());
}

#[test]
fn formats_status_timestamps() {
    assert_eq!(format_timestamp(0), "never");
    assert_eq!(format_timestamp(1_700_000_000), "2023-11-14T22:13:20Z");
}

#[tokio::test]
async fn bootstrap_seeds_accounts_and_reports_status() {
    let dir = tempdir().unwrap();
    let sync_root = dir.path().join("mirror");
    let accounts_path = dir.path().join("accounts.json");
    let seed = serde_json::json!({
        "accounts": [
            {
                "id": 3,
                "instance_url": "https://ecm.example.com",
                "sync_path": sync_root.to_string_lossy(),
                "sync_frequency": 60
            },
            {
                "id": 4,
                "instance_url": "https://other.example.com",
                "sync_path": sync_root.join("other").to_string_lossy(),
                "sync_enabled": false
            }
        ]
    });
    std::fs::write(&accounts_path, seed.to_string()).unwrap();

    let home = dir.path().to_path_buf();
    let config = DaemonConfig::from_lookup(
        &home,
        dir.path().join("index.db"),
        lookup_from(&[
            ("DOCSYNC_ACCOUNTS_FILE", accounts_path.to_str().unwrap()),
            ("DOCSYNC_AUTH_HEADER", "Basic dGVzdDp0ZXN0"),
        ]),
    );
    let daemon = DaemonRuntime::bootstrap(config, false).await.unwrap();

    let results = daemon.sync_now(None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, 3);
    assert!(results[0].1.is_some_and(|stats| stats.is_quiet()));

    let status = daemon.status().await.unwrap();
    assert_eq!(status.len(), 2);
    assert!(status[0].sync_enabled);
    assert!(!status[0].sync_in_progress);
    assert!(status[0].last_synced_at > 0);
    assert_eq!(status[1].last_synced_at, 0);
    assert!(status[1].to_string().contains("last_sync=never"));
}

#[tokio::test]
async fn bootstrap_clears_flags_left_by_a_crash() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("index.db");
    {
        let index = IndexStore::open(&db_path).await.unwrap();
        let seed: crate::accounts::AccountsFile = serde_json::from_value(serde_json::json!({
            "accounts": [{ "id": 1, "instance_url": "https://ecm.example.com", "sync_path": "/tmp/x" }]
        }))
        .unwrap();
        index
            .upsert_account(&seed.accounts[0], Path::new("/tmp/x"))
            .await
            .unwrap();
        assert!(index.try_begin_sync(1).await.unwrap());
    }

    let config = DaemonConfig::from_lookup(dir.path(), db_path, lookup_from(&[]));
    let daemon = DaemonRuntime::bootstrap(config, true).await.unwrap();
    let status = daemon.status().await.unwrap();
    assert!(!status[0].sync_in_progress);
}

#[tokio::test]
async fn one_shot_bootstrap_keeps_a_running_daemon_lock() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("index.db");
    let sync_root = dir.path().join("mirror");
    let accounts_path = dir.path().join("accounts.json");
    let seed = serde_json::json!({
        "accounts": [{
            "id": 1,
            "instance_url": "https://ecm.example.com",
            "sync_path": sync_root.to_string_lossy()
        }]
    });
    std::fs::write(&accounts_path, seed.to_string()).unwrap();
    let lookup = [
        ("DOCSYNC_ACCOUNTS_FILE", accounts_path.to_str().unwrap()),
        ("DOCSYNC_AUTH_HEADER", "Basic dGVzdDp0ZXN0"),
    ];

    let running = DaemonRuntime::bootstrap(
        DaemonConfig::from_lookup(dir.path(), db_path.clone(), lookup_from(&lookup)),
        true,
    )
    .await
    .unwrap();
    assert!(running.engine().index().try_begin_sync(1).await.unwrap());

    let cli = DaemonRuntime::bootstrap(
        DaemonConfig::from_lookup(dir.path(), db_path, lookup_from(&lookup)),
        false,
    )
    .await
    .unwrap();
    assert!(cli.status().await.unwrap()[0].sync_in_progress);
    assert_eq!(cli.sync_now(Some(1)).await.unwrap(), vec![(1, None)]);
    assert!(!cli.engine().index().try_begin_sync(1).await.unwrap());
}
