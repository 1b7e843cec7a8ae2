use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use sqlx::SqlitePool;
use tempfile::TempDir;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use wiremock::MockServer;

use super::*;
use crate::accounts::{AccountSeed, WatcherSeed};
use crate::storage::CredentialStore;
use crate::sync::clock::set_local_mtime;
use crate::sync::index::NodeKind;
use crate::sync::transport::HttpTransport;

mod download_pass;
mod upload_pass;
mod worker_queue;

const NODES: &str = "/alfresco/api/-default-/public/alfresco/versions/1/nodes";
const AUTH: &str = "Basic dGVzdDp0ZXN0";
const WATCH_FOLDER: &str = "/Company Home/Sites/finance/documentLibrary/Shared";
const WATCH_NODE: &str = "root";
/// 2024-01-01T00:00:00Z
const T: i64 = 1_704_067_200;

struct Harness {
    server: MockServer,
    _dir: TempDir,
    engine: Arc<SyncEngine>,
    account: Account,
    scope: WatchScope,
}

impl Harness {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();

        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let index = IndexStore::from_pool(pool);
        index.init().await.unwrap();

        let seed = AccountSeed {
            id: 1,
            instance_url: server.uri(),
            username: None,
            sync_path: dir.path().to_string_lossy().into_owned(),
            sync_enabled: true,
            sync_frequency: 300,
            watchers: vec![WatcherSeed {
                site_id: "finance".into(),
                document_library_node: "library".into(),
                watch_node: WATCH_NODE.into(),
                watch_folder: WATCH_FOLDER.into(),
            }],
        };
        index.upsert_account(&seed, dir.path()).await.unwrap();

        let transport = Arc::new(HttpTransport::new(
            CredentialStore::Static(AUTH.into()),
            Duration::from_secs(5),
        ));
        let engine = Arc::new(SyncEngine::new(index, transport, EngineSettings::default()));
        let account = engine.index().get_account(1).await.unwrap().unwrap();
        let scope = engine.scopes_for(&account).await.unwrap().remove(0);
        std::fs::create_dir_all(&scope.local_root).unwrap();

        Self {
            server,
            _dir: dir,
            engine,
            account,
            scope,
        }
    }

    fn local(&self, relative: &str) -> PathBuf {
        self.scope.local_root.join(relative)
    }

    fn key(&self, relative: &str) -> String {
        path_key(&self.local(relative))
    }

    async fn record(&self, relative: &str) -> Option<NodeRecord> {
        self.engine
            .index()
            .get_by_local_path(1, &self.key(relative))
            .await
            .unwrap()
    }

    /// Inserts a synced file record and writes its local copy with `mtime`.
    async fn seed_synced_file(
        &self,
        relative: &str,
        node_id: &str,
        mtime: i64,
        last_downloaded_at: i64,
    ) -> NodeRecord {
        let path = self.local(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"synced content").unwrap();
        set_local_mtime(&path, mtime).unwrap();

        let parent = path.parent().unwrap();
        let remote_folder = remote_folder_for_local(WATCH_FOLDER, &self.scope.local_root, parent).unwrap();
        self.engine
            .index()
            .insert_replace(&NodeInput {
                account_id: 1,
                watcher_id: self.scope.mapping.id,
                remote_node_id: Some(node_id.into()),
                remote_folder_path: remote_folder,
                local_file_path: path_key(&path),
                local_folder_path: path_key(parent),
                file_update_at: mtime,
                last_uploaded_at: 0,
                last_downloaded_at,
                kind: NodeKind::File,
            })
            .await
            .unwrap()
    }

    async fn requests_matching(&self, http_method: &str, url_path: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|req| req.method.as_str() == http_method && req.url.path() == url_path)
            .count()
    }
}

fn iso(unix: i64) -> String {
    OffsetDateTime::from_unix_timestamp(unix)
        .unwrap()
        .format(&Rfc3339)
        .unwrap()
}

fn remote_path(relative_parent: &str) -> String {
    if relative_parent.is_empty() {
        WATCH_FOLDER.to_string()
    } else {
        format!("{WATCH_FOLDER}/{relative_parent}")
    }
}

fn node_json(id: &str, name: &str, is_folder: bool, relative_parent: &str, modified: i64) -> Value {
    json!({
        "id": id,
        "name": name,
        "nodeType": if is_folder { "cm:folder" } else { "cm:content" },
        "isFolder": is_folder,
        "isFile": !is_folder,
        "modifiedAt": iso(modified),
        "createdAt": iso(modified),
        "path": { "name": remote_path(relative_parent), "isComplete": true }
    })
}

fn list_json(entries: Vec<Value>) -> Value {
    let count = entries.len();
    json!({
        "list": {
            "pagination": { "count": count, "hasMoreItems": false, "skipCount": 0 },
            "entries": entries.into_iter().map(|entry| json!({ "entry": entry })).collect::<Vec<_>>()
        }
    })
}

fn entry_json(node: Value) -> Value {
    json!({ "entry": node })
}

fn mtime_of(path: &Path) -> i64 {
    mtime_unix(&std::fs::metadata(path).unwrap())
}

#[test]
fn pass_stats_merge_and_quiet() {
    let mut stats = PassStats::default();
    assert!(stats.is_quiet());
    stats.merge(PassStats {
        downloaded: 2,
        failures: 1,
        ..PassStats::default()
    });
    stats.merge(PassStats {
        downloaded: 1,
        ..PassStats::default()
    });
    assert_eq!(stats.downloaded, 3);
    assert_eq!(stats.failures, 1);
    assert!(!stats.is_quiet());
}

#[tokio::test]
async fn scope_maps_remote_folders_to_local_paths() {
    let h = Harness::new().await;
    assert!(h.scope.local_root.ends_with("finance/Shared"));

    let nested = h.local("docs/a.txt");
    assert!(h.scope.contains(&nested));
    assert!(!h.scope.contains(&h.scope.local_root));
    assert_eq!(
        h.scope.remote_parent_for(&nested).as_deref(),
        Some("/Company Home/Sites/finance/documentLibrary/Shared/docs")
    );
    assert_eq!(h.scope.relative_parent_for(&nested).as_deref(), Some("docs"));
    assert_eq!(h.scope.relative_parent_for(&h.local("top.txt")), None);
}
