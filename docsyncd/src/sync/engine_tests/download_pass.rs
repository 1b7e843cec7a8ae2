use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use super::*;
use crate::sync::clock::now_unix;
use crate::sync::index::NodeKind;

async fn mount_docs_tree(h: &Harness) {
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![node_json(
            "f-docs", "docs", true, "", T,
        )])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/f-docs/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![node_json(
            "n-a", "a.txt", false, "docs", T,
        )])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-a/content")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .expect(1)
        .mount(&h.server)
        .await;
}

#[tokio::test]
async fn empty_mirror_downloads_remote_tree() {
    let h = Harness::new().await;
    mount_docs_tree(&h).await;

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.downloaded, 1);
    assert_eq!(stats.created_local, 1);
    assert_eq!(stats.failures, 0);

    let file = h.local("docs/a.txt");
    assert!(h.local("docs").is_dir());
    assert_eq!(std::fs::read(&file).unwrap(), b"hello");
    assert_eq!(mtime_of(&file), T);

    let folder = h.record("docs").await.unwrap();
    assert_eq!(folder.kind, NodeKind::Folder);
    assert_eq!(folder.remote_node_id.as_deref(), Some("f-docs"));
    let record = h.record("docs/a.txt").await.unwrap();
    assert_eq!(record.remote_node_id.as_deref(), Some("n-a"));
    assert_eq!(record.remote_folder_path, format!("{WATCH_FOLDER}/docs"));
    assert_eq!(record.file_update_at, T);
    assert!((now_unix() - record.last_downloaded_at).abs() <= 5);
    assert_eq!(h.engine.index().count_live(1).await.unwrap(), 2);
    assert!(!h.local("docs/a.txt.partial").exists());
}

#[tokio::test]
async fn full_pass_does_not_echo_downloads() {
    let h = Harness::new().await;
    mount_docs_tree(&h).await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/f-docs")))
        .respond_with(ResponseTemplate::new(200).set_body_json(entry_json(node_json(
            "f-docs", "docs", true, "", T,
        ))))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-a")))
        .respond_with(ResponseTemplate::new(200).set_body_json(entry_json(node_json(
            "n-a", "a.txt", false, "docs", T,
        ))))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&h.server)
        .await;

    let stats = h.engine.sync_account(1).await.unwrap().unwrap();
    assert_eq!(stats.downloaded, 1);
    assert_eq!(stats.uploaded, 0);
    assert_eq!(stats.created_remote, 0);
    assert_eq!(stats.failures, 0);

    let account = h.engine.index().get_account(1).await.unwrap().unwrap();
    assert!(!account.sync_in_progress);
    assert!(account.last_synced_at > 0);
}

#[tokio::test]
async fn pass_is_skipped_while_another_holds_the_lock() {
    let h = Harness::new().await;
    assert!(h.engine.index().try_begin_sync(1).await.unwrap());

    assert_eq!(h.engine.sync_account(1).await.unwrap(), None);
    assert!(h.server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn unknown_account_is_an_error() {
    let h = Harness::new().await;
    let err = h.engine.sync_account(42).await.unwrap_err();
    assert!(matches!(err, EngineError::AccountNotFound(42)));
}

#[tokio::test]
async fn listing_follows_pagination() {
    let h = Harness::new().await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .and(query_param("skipCount", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "list": {
                "pagination": { "count": 1, "hasMoreItems": true, "skipCount": 0 },
                "entries": [{ "entry": node_json("n-1", "one.txt", false, "", T) }]
            }
        })))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .and(query_param("skipCount", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![node_json(
            "n-2", "two.txt", false, "", T,
        )])))
        .mount(&h.server)
        .await;
    for id in ["n-1", "n-2"] {
        Mock::given(method("GET"))
            .and(path(format!("{NODES}/{id}/content")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(id.as_bytes().to_vec()))
            .mount(&h.server)
            .await;
    }

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.downloaded, 2);
    assert_eq!(std::fs::read(h.local("one.txt")).unwrap(), b"n-1");
    assert_eq!(std::fs::read(h.local("two.txt")).unwrap(), b"n-2");
}

#[tokio::test]
async fn remote_rename_replaces_local_copy() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("old.txt", "n-r", T, now - 3600).await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![node_json(
            "n-r", "new.txt", false, "", T,
        )])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-r/content")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"renamed".to_vec()))
        .expect(1)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.renamed, 1);
    assert_eq!(stats.downloaded, 1);
    assert!(!h.local("old.txt").exists());
    assert_eq!(std::fs::read(h.local("new.txt")).unwrap(), b"renamed");
    assert!(h.record("old.txt").await.is_none());
    assert_eq!(
        h.record("new.txt").await.unwrap().remote_node_id.as_deref(),
        Some("n-r")
    );
}

#[tokio::test]
async fn remote_deletion_is_swept_after_complete_walk() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("stale.txt", "n-s", T, now - 3600).await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(Vec::new())))
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.deleted_local, 1);
    assert!(!h.local("stale.txt").exists());
    assert!(h.record("stale.txt").await.is_none());

    let events = h.engine.index().list_events().await.unwrap();
    assert!(events.iter().any(|(kind, path)| kind == "local-delete" && *path == h.key("stale.txt")));
}

#[tokio::test]
async fn failed_listing_skips_deletion_sweep() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("keep.txt", "n-k", T, now - 3600).await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.deleted_local, 0);
    assert!(h.local("keep.txt").exists());
    assert!(h.record("keep.txt").await.is_some());
    assert_eq!(h.engine.index().list_errors().await.unwrap().len(), 1);
}

#[tokio::test]
async fn record_created_after_conflict_adopts_remote_id() {
    let h = Harness::new().await;
    let report = h.local("report.pdf");
    std::fs::write(&report, b"local version").unwrap();
    set_local_mtime(&report, T + 100).unwrap();
    h.engine
        .index()
        .insert_replace(&NodeInput {
            account_id: 1,
            watcher_id: h.scope.mapping.id,
            remote_node_id: None,
            remote_folder_path: WATCH_FOLDER.into(),
            local_file_path: h.key("report.pdf"),
            local_folder_path: path_key(&h.scope.local_root),
            file_update_at: T + 100,
            last_uploaded_at: T + 100,
            last_downloaded_at: 0,
            kind: NodeKind::File,
        })
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![node_json(
            "n-p", "report.pdf", false, "", T + 50,
        )])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-p/content")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert!(stats.is_quiet());
    let record = h.record("report.pdf").await.unwrap();
    assert_eq!(record.remote_node_id.as_deref(), Some("n-p"));
    assert_eq!(std::fs::read(&report).unwrap(), b"local version");
}

#[tokio::test]
async fn newer_remote_content_refreshes_local_copy() {
    let h = Harness::new().await;
    let now = now_unix();
    let edited = now - 60;
    h.seed_synced_file("memo.txt", "n-m", now - 3600, now - 3600).await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![node_json(
            "n-m", "memo.txt", false, "", edited,
        )])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-m/content")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"edited remotely".to_vec()))
        .expect(1)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.downloaded, 1);
    assert_eq!(std::fs::read(h.local("memo.txt")).unwrap(), b"edited remotely");
    assert_eq!(mtime_of(&h.local("memo.txt")), edited);

    let record = h.record("memo.txt").await.unwrap();
    assert_eq!(record.file_update_at, edited);
    assert!(!record.download_in_progress);
    assert!(record.last_downloaded_at >= now);
}

#[tokio::test]
async fn newer_local_copy_only_tracks_remote_time() {
    let h = Harness::new().await;
    let now = now_unix();
    let remote_edit = now - 600;
    h.seed_synced_file("budget.xlsx", "n-b", now - 3600, now - 3600).await;
    set_local_mtime(&h.local("budget.xlsx"), now - 30).unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![node_json(
            "n-b", "budget.xlsx", false, "", remote_edit,
        )])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-b/content")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.downloaded, 0);
    assert_eq!(std::fs::read(h.local("budget.xlsx")).unwrap(), b"synced content");
    assert_eq!(h.record("budget.xlsx").await.unwrap().file_update_at, remote_edit);
}

#[tokio::test]
async fn local_deletion_wins_over_remote_listing() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("obsolete.txt", "n-obs", now - 3600, now - 3600)
        .await;
    std::fs::remove_file(h.local("obsolete.txt")).unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![node_json(
            "n-obs", "obsolete.txt", false, "", now - 3600,
        )])))
        .mount(&h.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{NODES}/n-obs")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-obs/content")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.deleted_remote, 1);
    assert_eq!(stats.downloaded, 0);
    assert!(!h.local("obsolete.txt").exists());
    assert!(h.record("obsolete.txt").await.is_none());
}

#[tokio::test]
async fn remote_change_right_after_an_upload_is_not_fetched() {
    let h = Harness::new().await;
    let now = now_unix();
    let seeded = h
        .seed_synced_file("plan.md", "n-plan", now - 3600, now - 3600)
        .await;
    h.engine
        .index()
        .record_upload(seeded.id, now, now - 3600)
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_json(vec![node_json(
            "n-plan", "plan.md", false, "", now - 1,
        )])))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-plan/content")))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_download(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.downloaded, 0);
    assert_eq!(std::fs::read(h.local("plan.md")).unwrap(), b"synced content");
    // Left untouched so a later pass still sees the remote as newer.
    assert_eq!(h.record("plan.md").await.unwrap().file_update_at, now - 3600);
}
