use super::*;
use sqlx::SqlitePool;

async fn make_store() -> IndexStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = IndexStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn file_input(path: &str, remote_id: Option<&str>) -> NodeInput {
    let (folder, _) = path.rsplit_once('/').unwrap();
    NodeInput {
        account_id: 1,
        watcher_id: 1,
        remote_node_id: remote_id.map(str::to_string),
        remote_folder_path: "/Company Home/Sites/s/documentLibrary".into(),
        local_file_path: path.into(),
        local_folder_path: folder.into(),
        file_update_at: 1_700_000_000,
        last_uploaded_at: 0,
        last_downloaded_at: 0,
        kind: NodeKind::File,
    }
}

fn folder_input(path: &str, remote_id: &str) -> NodeInput {
    NodeInput {
        kind: NodeKind::Folder,
        ..file_input(path, Some(remote_id))
    }
}

#[tokio::test]
async fn insert_and_fetch_by_both_keys() {
    let store = make_store().await;
    let inserted = store
        .insert_replace(&file_input("/sync/s/a.txt", Some("n1")))
        .await
        .unwrap();

    let by_path = store.get_by_local_path(1, "/sync/s/a.txt").await.unwrap();
    let by_remote = store.get_by_remote_node_id(1, "n1").await.unwrap();

    assert_eq!(by_path.as_ref(), Some(&inserted));
    assert_eq!(by_remote, Some(inserted.clone()));
    assert_eq!(inserted.state(), NodeState::Synced);
    assert!(store.get_by_local_path(2, "/sync/s/a.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn insert_replace_keeps_one_live_row_per_path() {
    let store = make_store().await;
    store
        .insert_replace(&file_input("/sync/s/a.txt", Some("old")))
        .await
        .unwrap();
    let fresh = store
        .insert_replace(&file_input("/sync/s/a.txt", Some("new")))
        .await
        .unwrap();

    assert_eq!(fresh.remote_node_id.as_deref(), Some("new"));
    assert!(store.get_by_remote_node_id(1, "old").await.unwrap().is_none());
    assert_eq!(store.count_live(1).await.unwrap(), 1);
}

#[tokio::test]
async fn record_without_remote_id_is_creating() {
    let store = make_store().await;
    let record = store
        .insert_replace(&file_input("/sync/s/a.txt", None))
        .await
        .unwrap();
    assert_eq!(record.state(), NodeState::Creating);

    store
        .set_remote_node_id(record.id, "n9", "/Company Home/x")
        .await
        .unwrap();
    let record = store.get_by_remote_node_id(1, "n9").await.unwrap().unwrap();
    assert_eq!(record.remote_folder_path, "/Company Home/x");
    assert_eq!(record.state(), NodeState::Synced);
}

#[tokio::test]
async fn list_by_prefix_does_not_match_sibling_names() {
    let store = make_store().await;
    store
        .insert_replace(&folder_input("/sync/s/docs", "f1"))
        .await
        .unwrap();
    store
        .insert_replace(&file_input("/sync/s/docs/a.txt", Some("n1")))
        .await
        .unwrap();
    store
        .insert_replace(&file_input("/sync/s/docs-old/b.txt", Some("n2")))
        .await
        .unwrap();

    let rows = store.list_by_prefix(1, "/sync/s/docs").await.unwrap();
    let paths: Vec<_> = rows.iter().map(|r| r.local_file_path.as_str()).collect();
    assert_eq!(paths, vec!["/sync/s/docs", "/sync/s/docs/a.txt"]);
}

#[tokio::test]
async fn mark_deleted_cascades_to_descendants() {
    let store = make_store().await;
    store
        .insert_replace(&folder_input("/sync/s/docs", "f1"))
        .await
        .unwrap();
    store
        .insert_replace(&file_input("/sync/s/docs/a.txt", Some("n1")))
        .await
        .unwrap();
    store
        .insert_replace(&file_input("/sync/s/docs/sub/b.txt", Some("n2")))
        .await
        .unwrap();
    store
        .insert_replace(&file_input("/sync/s/other.txt", Some("n3")))
        .await
        .unwrap();

    let retired = store.mark_deleted(1, "/sync/s/docs").await.unwrap();

    assert_eq!(retired, 3);
    assert_eq!(store.count_live(1).await.unwrap(), 1);
    assert!(store.get_by_remote_node_id(1, "n2").await.unwrap().is_none());

    // A fresh record can reuse a retired path.
    let again = store
        .insert_replace(&file_input("/sync/s/docs/a.txt", Some("n4")))
        .await
        .unwrap();
    assert_eq!(again.state(), NodeState::Synced);

    assert_eq!(store.purge_deleted(1).await.unwrap(), 2);
}

#[tokio::test]
async fn get_missing_returns_records_absent_from_candidates() {
    let store = make_store().await;
    store
        .insert_replace(&file_input("/sync/s/a.txt", Some("n1")))
        .await
        .unwrap();
    store
        .insert_replace(&file_input("/sync/s/b.txt", Some("n2")))
        .await
        .unwrap();
    let mut other = file_input("/sync/t/c.txt", Some("n3"));
    other.watcher_id = 2;
    store.insert_replace(&other).await.unwrap();

    let present: HashSet<String> = ["/sync/s/a.txt".to_string()].into_iter().collect();
    let missing = store.get_missing(1, 1, &present).await.unwrap();

    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].local_file_path, "/sync/s/b.txt");
}

#[tokio::test]
async fn progress_flags_are_mutually_exclusive() {
    let store = make_store().await;
    let record = store
        .insert_replace(&file_input("/sync/s/a.txt", Some("n1")))
        .await
        .unwrap();

    assert!(store.set_download_progress(record.id, true).await.unwrap());
    assert!(!store.set_upload_progress(record.id, true).await.unwrap());

    let current = store.get_by_local_path(1, "/sync/s/a.txt").await.unwrap().unwrap();
    assert_eq!(current.state(), NodeState::DownloadPending);

    assert!(store.set_download_progress(record.id, false).await.unwrap());
    assert!(store.set_upload_progress(record.id, true).await.unwrap());
    assert_eq!(store.clear_stale_progress().await.unwrap(), 1);
}

#[tokio::test]
async fn transfer_timestamps_never_decrease() {
    let store = make_store().await;
    let record = store
        .insert_replace(&file_input("/sync/s/a.txt", Some("n1")))
        .await
        .unwrap();

    store.record_upload(record.id, 200, 150).await.unwrap();
    store.record_upload(record.id, 100, 160).await.unwrap();
    store.record_download(record.id, 300, 170).await.unwrap();
    store.record_download(record.id, 250, 180).await.unwrap();

    let current = store.get_by_local_path(1, "/sync/s/a.txt").await.unwrap().unwrap();
    assert_eq!(current.last_uploaded_at, 200);
    assert_eq!(current.last_downloaded_at, 300);
    assert_eq!(current.file_update_at, 180);
}

#[tokio::test]
async fn work_queue_dedupes_and_orders_by_priority() {
    let store = make_store().await;
    let item = |path: &str, priority: i32| NewWorkItem {
        account_id: 1,
        watcher_id: 1,
        file_path: path.into(),
        root_node_id: "root".into(),
        priority,
    };

    store.enqueue_work(&item("/sync/s/a.txt", 0)).await.unwrap();
    store.enqueue_work(&item("/sync/s/a.txt", 0)).await.unwrap();
    store.enqueue_work(&item("/sync/s/a.txt", 0)).await.unwrap();
    store.enqueue_work(&item("/sync/s/docs", 10)).await.unwrap();

    assert_eq!(store.queue_len(Some(1)).await.unwrap(), 2);

    let first = store.claim_next_work().await.unwrap().unwrap();
    let second = store.claim_next_work().await.unwrap().unwrap();
    assert_eq!(first.file_path, "/sync/s/docs");
    assert_eq!(second.file_path, "/sync/s/a.txt");
    assert!(store.claim_next_work().await.unwrap().is_none());
    assert_eq!(store.queue_len(None).await.unwrap(), 0);
}

#[tokio::test]
async fn audit_logs_are_trimmed_to_retention() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = IndexStore::from_pool(pool).with_audit_retention(2);
    store.init().await.unwrap();

    for i in 0..5 {
        store
            .record_error(Some(1), "upload", &format!("failure {i}"))
            .await
            .unwrap();
    }
    store.record_event(Some(1), "download", "/sync/s/a.txt", Some("n1")).await.unwrap();

    let errors = store.list_errors().await.unwrap();
    let messages: Vec<_> = errors.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["failure 3", "failure 4"]);
    assert_eq!(
        store.list_events().await.unwrap(),
        vec![("download".to_string(), "/sync/s/a.txt".to_string())]
    );
}
