use wiremock::matchers::{any, body_string_contains, header, method, path};
use wiremock::{Mock, ResponseTemplate};

use super::*;
use crate::sync::clock::now_unix;
use crate::sync::index::NodeState;

#[tokio::test]
async fn synced_record_missing_remotely_is_removed_locally() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("report.pdf", "x-report", now - 7200, now - 3600)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/x-report")))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.deleted_local, 1);
    assert_eq!(stats.uploaded, 0);
    assert!(!h.local("report.pdf").exists());
    assert!(h.record("report.pdf").await.is_none());
    assert_eq!(h.engine.index().purge_deleted(1).await.unwrap(), 1);
}

#[tokio::test]
async fn new_local_file_is_created_once() {
    let h = Harness::new().await;
    std::fs::write(h.local("draft.txt"), b"first draft").unwrap();
    let now = now_unix();

    Mock::given(method("POST"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .and(header("authorization", AUTH))
        .and(body_string_contains("draft.txt"))
        .respond_with(ResponseTemplate::new(201).set_body_json(entry_json(node_json(
            "n-draft", "draft.txt", false, "", now,
        ))))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-draft")))
        .respond_with(ResponseTemplate::new(200).set_body_json(entry_json(node_json(
            "n-draft", "draft.txt", false, "", now,
        ))))
        .mount(&h.server)
        .await;

    let first = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert_eq!(first.created_remote, 1);

    let record = h.record("draft.txt").await.unwrap();
    assert_eq!(record.state(), NodeState::Synced);
    assert_eq!(record.remote_node_id.as_deref(), Some("n-draft"));
    assert_eq!(record.remote_folder_path, WATCH_FOLDER);
    assert!(record.last_uploaded_at >= now);

    let second = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert!(second.is_quiet());
    assert_eq!(h.requests_matching("POST", &format!("{NODES}/{WATCH_NODE}/children")).await, 1);

    // The second run only confirms the node; it never writes.
    let requests = h.server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.iter().filter(|req| req.method.as_str() != "GET").count(), 1);
    assert_eq!(h.requests_matching("GET", &format!("{NODES}/n-draft")).await, 1);
}

#[tokio::test]
async fn new_local_folder_is_created_before_its_files() {
    let h = Harness::new().await;
    std::fs::create_dir_all(h.local("reports")).unwrap();
    std::fs::write(h.local("reports/q1.txt"), b"quarter one").unwrap();
    let now = now_unix();

    Mock::given(method("POST"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .and(body_string_contains("cm:folder"))
        .respond_with(ResponseTemplate::new(201).set_body_json(entry_json(node_json(
            "f-reports", "reports", true, "", now,
        ))))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .and(body_string_contains("relativePath"))
        .and(body_string_contains("q1.txt"))
        .respond_with(ResponseTemplate::new(201).set_body_json(entry_json(node_json(
            "n-q1", "q1.txt", false, "reports", now,
        ))))
        .expect(1)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.created_remote, 2);
    assert_eq!(stats.failures, 0);

    let folder = h.record("reports").await.unwrap();
    assert!(folder.is_folder());
    assert_eq!(folder.remote_node_id.as_deref(), Some("f-reports"));
    let file = h.record("reports/q1.txt").await.unwrap();
    assert_eq!(file.remote_folder_path, format!("{WATCH_FOLDER}/reports"));
    assert_eq!(file.local_folder_path, h.key("reports"));

    let events = h.engine.index().list_events().await.unwrap();
    let creates: Vec<&str> = events
        .iter()
        .filter(|(kind, _)| kind == "remote-create")
        .map(|(_, path)| path.as_str())
        .collect();
    assert_eq!(creates, vec![h.key("reports"), h.key("reports/q1.txt")]);
}

#[tokio::test]
async fn name_conflict_keeps_local_version_without_retrying() {
    let h = Harness::new().await;
    let file = h.local("budget.xlsx");
    std::fs::write(&file, b"numbers").unwrap();
    set_local_mtime(&file, now_unix() - 120).unwrap();

    Mock::given(method("POST"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&h.server)
        .await;

    let first = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert_eq!(first.failures, 0);
    assert_eq!(first.created_remote, 0);

    let record = h.record("budget.xlsx").await.unwrap();
    assert_eq!(record.state(), NodeState::Creating);
    assert_eq!(record.last_uploaded_at, mtime_of(&file));

    let second = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert!(second.is_quiet());
}

#[tokio::test]
async fn newer_local_edit_is_uploaded_with_overwrite() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("memo.txt", "n-memo", now - 3600, now - 3600)
        .await;
    let file = h.local("memo.txt");
    std::fs::write(&file, b"edited locally").unwrap();
    set_local_mtime(&file, now - 30).unwrap();

    Mock::given(method("POST"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .and(body_string_contains("overwrite"))
        .and(body_string_contains("edited locally"))
        .respond_with(ResponseTemplate::new(201).set_body_json(entry_json(node_json(
            "n-memo", "memo.txt", false, "", now,
        ))))
        .expect(1)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.uploaded, 1);

    let record = h.record("memo.txt").await.unwrap();
    assert!(!record.upload_in_progress);
    assert!(record.last_uploaded_at >= now);
    assert_eq!(record.file_update_at, now);
    assert_eq!(record.last_downloaded_at, now - 3600);
}

#[tokio::test]
async fn empty_and_partial_files_are_skipped() {
    let h = Harness::new().await;
    std::fs::write(h.local("empty.txt"), b"").unwrap();
    std::fs::write(h.local("incoming.pdf.partial"), b"half").unwrap();

    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert!(stats.is_quiet());
    assert_eq!(h.engine.index().count_live(1).await.unwrap(), 0);
}

#[tokio::test]
async fn one_failing_path_does_not_stop_the_walk() {
    let h = Harness::new().await;
    std::fs::write(h.local("a.txt"), b"alpha").unwrap();
    std::fs::write(h.local("b.txt"), b"beta").unwrap();
    let now = now_unix();

    Mock::given(method("POST"))
        .and(body_string_contains("a.txt"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(body_string_contains("b.txt"))
        .respond_with(ResponseTemplate::new(201).set_body_json(entry_json(node_json(
            "n-b", "b.txt", false, "", now,
        ))))
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.created_remote, 1);
    assert!(h.record("a.txt").await.is_none());
    assert!(h.record("b.txt").await.is_some());
    assert_eq!(h.engine.index().list_errors().await.unwrap().len(), 1);
}

#[tokio::test]
async fn record_with_download_in_flight_is_left_alone() {
    let h = Harness::new().await;
    let now = now_unix();
    let record = h
        .seed_synced_file("slides.pptx", "n-slides", now - 3600, now - 3600)
        .await;
    assert!(h.engine.index().set_download_progress(record.id, true).await.unwrap());
    let file = h.local("slides.pptx");
    std::fs::write(&file, b"half written").unwrap();
    set_local_mtime(&file, now - 20).unwrap();

    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert!(stats.is_quiet());
    let record = h.record("slides.pptx").await.unwrap();
    assert!(record.download_in_progress);
    assert_eq!(record.last_uploaded_at, 0);
}

#[tokio::test]
async fn node_moved_to_another_folder_drops_local_mirror() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("contract.pdf", "n-contract", now - 3600, now - 3600)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-contract")))
        .respond_with(ResponseTemplate::new(200).set_body_json(entry_json(node_json(
            "n-contract", "contract.pdf", false, "Archive", now - 3600,
        ))))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&h.server)
        .await;

    let stats = h.engine.reconcile_upload(&h.account, &h.scope).await.unwrap();
    assert_eq!(stats.deleted_local, 1);
    assert_eq!(stats.failures, 0);
    assert!(!h.local("contract.pdf").exists());
    assert!(h.record("contract.pdf").await.is_none());
}

#[tokio::test]
async fn losing_a_create_race_keeps_the_winning_record() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("shared.txt", "n-shared", now - 3600, now - 3600)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&h.server)
        .await;

    let stats = h
        .engine
        .create_remote(&h.account, &h.scope, &h.local("shared.txt"), false)
        .await
        .unwrap();
    assert!(stats.is_quiet());
    let record = h.record("shared.txt").await.unwrap();
    assert_eq!(record.remote_node_id.as_deref(), Some("n-shared"));
    assert_eq!(record.last_downloaded_at, now - 3600);
    assert_eq!(record.state(), NodeState::Synced);
}
