use std::time::Instant;

use wiremock::matchers::{any, method, path};
use wiremock::{Mock, ResponseTemplate};

use super::*;
use crate::sync::clock::now_unix;
use crate::sync::queue::NewWorkItem;
use crate::sync::watch::AccountWatch;
use crate::sync::worker::WorkerTick;

fn watch_for(h: &Harness) -> AccountWatch {
    AccountWatch::new(
        Arc::clone(&h.engine),
        h.account.clone(),
        vec![h.scope.clone()],
        Duration::from_secs(1),
    )
}

#[tokio::test]
async fn rapid_writes_become_one_work_item() {
    let h = Harness::new().await;
    let mut watch = watch_for(&h);
    let file = h.local("notes.txt");

    let t0 = Instant::now();
    for (step, body) in ["one", "one two", "one two three"].into_iter().enumerate() {
        std::fs::write(&file, body).unwrap();
        watch.note(file.clone(), t0 + Duration::from_millis(100 * step as u64));
    }

    assert_eq!(watch.flush(t0 + Duration::from_millis(700)).await, 0);
    assert_eq!(watch.flush(t0 + Duration::from_millis(1300)).await, 1);
    assert_eq!(h.engine.index().queue_len(Some(1)).await.unwrap(), 1);

    let item = h.engine.index().claim_next_work().await.unwrap().unwrap();
    assert_eq!(item.file_path, h.key("notes.txt"));
    assert_eq!(item.root_node_id, WATCH_NODE);
    assert!(h.server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn repeated_events_for_a_queued_path_are_deduplicated() {
    let h = Harness::new().await;
    let mut watch = watch_for(&h);
    let file = h.local("notes.txt");
    let t0 = Instant::now();

    std::fs::write(&file, b"v1").unwrap();
    watch.note(file.clone(), t0);
    assert_eq!(watch.flush(t0 + Duration::from_secs(2)).await, 1);

    std::fs::write(&file, b"v2 longer").unwrap();
    watch.note(file.clone(), t0 + Duration::from_secs(3));
    assert_eq!(watch.flush(t0 + Duration::from_secs(5)).await, 1);

    assert_eq!(h.engine.index().queue_len(None).await.unwrap(), 1);
}

#[tokio::test]
async fn worker_creates_queued_file_remotely() {
    let h = Harness::new().await;
    let file = h.local("todo.txt");
    std::fs::write(&file, b"buy milk").unwrap();
    let now = now_unix();
    h.engine
        .index()
        .enqueue_work(&NewWorkItem::for_path(1, h.scope.mapping.id, h.key("todo.txt"), WATCH_NODE, false))
        .await
        .unwrap();

    Mock::given(method("POST"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(201).set_body_json(entry_json(node_json(
            "n-todo", "todo.txt", false, "", now,
        ))))
        .expect(1)
        .mount(&h.server)
        .await;

    let tick = h.engine.process_next_work_item().await.unwrap();
    let WorkerTick::Processed(stats) = tick else {
        panic!("expected a processed item, got {tick:?}");
    };
    assert_eq!(stats.created_remote, 1);
    assert_eq!(
        h.record("todo.txt").await.unwrap().remote_node_id.as_deref(),
        Some("n-todo")
    );
    assert_eq!(h.engine.process_next_work_item().await.unwrap(), WorkerTick::Idle);
}

#[tokio::test]
async fn server_error_makes_worker_back_off_and_consumes_item() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("ledger.csv", "n-ledger", now - 3600, now - 3600)
        .await;
    h.engine
        .index()
        .enqueue_work(&NewWorkItem::for_path(1, h.scope.mapping.id, h.key("ledger.csv"), WATCH_NODE, false))
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-ledger")))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&h.server)
        .await;

    assert_eq!(h.engine.process_next_work_item().await.unwrap(), WorkerTick::Transient);
    assert_eq!(h.engine.index().queue_len(None).await.unwrap(), 0);
    assert_eq!(h.engine.index().list_errors().await.unwrap().len(), 1);
    assert!(h.local("ledger.csv").exists());
}

#[tokio::test]
async fn worker_uploads_local_edit_newer_than_remote() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("plan.md", "n-plan", now - 3600, now - 3600)
        .await;
    let file = h.local("plan.md");
    std::fs::write(&file, b"# revised plan").unwrap();
    set_local_mtime(&file, now - 20).unwrap();
    h.engine
        .index()
        .enqueue_work(&NewWorkItem::for_path(1, h.scope.mapping.id, h.key("plan.md"), WATCH_NODE, false))
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-plan")))
        .respond_with(ResponseTemplate::new(200).set_body_json(entry_json(node_json(
            "n-plan", "plan.md", false, "", now - 3600,
        ))))
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{NODES}/{WATCH_NODE}/children")))
        .respond_with(ResponseTemplate::new(201).set_body_json(entry_json(node_json(
            "n-plan", "plan.md", false, "", now,
        ))))
        .expect(1)
        .mount(&h.server)
        .await;

    let tick = h.engine.process_next_work_item().await.unwrap();
    assert_eq!(
        tick,
        WorkerTick::Processed(PassStats {
            uploaded: 1,
            ..PassStats::default()
        })
    );
    assert!(h.record("plan.md").await.unwrap().last_uploaded_at >= now);
}

#[tokio::test]
async fn worker_drops_mirror_of_node_deleted_remotely() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("old.docx", "n-old", now - 3600, now - 3600)
        .await;
    h.engine
        .index()
        .enqueue_work(&NewWorkItem::for_path(1, h.scope.mapping.id, h.key("old.docx"), WATCH_NODE, false))
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-old")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&h.server)
        .await;

    let tick = h.engine.process_next_work_item().await.unwrap();
    assert_eq!(
        tick,
        WorkerTick::Processed(PassStats {
            deleted_local: 1,
            ..PassStats::default()
        })
    );
    assert!(!h.local("old.docx").exists());
    assert!(h.record("old.docx").await.is_none());
}

#[tokio::test]
async fn local_removal_of_synced_file_deletes_remote_node() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("minutes.txt", "n-min", now - 3600, now - 3600)
        .await;
    let mut watch = watch_for(&h);

    Mock::given(method("DELETE"))
        .and(path(format!("{NODES}/n-min")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&h.server)
        .await;

    let file = h.local("minutes.txt");
    std::fs::remove_file(&file).unwrap();
    let t0 = Instant::now();
    watch.note(file, t0);
    assert_eq!(watch.flush(t0 + Duration::from_secs(2)).await, 1);

    assert!(h.record("minutes.txt").await.is_none());
    assert_eq!(h.engine.index().queue_len(None).await.unwrap(), 0);
    let events = h.engine.index().list_events().await.unwrap();
    assert!(events.iter().any(|(kind, _)| kind == "remote-delete"));
}

#[tokio::test]
async fn removal_of_never_synced_path_makes_no_remote_call() {
    let h = Harness::new().await;
    let orphan = h.local("scratch.tmp");
    std::fs::write(&orphan, b"temp").unwrap();
    let mut watch = watch_for(&h);

    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&h.server)
        .await;

    std::fs::remove_file(&orphan).unwrap();
    let t0 = Instant::now();
    watch.note(orphan, t0);
    assert_eq!(watch.flush(t0 + Duration::from_secs(2)).await, 1);
    assert_eq!(h.engine.index().count_live(1).await.unwrap(), 0);
}

#[tokio::test]
async fn events_outside_watched_folders_are_ignored() {
    let h = Harness::new().await;
    let outside = h.account.sync_path.join("elsewhere.txt");
    std::fs::write(&outside, b"not mapped").unwrap();

    let event = crate::sync::local_watcher::LocalEvent {
        path: outside,
        change: crate::sync::local_watcher::FsChange::Created,
        is_dir: false,
    };
    let stats = h
        .engine
        .handle_local_event(&h.account, std::slice::from_ref(&h.scope), &event)
        .await
        .unwrap();
    assert!(stats.is_quiet());
    assert_eq!(h.engine.index().queue_len(None).await.unwrap(), 0);
}

#[tokio::test]
async fn worker_drops_mirror_of_node_moved_elsewhere() {
    let h = Harness::new().await;
    let now = now_unix();
    h.seed_synced_file("q3.xlsx", "n-q3", now - 3600, now - 3600)
        .await;
    h.engine
        .index()
        .enqueue_work(&NewWorkItem::for_path(1, h.scope.mapping.id, h.key("q3.xlsx"), WATCH_NODE, false))
        .await
        .unwrap();

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/n-q3")))
        .respond_with(ResponseTemplate::new(200).set_body_json(entry_json(node_json(
            "n-q3", "q3.xlsx", false, "Archive/2024", now - 3600,
        ))))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&h.server)
        .await;

    let tick = h.engine.process_next_work_item().await.unwrap();
    assert_eq!(
        tick,
        WorkerTick::Processed(PassStats {
            deleted_local: 1,
            ..PassStats::default()
        })
    );
    assert!(!h.local("q3.xlsx").exists());
    assert!(h.record("q3.xlsx").await.is_none());
}
