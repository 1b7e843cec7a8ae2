use docsync_core::{FileUpload, NodesClient};
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NODES: &str = "/alfresco/api/-default-/public/alfresco/versions/1/nodes";

fn node_json(id: &str, name: &str, folder: bool, parent: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "nodeType": if folder { "cm:folder" } else { "cm:content" },
        "isFolder": folder,
        "isFile": !folder,
        "modifiedAt": "2024-01-01T00:00:00.000+0000",
        "createdAt": "2023-12-31T00:00:00.000+0000",
        "parentId": "root",
        "path": { "name": parent, "isComplete": true }
    })
}

#[tokio::test]
async fn list_children_sends_auth_and_paging() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/root/children")))
        .and(query_param("skipCount", "0"))
        .and(query_param("maxItems", "2"))
        .and(query_param("include", "path"))
        .and(header("authorization", "Basic dGVzdA=="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "list": {
                "pagination": {
                    "count": 2,
                    "hasMoreItems": true,
                    "skipCount": 0,
                    "maxItems": 2
                },
                "entries": [
                    { "entry": node_json("n1", "docs", true, "/Company Home/Sites/s/documentLibrary") },
                    { "entry": node_json("n2", "a.txt", false, "/Company Home/Sites/s/documentLibrary") }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = NodesClient::new(&server.uri(), "Basic dGVzdA==").unwrap();
    let page = client.list_children("root", 0, 2).await.unwrap();

    assert!(page.has_more);
    assert_eq!(page.count, 2);
    assert_eq!(page.entries.len(), 2);
    assert!(page.entries[0].is_folder);
    assert_eq!(page.entries[1].name, "a.txt");
    assert_eq!(
        page.entries[1].parent_path(),
        Some("/Company Home/Sites/s/documentLibrary")
    );
    assert_eq!(page.entries[1].modified_unix().unwrap(), Some(1_704_067_200));
}

#[tokio::test]
async fn get_node_maps_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/gone")))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .mount(&server)
        .await;

    let client = NodesClient::new(&server.uri(), "Basic dGVzdA==").unwrap();
    let err = client.get_node("gone").await.unwrap_err();

    assert!(err.is_not_found());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn get_node_service_unavailable_is_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/busy")))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = NodesClient::new(&server.uri(), "Basic dGVzdA==").unwrap();
    let err = client.get_node("busy").await.unwrap_err();

    assert!(err.is_retryable());
}

#[tokio::test]
async fn create_folder_posts_relative_path() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{NODES}/root/children")))
        .and(body_json(json!({
            "name": "reports",
            "nodeType": "cm:folder",
            "relativePath": "docs/2024"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "entry": node_json("f1", "reports", true, "/Company Home/docs/2024")
        })))
        .mount(&server)
        .await;

    let client = NodesClient::new(&server.uri(), "Basic dGVzdA==").unwrap();
    let node = client
        .create_folder("root", "reports", Some("docs/2024"))
        .await
        .unwrap();

    assert_eq!(node.id, "f1");
    assert!(node.is_folder);
}

#[tokio::test]
async fn upload_file_sends_multipart_fields() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{NODES}/root/children")))
        .and(body_string_contains("name=\"filedata\""))
        .and(body_string_contains("name=\"relativePath\""))
        .and(body_string_contains("hello world"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "entry": node_json("c1", "a.txt", false, "/Company Home/docs")
        })))
        .mount(&server)
        .await;

    let client = NodesClient::new(&server.uri(), "Basic dGVzdA==").unwrap();
    let node = client
        .upload_file(
            "root",
            FileUpload {
                name: "a.txt".into(),
                relative_path: Some("docs".into()),
                overwrite: true,
                body: reqwest::Body::from("hello world"),
                length: 11,
            },
        )
        .await
        .unwrap();

    assert_eq!(node.id, "c1");
}

#[tokio::test]
async fn upload_conflict_is_classified() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{NODES}/root/children")))
        .respond_with(ResponseTemplate::new(409).set_body_string("duplicate"))
        .mount(&server)
        .await;

    let client = NodesClient::new(&server.uri(), "Basic dGVzdA==").unwrap();
    let err = client
        .upload_file(
            "root",
            FileUpload {
                name: "a.txt".into(),
                relative_path: None,
                overwrite: false,
                body: reqwest::Body::from("x"),
                length: 1,
            },
        )
        .await
        .unwrap_err();

    assert!(err.is_conflict());
}

#[tokio::test]
async fn delete_node_accepts_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path(format!("{NODES}/c1")))
        .and(header("authorization", "Basic dGVzdA=="))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = NodesClient::new(&server.uri(), "Basic dGVzdA==").unwrap();
    client.delete_node("c1").await.unwrap();
}

#[tokio::test]
async fn download_content_returns_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(format!("{NODES}/c1/content")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload"))
        .mount(&server)
        .await;

    let client = NodesClient::new(&server.uri(), "Basic dGVzdA==").unwrap();
    let response = client.download_content("c1").await.unwrap();

    assert_eq!(response.bytes().await.unwrap().as_ref(), b"payload");
}
