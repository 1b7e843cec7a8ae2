use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

const API_ROOT: &str = "alfresco/api/-default-/public/alfresco/versions/1/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum NodesError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid timestamp: {0}")]
    Timestamp(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    Conflict,
    RateLimit,
    Transient,
    Permanent,
}

/// Client for the repository's public nodes API.
///
/// The authorization header is opaque to the client; callers resolve it from
/// whatever credential store they use and pass the finished header value.
#[derive(Clone)]
pub struct NodesClient {
    http: Client,
    base_url: Url,
    auth_header: String,
}

impl NodesClient {
    pub fn new(instance_url: &str, auth_header: impl Into<String>) -> Result<Self, NodesError> {
        Self::with_timeout(instance_url, auth_header, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        instance_url: &str,
        auth_header: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NodesError> {
        let http = Client::builder().timeout(timeout).build()?;
        Self::with_http(http, instance_url, auth_header)
    }

    pub fn with_http(
        http: Client,
        instance_url: &str,
        auth_header: impl Into<String>,
    ) -> Result<Self, NodesError> {
        let mut base = instance_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)?.join(API_ROOT)?;
        Ok(Self {
            http,
            base_url,
            auth_header: auth_header.into(),
        })
    }

    pub async fn list_children(
        &self,
        node_id: &str,
        skip_count: u32,
        max_items: u32,
    ) -> Result<NodePage, NodesError> {
        let mut url = self.endpoint(&format!("nodes/{node_id}/children"))?;
        url.query_pairs_mut()
            .append_pair("skipCount", &skip_count.to_string())
            .append_pair("maxItems", &max_items.max(1).to_string())
            .append_pair("include", "path");
        let response = self
            .http
            .get(url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        let payload: NodeListResponse = Self::handle_response(response).await?;
        Ok(NodePage {
            entries: payload.list.entries.into_iter().map(|e| e.entry).collect(),
            has_more: payload.list.pagination.has_more_items,
            skip_count: payload.list.pagination.skip_count,
            count: payload.list.pagination.count,
        })
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Node, NodesError> {
        let mut url = self.endpoint(&format!("nodes/{node_id}"))?;
        url.query_pairs_mut().append_pair("include", "path");
        let response = self
            .http
            .get(url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        let payload: NodeResponse = Self::handle_response(response).await?;
        Ok(payload.entry)
    }

    pub async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
        relative_path: Option<&str>,
    ) -> Result<Node, NodesError> {
        let mut url = self.endpoint(&format!("nodes/{parent_id}/children"))?;
        url.query_pairs_mut().append_pair("include", "path");
        let body = CreateFolderRequest {
            name,
            node_type: "cm:folder",
            relative_path: relative_path.filter(|p| !p.is_empty()),
        };
        let response = self
            .http
            .post(url)
            .header("Authorization", &self.auth_header)
            .json(&body)
            .send()
            .await?;
        let payload: NodeResponse = Self::handle_response(response).await?;
        Ok(payload.entry)
    }

    pub async fn upload_file(&self, parent_id: &str, upload: FileUpload) -> Result<Node, NodesError> {
        let mut url = self.endpoint(&format!("nodes/{parent_id}/children"))?;
        url.query_pairs_mut().append_pair("include", "path");
        let file_part = Part::stream_with_length(upload.body, upload.length)
            .file_name(upload.name.clone())
            .mime_str("application/octet-stream")?;
        let mut form = Form::new()
            .part("filedata", file_part)
            .text("name", upload.name)
            .text("overwrite", if upload.overwrite { "true" } else { "false" });
        if let Some(relative_path) = upload.relative_path.filter(|p| !p.is_empty()) {
            form = form.text("relativePath", relative_path);
        }
        let response = self
            .http
            .post(url)
            .header("Authorization", &self.auth_header)
            .multipart(form)
            .send()
            .await?;
        let payload: NodeResponse = Self::handle_response(response).await?;
        Ok(payload.entry)
    }

    pub async fn download_content(&self, node_id: &str) -> Result<reqwest::Response, NodesError> {
        let url = self.endpoint(&format!("nodes/{node_id}/content"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    pub async fn delete_node(&self, node_id: &str) -> Result<(), NodesError> {
        let url = self.endpoint(&format!("nodes/{node_id}"))?;
        let response = self
            .http
            .delete(url)
            .header("Authorization", &self.auth_header)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response).await)
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, NodesError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, NodesError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> NodesError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        NodesError::Api { status, body }
    }
}

impl NodesError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            NodesError::Api { status, .. } => Some(*status),
            NodesError::Request(err) => err.status(),
            _ => None,
        }
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            NodesError::Api { status, .. } => Some(classify_api_status(*status)),
            NodesError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::NotFound))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Conflict))
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status == StatusCode::CONFLICT {
        ApiErrorClass::Conflict
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// Parses repository timestamps into UTC epoch seconds.
///
/// The repository emits ISO-8601 with a colon-less offset
/// (`2024-01-01T10:00:00.000+0000`), which RFC 3339 rejects, so the offset is
/// normalized first.
pub fn parse_timestamp(value: &str) -> Result<i64, NodesError> {
    let value = value.trim();
    if let Ok(parsed) = OffsetDateTime::parse(value, &Rfc3339) {
        return Ok(parsed.unix_timestamp());
    }
    let normalized = normalize_offset(value);
    OffsetDateTime::parse(&normalized, &Rfc3339)
        .map(|parsed| parsed.unix_timestamp())
        .map_err(|_| NodesError::Timestamp(value.to_string()))
}

fn normalize_offset(value: &str) -> String {
    let bytes = value.as_bytes();
    if value.is_ascii() && bytes.len() > 5 {
        let split = bytes.len() - 5;
        let (head, tail) = value.split_at(split);
        let tail_bytes = tail.as_bytes();
        if (tail_bytes[0] == b'+' || tail_bytes[0] == b'-')
            && tail_bytes[1..].iter().all(u8::is_ascii_digit)
        {
            return format!("{head}{}:{}", &tail[..3], &tail[3..]);
        }
    }
    value.to_string()
}

pub struct FileUpload {
    pub name: String,
    pub relative_path: Option<String>,
    pub overwrite: bool,
    pub body: Body,
    pub length: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default)]
    pub modified_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub path: Option<PathInfo>,
}

impl Node {
    pub fn modified_unix(&self) -> Result<Option<i64>, NodesError> {
        self.modified_at.as_deref().map(parse_timestamp).transpose()
    }

    pub fn created_unix(&self) -> Result<Option<i64>, NodesError> {
        self.created_at.as_deref().map(parse_timestamp).transpose()
    }

    /// Path of the folder containing this node, when the listing included it.
    pub fn parent_path(&self) -> Option<&str> {
        self.path.as_ref().map(|p| p.name.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PathInfo {
    pub name: String,
    #[serde(default)]
    pub is_complete: bool,
}

#[derive(Debug)]
pub struct NodePage {
    pub entries: Vec<Node>,
    pub has_more: bool,
    pub skip_count: u32,
    pub count: u32,
}

#[derive(Debug, Deserialize)]
struct NodeResponse {
    entry: Node,
}

#[derive(Debug, Deserialize)]
struct NodeListResponse {
    list: NodeList,
}

#[derive(Debug, Deserialize)]
struct NodeList {
    pagination: Pagination,
    #[serde(default)]
    entries: Vec<NodeResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    #[serde(default)]
    count: u32,
    #[serde(default)]
    has_more_items: bool,
    #[serde(default)]
    skip_count: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFolderRequest<'a> {
    name: &'a str,
    node_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    relative_path: Option<&'a str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colonless_offset() {
        assert_eq!(
            parse_timestamp("2024-01-01T00:00:10.000+0000").unwrap(),
            1_704_067_210
        );
    }

    #[test]
    fn parses_rfc3339_and_shifts_to_utc() {
        assert_eq!(
            parse_timestamp("2024-01-01T02:00:10+02:00").unwrap(),
            1_704_067_210
        );
        assert_eq!(
            parse_timestamp("2024-01-01T02:00:10.500+0200").unwrap(),
            1_704_067_210
        );
    }

    #[test]
    fn rejects_garbage_timestamps() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(NodesError::Timestamp(_))
        ));
        assert!(matches!(
            parse_timestamp("2024-01-01T00:00:00日本"),
            Err(NodesError::Timestamp(_))
        ));
        assert!(matches!(
            parse_timestamp("2024-01-01T00:00:00é+0000"),
            Err(NodesError::Timestamp(_))
        ));
    }

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::NOT_FOUND),
            ApiErrorClass::NotFound
        );
        assert_eq!(
            classify_api_status(StatusCode::CONFLICT),
            ApiErrorClass::Conflict
        );
        assert_eq!(
            classify_api_status(StatusCode::SERVICE_UNAVAILABLE),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_REQUEST),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn base_url_keeps_instance_context_path() {
        let client = NodesClient::new("https://ecm.example.com/", "Basic x").unwrap();
        let url = client.endpoint("nodes/abc").unwrap();
        assert_eq!(
            url.as_str(),
            "https://ecm.example.com/alfresco/api/-default-/public/alfresco/versions/1/nodes/abc"
        );
    }
}
