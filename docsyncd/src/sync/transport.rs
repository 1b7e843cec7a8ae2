use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use docsync_core::{FileUpload, Node, NodesClient, NodesError};
use thiserror::Error;

use super::transfer::{TransferError, file_body, write_response_to_path};
use crate::accounts::Account;
use crate::storage::{CredentialStore, StorageError};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("remote error: {0}")]
    Remote(#[from] NodesError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] StorageError),
    #[error("remote entry {id} is malformed: {reason}")]
    InvalidEntry { id: String, reason: String },
}

impl TransportError {
    /// 5xx, rate limits and timeouts: worth another try on a later tick.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Remote(err) => err.is_retryable(),
            Self::Transfer(TransferError::Request(err)) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }
}

/// A remote file or folder as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    pub is_file: bool,
    /// UTC epoch seconds.
    pub modified_at: i64,
    pub created_at: i64,
    /// Path of the containing folder.
    pub parent_path: Option<String>,
}

impl RemoteEntry {
    pub fn from_node(node: Node) -> Result<Self, TransportError> {
        let invalid = |reason: String| TransportError::InvalidEntry {
            id: node.id.clone(),
            reason,
        };
        let modified_at = node
            .modified_unix()
            .map_err(|err| invalid(err.to_string()))?
            .unwrap_or(0);
        let created_at = node
            .created_unix()
            .map_err(|err| invalid(err.to_string()))?
            .unwrap_or(modified_at);
        let parent_path = node.parent_path().map(str::to_string);
        Ok(Self {
            id: node.id,
            name: node.name,
            is_folder: node.is_folder,
            is_file: node.is_file,
            modified_at,
            created_at,
            parent_path,
        })
    }

    pub fn full_path(&self) -> Option<String> {
        self.parent_path
            .as_deref()
            .map(|parent| format!("{}/{}", parent.trim_end_matches('/'), self.name))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub entries: Vec<RemoteEntry>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeLookup {
    Found(RemoteEntry),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(RemoteEntry),
    /// 409: the name is taken. Treated as synchronized.
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

/// Remote repository operations used by the engine. Each call is scoped to an
/// account, which selects the instance and the credentials.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn list_children(
        &self,
        account: &Account,
        parent_id: &str,
        skip_count: u32,
        page_size: u32,
    ) -> Result<RemotePage, TransportError>;

    async fn get_node(&self, account: &Account, node_id: &str) -> Result<NodeLookup, TransportError>;

    async fn create_folder(
        &self,
        account: &Account,
        parent_id: &str,
        name: &str,
        relative_path: Option<&str>,
    ) -> Result<CreateOutcome, TransportError>;

    async fn upload_file(
        &self,
        account: &Account,
        parent_id: &str,
        local_path: &Path,
        relative_path: Option<&str>,
        overwrite: bool,
    ) -> Result<CreateOutcome, TransportError>;

    async fn delete_node(&self, account: &Account, node_id: &str) -> Result<DeleteOutcome, TransportError>;

    /// Streams the content of `entry` to `target` and stamps its remote mtime.
    async fn download_file(
        &self,
        account: &Account,
        entry: &RemoteEntry,
        target: &Path,
    ) -> Result<(), TransportError>;
}

/// [`RemoteTransport`] over the nodes REST API, one client per account.
pub struct HttpTransport {
    credentials: CredentialStore,
    timeout: Duration,
    clients: Mutex<HashMap<i64, (String, NodesClient)>>,
}

impl HttpTransport {
    pub fn new(credentials: CredentialStore, timeout: Duration) -> Self {
        Self {
            credentials,
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Drops the cached client so the next call re-reads credentials.
    pub fn forget_account(&self, account_id: i64) {
        if let Ok(mut clients) = self.clients.lock() {
            clients.remove(&account_id);
        }
    }

    fn client_for(&self, account: &Account) -> Result<NodesClient, TransportError> {
        if let Ok(clients) = self.clients.lock()
            && let Some((instance, client)) = clients.get(&account.id)
            && *instance == account.instance_url
        {
            return Ok(client.clone());
        }

        let header = self.credentials.auth_header(account.id)?;
        let client = NodesClient::with_timeout(&account.instance_url, header, self.timeout)?;
        if let Ok(mut clients) = self.clients.lock() {
            clients.insert(account.id, (account.instance_url.clone(), client.clone()));
        }
        Ok(client)
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn list_children(
        &self,
        account: &Account,
        parent_id: &str,
        skip_count: u32,
        page_size: u32,
    ) -> Result<RemotePage, TransportError> {
        let client = self.client_for(account)?;
        let page = client.list_children(parent_id, skip_count, page_size).await?;
        let entries = page
            .entries
            .into_iter()
            .map(RemoteEntry::from_node)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RemotePage {
            entries,
            has_more: page.has_more,
        })
    }

    async fn get_node(&self, account: &Account, node_id: &str) -> Result<NodeLookup, TransportError> {
        let client = self.client_for(account)?;
        match client.get_node(node_id).await {
            Ok(node) => Ok(NodeLookup::Found(RemoteEntry::from_node(node)?)),
            Err(err) if err.is_not_found() => Ok(NodeLookup::NotFound),
            Err(err) => Err(err.into()),
        }
    }

    async fn create_folder(
        &self,
        account: &Account,
        parent_id: &str,
        name: &str,
        relative_path: Option<&str>,
    ) -> Result<CreateOutcome, TransportError> {
        let client = self.client_for(account)?;
        match client.create_folder(parent_id, name, relative_path).await {
            Ok(node) => Ok(CreateOutcome::Created(RemoteEntry::from_node(node)?)),
            Err(err) if err.is_conflict() => Ok(CreateOutcome::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn upload_file(
        &self,
        account: &Account,
        parent_id: &str,
        local_path: &Path,
        relative_path: Option<&str>,
        overwrite: bool,
    ) -> Result<CreateOutcome, TransportError> {
        let client = self.client_for(account)?;
        let name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (body, length) = file_body(local_path).await?;
        let upload = FileUpload {
            name,
            relative_path: relative_path.map(str::to_string),
            overwrite,
            body,
            length,
        };
        match client.upload_file(parent_id, upload).await {
            Ok(node) => Ok(CreateOutcome::Created(RemoteEntry::from_node(node)?)),
            Err(err) if err.is_conflict() => Ok(CreateOutcome::AlreadyExists),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete_node(&self, account: &Account, node_id: &str) -> Result<DeleteOutcome, TransportError> {
        let client = self.client_for(account)?;
        match client.delete_node(node_id).await {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(err) if err.is_not_found() => Ok(DeleteOutcome::AlreadyGone),
            Err(err) => Err(err.into()),
        }
    }

    async fn download_file(
        &self,
        account: &Account,
        entry: &RemoteEntry,
        target: &Path,
    ) -> Result<(), TransportError> {
        let client = self.client_for(account)?;
        let response = client.download_content(&entry.id).await?;
        let modified_at = (entry.modified_at > 0).then_some(entry.modified_at);
        write_response_to_path(response, target, modified_at).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NODES: &str = "/alfresco/api/-default-/public/alfresco/versions/1/nodes";

    fn account(uri: &str) -> Account {
        Account {
            id: 1,
            instance_url: uri.to_string(),
            username: None,
            sync_path: PathBuf::from("/sync"),
            sync_enabled: true,
            sync_frequency: Duration::from_secs(300),
            sync_in_progress: false,
            last_synced_at: 0,
        }
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(
            CredentialStore::Static("Basic dGVzdA==".into()),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn get_node_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{NODES}/gone")))
            .and(header("authorization", "Basic dGVzdA=="))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let lookup = transport()
            .get_node(&account(&server.uri()), "gone")
            .await
            .unwrap();
        assert_eq!(lookup, NodeLookup::NotFound);
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{NODES}/busy")))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = transport()
            .get_node(&account(&server.uri()), "busy")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn upload_conflict_is_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("{NODES}/root/children")))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"abc").unwrap();

        let outcome = transport()
            .upload_file(&account(&server.uri()), "root", &file, Some("docs"), false)
            .await
            .unwrap();
        assert_eq!(outcome, CreateOutcome::AlreadyExists);
    }

    #[tokio::test]
    async fn delete_of_missing_node_is_already_gone() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path(format!("{NODES}/gone")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let outcome = transport()
            .delete_node(&account(&server.uri()), "gone")
            .await
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::AlreadyGone);
    }

    #[tokio::test]
    async fn download_writes_content_with_remote_mtime() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("{NODES}/c1/content")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"payload"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("docs/a.txt");
        let entry = RemoteEntry {
            id: "c1".into(),
            name: "a.txt".into(),
            is_folder: false,
            is_file: true,
            modified_at: 1_704_067_200,
            created_at: 1_704_067_200,
            parent_path: Some("/Company Home/docs".into()),
        };

        transport()
            .download_file(&account(&server.uri()), &entry, &target)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
        let modified = std::fs::metadata(&target).unwrap().modified().unwrap();
        assert_eq!(
            modified.duration_since(std::time::UNIX_EPOCH).unwrap().as_secs(),
            1_704_067_200
        );
    }

    #[test]
    fn entry_full_path_joins_parent_and_name() {
        let node: Node = serde_json::from_value(json!({
            "id": "n1",
            "name": "a.txt",
            "isFile": true,
            "modifiedAt": "2024-01-01T00:00:00.000+0000",
            "path": { "name": "/Company Home/docs/", "isComplete": true }
        }))
        .unwrap();
        let entry = RemoteEntry::from_node(node).unwrap();
        assert_eq!(entry.full_path().as_deref(), Some("/Company Home/docs/a.txt"));
        assert_eq!(entry.modified_at, 1_704_067_200);
        assert_eq!(entry.created_at, 1_704_067_200);
    }
}
