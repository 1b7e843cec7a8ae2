use std::io;
use std::path::Path;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::clock::set_local_mtime;
use super::paths::partial_path;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Streams a content response into `<target>.partial`, renames it into place
/// and stamps the remote modification time on the result.
pub async fn write_response_to_path(
    response: reqwest::Response,
    target: &Path,
    modified_at: Option<i64>,
) -> Result<u64, TransferError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(target);
    let written = match stream_into(response, &partial).await {
        Ok(written) => written,
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
    };

    tokio::fs::rename(&partial, target).await?;
    if let Some(modified_at) = modified_at {
        set_local_mtime(target, modified_at)?;
    }
    Ok(written)
}

async fn stream_into(response: reqwest::Response, partial: &Path) -> Result<u64, TransferError> {
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

/// Opens `source` as a streaming request body together with its length.
pub async fn file_body(source: &Path) -> Result<(reqwest::Body, u64), TransferError> {
    let file = tokio::fs::File::open(source).await?;
    let length = file.metadata().await?.len();
    let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
    Ok((body, length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::clock::mtime_unix;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn writes_body_and_sets_mtime() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let target = dir.path().join("nested/out.txt");
        let response = reqwest::get(format!("{}/content", server.uri()))
            .await
            .unwrap();

        let written = write_response_to_path(response, &target, Some(1_704_067_200))
            .await
            .unwrap();

        assert_eq!(written, 5);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");
        assert!(!partial_path(&target).exists());
        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(mtime_unix(&meta), 1_704_067_200);
    }

    #[tokio::test]
    async fn file_body_reports_length() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        std::fs::write(&source, b"payload").unwrap();

        let (_body, length) = file_body(&source).await.unwrap();
        assert_eq!(length, 7);
        assert!(file_body(&dir.path().join("missing")).await.is_err());
    }
}
