use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, ClientBuilder, StatusCode};

use crate::errors::HttpStatusError;
use crate::metadata::FileMetadata;
use crate::path::RelativePath;
use crate::telemetry::HttpStats;

/// The external collaborator the sync subsystem drives: the HTTP server
/// that stores blobs, metadata, and access rules. Out of scope here is
/// everything behind this trait — authentication, storage engine, wire
/// encoding details beyond what §6 names.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn get_remote_state(&self, datasite: &str) -> Result<Vec<FileMetadata>>;
    async fn get_metadata(&self, path: &RelativePath) -> Result<Option<FileMetadata>>;
    async fn download(&self, path: &RelativePath) -> Result<(Vec<u8>, FileMetadata)>;
    async fn download_bulk(&self, paths: &[RelativePath]) -> Result<Vec<u8>>;
    async fn upload(
        &self,
        path: &RelativePath,
        bytes: &[u8],
        signature: &str,
    ) -> Result<FileMetadata>;
    async fn delete(&self, path: &RelativePath) -> Result<()>;
}

/// `reqwest`-backed implementation of the wire contract in spec.md §6.
pub struct HttpSyncClient {
    base: String,
    http: HttpClient,
    stats: std::sync::Arc<HttpStats>,
}

impl HttpSyncClient {
    pub fn new(base: &str) -> Result<Self> {
        let http = ClientBuilder::new()
            .timeout(Duration::from_secs(10 * 60))
            .connect_timeout(Duration::from_secs(5))
            .user_agent("syftbox-rs/0.1")
            .build()
            .context("build http client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            http,
            stats: std::sync::Arc::new(HttpStats::default()),
        })
    }

    pub fn stats(&self) -> std::sync::Arc<HttpStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl SyncClient for HttpSyncClient {
    async fn get_remote_state(&self, datasite: &str) -> Result<Vec<FileMetadata>> {
        let url = format!("{}/sync/state/{}", self.base, datasite);
        let resp = self.http.get(&url).send().await?;
        map_json(resp, "get_remote_state").await
    }

    async fn get_metadata(&self, path: &RelativePath) -> Result<Option<FileMetadata>> {
        let url = format!("{}/sync/metadata/{}", self.base, path.as_str());
        let resp = self.http.get(&url).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let meta = map_json(resp, "get_metadata").await?;
        Ok(Some(meta))
    }

    async fn download(&self, path: &RelativePath) -> Result<(Vec<u8>, FileMetadata)> {
        let url = format!("{}/sync/download/{}", self.base, path.as_str());
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(http_status_error(status, "download").into());
        }
        let meta = metadata_from_headers(resp.headers(), path)?;
        let bytes = resp.bytes().await?;
        self.stats.on_recv(bytes.len() as i64);
        Ok((bytes.to_vec(), meta))
    }

    async fn download_bulk(&self, paths: &[RelativePath]) -> Result<Vec<u8>> {
        let url = format!("{}/sync/download_bulk", self.base);
        let body: Vec<&str> = paths.iter().map(|p| p.as_str()).collect();
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(http_status_error(status, "download_bulk").into());
        }
        let bytes = resp.bytes().await?;
        self.stats.on_recv(bytes.len() as i64);
        Ok(bytes.to_vec())
    }

    async fn upload(
        &self,
        path: &RelativePath,
        bytes: &[u8],
        signature: &str,
    ) -> Result<FileMetadata> {
        let url = format!("{}/sync/upload/{}", self.base, path.as_str());
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name("content");
        let form = reqwest::multipart::Form::new()
            .part("content", part)
            .text("signature", signature.to_string());
        self.stats.on_send(bytes.len() as i64);
        let resp = self.http.post(&url).multipart(form).send().await?;
        map_json(resp, "upload").await
    }

    async fn delete(&self, path: &RelativePath) -> Result<()> {
        let url = format!("{}/sync/delete/{}", self.base, path.as_str());
        let resp = self.http.delete(&url).send().await?;
        let status = resp.status();
        if status == StatusCode::NO_CONTENT || status.is_success() {
            return Ok(());
        }
        Err(http_status_error(status, "delete").into())
    }
}

async fn map_json<T: for<'de> serde::Deserialize<'de>>(
    resp: reqwest::Response,
    op: &str,
) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp.json::<T>().await.context(op.to_string());
    }
    Err(http_status_error(status, op).into())
}

fn http_status_error(status: StatusCode, op: &str) -> HttpStatusError {
    HttpStatusError {
        status: status.as_u16(),
        op: op.to_string(),
    }
}

fn metadata_from_headers(
    headers: &reqwest::header::HeaderMap,
    path: &RelativePath,
) -> Result<FileMetadata> {
    let hash = header_str(headers, "x-syft-hash").unwrap_or_default();
    let signature = header_str(headers, "x-syft-signature").unwrap_or_default();
    let file_size: u64 = header_str(headers, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let last_modified = header_str(headers, "x-syft-last-modified")
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);
    Ok(FileMetadata {
        path: path.clone(),
        hash,
        signature,
        file_size,
        last_modified,
    })
}

fn header_str(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers.get(name)?.to_str().ok().map(|s| s.to_string())
}

/// In-memory `SyncClient` used by tests: a plain map of path -> bytes plus
/// a metadata index, with a rejection list to simulate 403s for exercising
/// reversal logic without a real server.
pub struct MockSyncClient {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    metadata: Mutex<HashMap<String, FileMetadata>>,
    /// path -> (status, ops to reject; empty means every op).
    reject_paths: Mutex<HashMap<String, (u16, Vec<String>)>>,
}

impl MockSyncClient {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            reject_paths: Mutex::new(HashMap::new()),
        }
    }

    pub fn seed(&self, meta: FileMetadata, bytes: Vec<u8>) {
        self.blobs.lock().unwrap().insert(meta.path.as_str().to_string(), bytes);
        self.metadata.lock().unwrap().insert(meta.path.as_str().to_string(), meta);
    }

    /// Rejects every operation on `path` with `status`.
    pub fn reject(&self, path: &RelativePath, status: u16) {
        self.reject_paths
            .lock()
            .unwrap()
            .insert(path.as_str().to_string(), (status, Vec::new()));
    }

    /// Rejects only `op` (e.g. `"upload"`, `"delete"`) on `path` with
    /// `status`; other operations on the same path succeed normally. Used
    /// to exercise reversal paths that re-download after a rejected
    /// remote mutation without also blocking the reversal's own download.
    pub fn reject_op(&self, path: &RelativePath, op: &str, status: u16) {
        self.reject_paths
            .lock()
            .unwrap()
            .insert(path.as_str().to_string(), (status, vec![op.to_string()]));
    }

    fn check_rejected(&self, path: &RelativePath, op: &str) -> Result<()> {
        if let Some((status, ops)) = self.reject_paths.lock().unwrap().get(path.as_str()).cloned() {
            if ops.is_empty() || ops.iter().any(|o| o == op) {
                return Err(HttpStatusError {
                    status,
                    op: op.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

impl Default for MockSyncClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncClient for MockSyncClient {
    async fn get_remote_state(&self, datasite: &str) -> Result<Vec<FileMetadata>> {
        Ok(self
            .metadata
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.path.datasite() == datasite)
            .cloned()
            .collect())
    }

    async fn get_metadata(&self, path: &RelativePath) -> Result<Option<FileMetadata>> {
        Ok(self.metadata.lock().unwrap().get(path.as_str()).cloned())
    }

    async fn download(&self, path: &RelativePath) -> Result<(Vec<u8>, FileMetadata)> {
        self.check_rejected(path, "download")?;
        let bytes = self
            .blobs
            .lock()
            .unwrap()
            .get(path.as_str())
            .cloned()
            .with_context(|| format!("no such blob: {}", path.as_str()))?;
        let meta = self
            .metadata
            .lock()
            .unwrap()
            .get(path.as_str())
            .cloned()
            .with_context(|| format!("no such metadata: {}", path.as_str()))?;
        Ok((bytes, meta))
    }

    async fn download_bulk(&self, paths: &[RelativePath]) -> Result<Vec<u8>> {
        let mut entries = Vec::new();
        for path in paths {
            self.check_rejected(path, "download_bulk")?;
            if let Some(bytes) = self.blobs.lock().unwrap().get(path.as_str()).cloned() {
                entries.push((path.as_str().to_string(), bytes));
            }
        }
        encode_mock_zip(&entries).await
    }

    async fn upload(
        &self,
        path: &RelativePath,
        bytes: &[u8],
        signature: &str,
    ) -> Result<FileMetadata> {
        self.check_rejected(path, "upload")?;
        let meta = FileMetadata {
            path: path.clone(),
            hash: format!("{:x}", md5::compute(bytes)),
            signature: signature.to_string(),
            file_size: bytes.len() as u64,
            last_modified: chrono::Utc::now(),
        };
        self.blobs
            .lock()
            .unwrap()
            .insert(path.as_str().to_string(), bytes.to_vec());
        self.metadata
            .lock()
            .unwrap()
            .insert(path.as_str().to_string(), meta.clone());
        Ok(meta)
    }

    async fn delete(&self, path: &RelativePath) -> Result<()> {
        self.check_rejected(path, "delete")?;
        self.blobs.lock().unwrap().remove(path.as_str());
        self.metadata.lock().unwrap().remove(path.as_str());
        Ok(())
    }
}

/// Builds a real zip stream for the mock's `download_bulk`, so integration
/// tests exercise the exact same `datasite::extract_bulk` decoding path a
/// real server response would.
async fn encode_mock_zip(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    use async_zip::base::write::ZipFileWriter;
    use async_zip::{Compression, ZipEntryBuilder};
    use futures_util::io::AllowStdIo;

    let sink = AllowStdIo::new(std::io::Cursor::new(Vec::new()));
    let mut writer = ZipFileWriter::new(sink);
    for (path, bytes) in entries {
        let entry = ZipEntryBuilder::new(path.clone().into(), Compression::Deflate);
        writer
            .write_entry_whole(entry, bytes)
            .await
            .with_context(|| format!("zip entry {path}"))?;
    }
    let sink = writer.close().await.context("close mock zip")?;
    Ok(sink.into_inner().into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_upload_then_download_round_trips() {
        let client = MockSyncClient::new();
        let path = RelativePath::new("alice/x.txt").unwrap();
        let uploaded = client.upload(&path, b"hello", "sig").await.unwrap();

        let (bytes, meta) = client.download(&path).await.unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(meta.hash, uploaded.hash);
    }

    #[tokio::test]
    async fn mock_rejects_configured_path() {
        let client = MockSyncClient::new();
        let path = RelativePath::new("alice/x.txt").unwrap();
        client.reject(&path, 403);
        let err = client.upload(&path, b"hello", "sig").await.unwrap_err();
        let status_err = err.downcast_ref::<HttpStatusError>().unwrap();
        assert_eq!(status_err.status, 403);
    }
}
