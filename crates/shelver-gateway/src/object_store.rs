//! Durable object store gateway.
//!
//! Objects are keyed by the audit event id, so a retried put of the same
//! key overwrites rather than duplicates.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `payload` at `container/key`, replacing any existing object.
    async fn put_object(&self, container: &str, key: &str, payload: Bytes) -> GatewayResult<()>;
}

/// Swift-compatible HTTP object store: `PUT {endpoint}/{container}/{key}`.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shelver/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GatewayError::failed("put_object", format!("build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn object_url(&self, container: &str, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, container, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put_object(&self, container: &str, key: &str, payload: Bytes) -> GatewayResult<()> {
        let url = self.object_url(container, key);
        let mut req = self
            .client
            .put(&url)
            .header("content-type", "application/json")
            .body(payload);
        if let Some(token) = &self.token {
            req = req.header("x-auth-token", token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::failed("put_object", e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GatewayError::failed(
                "put_object",
                format!("{url} returned {}", resp.status()),
            ));
        }
        debug!(%url, "object stored");
        Ok(())
    }
}

/// Object store rooted at a local directory: `{root}/{container}/{key}`.
///
/// Writes go to a temporary sibling and are renamed into place, so a
/// reader never sees a partial object.
#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    root: PathBuf,
}

impl DirectoryObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn object_path(&self, container: &str, key: &str) -> PathBuf {
        self.root.join(container).join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for DirectoryObjectStore {
    async fn put_object(&self, container: &str, key: &str, payload: Bytes) -> GatewayResult<()> {
        let path = self.object_path(container, key);
        let io_err = |e: std::io::Error| GatewayError::failed("put_object", format!("{}: {e}", path.display()));

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let tmp = tmp_path(&path);
        tokio::fs::write(&tmp, &payload).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_object_url_joins_segments() {
        let store = HttpObjectStore::new("https://swift.example.org/v1/AUTH_x/", None).unwrap();
        assert_eq!(
            store.object_url("events", "/prod/abc.json"),
            "https://swift.example.org/v1/AUTH_x/events/prod/abc.json"
        );
    }

    #[tokio::test]
    async fn directory_store_overwrites_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryObjectStore::new(dir.path());

        store
            .put_object("events", "prod/one.json", Bytes::from_static(b"first"))
            .await
            .unwrap();
        store
            .put_object("events", "prod/one.json", Bytes::from_static(b"second"))
            .await
            .unwrap();

        let path = store.object_path("events", "prod/one.json");
        assert_eq!(std::fs::read(&path).unwrap(), b"second");

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn http_store_unreachable_endpoint_fails() {
        let store = HttpObjectStore::new("http://127.0.0.1:1", None).unwrap();
        let err = store
            .put_object("events", "a.json", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Failed { operation: "put_object", .. }));
    }
}
