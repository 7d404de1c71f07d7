//! # Store Backends
//!
//! The gateway persists its artifacts through the [`FileStore`] seam. Two
//! backends exist: [`HttpStore`] talks to the remote object store over plain
//! GET/PUT, [`DirStore`] keeps files under a local directory for development
//! and tests. [`AnyStore`] selects one of them at runtime.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
/// # Store Error
///
/// Failures while loading or saving an artifact.
pub enum StoreError {
    /// The artifact does not exist (or is too short to be a sealed item).
    #[error("not found: {0}")]
    NotFound(String),

    /// An error occurred during network communication (HTTP request).
    #[error("network error: {0}")]
    Network(String),

    /// An error occurred while touching the local filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Sealing or opening an artifact failed (wrong key, tampered data).
    #[error("crypto error: {0}")]
    Crypto(String),
}

/// Storage seam used by the certificate provisioner and the PAC cache.
///
/// Paths are rooted, `/`-separated object names such as
/// `/example.com/cert.pem`.
pub trait FileStore {
    /// Stores `contents` at `path`, overwriting any previous version.
    fn save(
        &self,
        path: &str,
        contents: &[u8],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Loads the artifact at `path`; `StoreError::NotFound` when absent.
    fn load(&self, path: &str)
        -> impl std::future::Future<Output = Result<Vec<u8>, StoreError>> + Send;
}

/// Remote object store spoken to over HTTP: `GET`/`PUT` against
/// `<base_url><path>`, 404 mapping to [`StoreError::NotFound`].
#[derive(Clone)]
pub struct HttpStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpStore {
    /// Creates a client for the store rooted at `base_url` (no trailing
    /// slash).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn object_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl FileStore for HttpStore {
    async fn save(&self, path: &str, contents: &[u8]) -> Result<(), StoreError> {
        let res = self
            .client
            .put(self.object_url(path))
            .body(contents.to_vec())
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        if !res.status().is_success() {
            return Err(StoreError::Network(format!(
                "PUT {} returned {}",
                path,
                res.status()
            )));
        }
        Ok(())
    }

    async fn load(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let res = self
            .client
            .get(self.object_url(path))
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        if res.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.to_string()));
        }
        if !res.status().is_success() {
            return Err(StoreError::Network(format!(
                "GET {} returned {}",
                path,
                res.status()
            )));
        }
        let body = res
            .bytes()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;
        Ok(body.to_vec())
    }
}

/// Local-directory backend; object paths map onto files below `root`.
#[derive(Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl FileStore for DirStore {
    async fn save(&self, path: &str, contents: &[u8]) -> Result<(), StoreError> {
        let target = self.object_path(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, contents).await?;
        Ok(())
    }

    async fn load(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let target = self.object_path(path);
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Runtime-selected backend (`XPS_MODE`).
#[derive(Clone)]
pub enum AnyStore {
    /// Remote HTTP object store.
    Http(HttpStore),
    /// Local directory.
    Dir(DirStore),
}

impl FileStore for AnyStore {
    async fn save(&self, path: &str, contents: &[u8]) -> Result<(), StoreError> {
        match self {
            AnyStore::Http(s) => s.save(path, contents).await,
            AnyStore::Dir(s) => s.save(path, contents).await,
        }
    }

    async fn load(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        match self {
            AnyStore::Http(s) => s.load(path).await,
            AnyStore::Dir(s) => s.load(path).await,
        }
    }
}
