//! Permanent object storage for relocated media.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage rejected upload (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid object name: {0}")]
    InvalidName(String),
}

/// Object storage as seen by the relocator: put bytes, get a public URL.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `name` and return its public URL.
    async fn upload(&self, bytes: Bytes, name: &str, mime_type: &str) -> Result<String, StorageError>;

    fn public_url(&self, name: &str) -> String;
}

/// Object names are flat: no separators, no parent references.
fn check_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(StorageError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Stores objects as files in a local directory served under `public_base`.
#[derive(Debug, Clone)]
pub struct LocalDirStorage {
    root: PathBuf,
    public_base: String,
}

impl LocalDirStorage {
    pub fn new(root: impl Into<PathBuf>, public_base: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.into().trim_end_matches('/').to_owned(),
        }
    }
}

#[async_trait]
impl ObjectStorage for LocalDirStorage {
    async fn upload(&self, bytes: Bytes, name: &str, _mime_type: &str) -> Result<String, StorageError> {
        check_name(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(name);
        tokio::fs::write(&path, &bytes).await?;
        debug!(path = %path.display(), size = bytes.len(), "object written");
        Ok(self.public_url(name))
    }

    fn public_url(&self, name: &str) -> String {
        format!("{}/{}", self.public_base, name)
    }
}

/// Hosted bucket storage (`POST {base}/object/{bucket}/{name}`).
#[derive(Debug, Clone)]
pub struct HttpObjectStorage {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    api_key: String,
}

impl HttpObjectStorage {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("vidgen/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            bucket: bucket.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ObjectStorage for HttpObjectStorage {
    async fn upload(&self, bytes: Bytes, name: &str, mime_type: &str) -> Result<String, StorageError> {
        check_name(name)?;
        let url = format!("{}/object/{}/{}", self.base_url, self.bucket, name);
        let size = bytes.len();
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("apikey", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .header("x-upsert", "false")
            .body(bytes)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(bucket = %self.bucket, name, size, "object uploaded");
        Ok(self.public_url(name))
    }

    fn public_url(&self, name: &str) -> String {
        format!("{}/object/public/{}/{}", self.base_url, self.bucket, name)
    }
}
