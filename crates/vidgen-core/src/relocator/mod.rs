//! Media Relocator: copy provider media from its temporary URL into
//! permanent object storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use strum::{AsRefStr, Display};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::RelocationConfig;
use crate::storage::{ObjectStorage, StorageError};

const MAX_REDIRECTS: usize = 10;

/// What is being relocated; part of the stored object name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Video,
    Cover,
    Image,
}

#[derive(Debug, Error)]
pub enum RelocationError {
    #[error("invalid media url '{0}'")]
    InvalidUrl(String),

    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("media exceeds size limit ({size} > {max} bytes)")]
    TooLarge { size: u64, max: u64 },

    #[error("media type '{0}' is not allowed")]
    DisallowedMime(String),

    #[error("storage upload failed: {0}")]
    Storage(#[from] StorageError),
}

#[async_trait]
pub trait Relocator: Send + Sync {
    /// Copy `temporary_url` to permanent storage and return the permanent URL.
    async fn relocate(&self, temporary_url: &str, kind: MediaKind) -> Result<String, RelocationError>;
}

/// Downloads with `reqwest` and re-uploads through an [`ObjectStorage`].
#[derive(Clone)]
pub struct MediaRelocator {
    client: Client,
    storage: Arc<dyn ObjectStorage>,
    config: RelocationConfig,
}

impl std::fmt::Debug for MediaRelocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaRelocator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MediaRelocator {
    pub fn new(config: RelocationConfig, storage: Arc<dyn ObjectStorage>) -> Self {
        let client = Client::builder()
            .user_agent(concat!("vidgen/", env!("CARGO_PKG_VERSION")))
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            storage,
            config,
        }
    }

    /// Resolve the URL actually fetched. Hosts listed in `proxied_hosts` do not
    /// serve cross-origin requests and go through the configured proxy.
    fn fetch_url(&self, source: &str) -> Result<Url, RelocationError> {
        let url = Url::parse(source).map_err(|_| RelocationError::InvalidUrl(source.to_owned()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(RelocationError::InvalidUrl(source.to_owned()));
        }

        let proxied = url
            .host_str()
            .is_some_and(|host| self.config.proxied_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)));
        match (&self.config.proxy_url, proxied) {
            (Some(proxy), true) => {
                let mut proxy_url =
                    Url::parse(proxy).map_err(|_| RelocationError::InvalidUrl(proxy.clone()))?;
                proxy_url.query_pairs_mut().append_pair("url", source);
                debug!(source, proxy = %proxy_url, "fetching through proxy");
                Ok(proxy_url)
            }
            _ => Ok(url),
        }
    }

    /// Download the body, enforcing the size limit while streaming.
    async fn download(&self, source: &str) -> Result<(Bytes, String), RelocationError> {
        let url = self.fetch_url(source)?;
        let fetch_err = |message: String| RelocationError::Fetch {
            url: source.to_owned(),
            message,
        };

        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", resp.status().as_u16())));
        }

        let header_mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty() && v != "application/octet-stream");
        let mime = header_mime
            .or_else(|| mime_from_path(source).map(str::to_owned))
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        if !self.config.allowed_mime_types.iter().any(|m| m.eq_ignore_ascii_case(&mime)) {
            return Err(RelocationError::DisallowedMime(mime));
        }

        let max = self.config.max_bytes;
        if let Some(len) = resp.content_length().filter(|len| *len > max) {
            return Err(RelocationError::TooLarge { size: len, max });
        }

        let mut buf = BytesMut::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| fetch_err(e.to_string()))? {
            buf.extend_from_slice(&chunk);
            if buf.len() as u64 > max {
                return Err(RelocationError::TooLarge {
                    size: buf.len() as u64,
                    max,
                });
            }
        }
        Ok((buf.freeze(), mime))
    }
}

#[async_trait]
impl Relocator for MediaRelocator {
    async fn relocate(&self, temporary_url: &str, kind: MediaKind) -> Result<String, RelocationError> {
        let (bytes, mime) = self.download(temporary_url).await?;
        let ext = extension_for(&mime)
            .or_else(|| extension_from_path(temporary_url))
            .unwrap_or("bin");
        let name = object_name(kind, ext);
        let size = bytes.len();
        let url = self.storage.upload(bytes, &name, &mime).await?;
        info!(%kind, name = %name, size, "media relocated");
        Ok(url)
    }
}

/// `{date}_{kind}_{random}.{ext}`
pub fn object_name(kind: MediaKind, ext: &str) -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}_{}.{}",
        Utc::now().format("%Y%m%d%H%M%S"),
        kind,
        &random[..12],
        ext
    )
}

fn extension_for(mime: &str) -> Option<&'static str> {
    match mime {
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "video/quicktime" => Some("mov"),
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpg"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

fn extension_from_path(source: &str) -> Option<&'static str> {
    mime_from_path(source).and_then(extension_for)
}

fn mime_from_path(source: &str) -> Option<&'static str> {
    let path = Url::parse(source).ok()?.path().to_ascii_lowercase();
    let ext = path.rsplit_once('.')?.1.to_owned();
    match ext.as_str() {
        "mp4" => Some("video/mp4"),
        "webm" => Some("video/webm"),
        "mov" => Some("video/quicktime"),
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}
