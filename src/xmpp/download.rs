//! Attachment download for out-of-band file links
//!
//! Files land in a fixed download directory under the last path segment of
//! their URL. The body is streamed chunk by chunk, never buffered whole, into
//! a temporary file next to the target that replaces it only once complete.

use async_trait::async_trait;
use reqwest::Url;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Download errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Invalid attachment URL {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server answered with status {0}")]
    Status(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Plain HTTP GET into local storage
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    /// Download `url` and return where it was written
    async fn fetch(&self, url: &str) -> Result<PathBuf, DownloadError>;
}

/// Local path for the attachment at `url`
pub fn download_path(dir: &Path, url: &str) -> Result<PathBuf, DownloadError> {
    let parsed = Url::parse(url).map_err(|_| DownloadError::InvalidUrl(url.to_string()))?;

    let name = parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .ok_or_else(|| DownloadError::InvalidUrl(url.to_string()))?;

    Ok(dir.join(name))
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    dir: PathBuf,
}

impl HttpDownloader {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("xare/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            dir: dir.into(),
        })
    }

    async fn stream_to(&self, url: &str, path: &Path) -> Result<u64, DownloadError> {
        let mut response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status().as_u16()));
        }

        // Dropped (and removed) unless persisted below
        let partial = tempfile::NamedTempFile::new_in(&self.dir)?;
        let mut file = File::from_std(partial.reopen()?);
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        partial.persist(path).map_err(|e| e.error)?;
        Ok(written)
    }
}

#[async_trait]
impl AttachmentFetcher for HttpDownloader {
    async fn fetch(&self, url: &str) -> Result<PathBuf, DownloadError> {
        let path = download_path(&self.dir, url)?;
        debug!(url = %url, path = %path.display(), "downloading attachment");

        let bytes = self.stream_to(url, &path).await?;
        info!(path = %path.display(), bytes, "downloaded file");
        Ok(path)
    }
}
