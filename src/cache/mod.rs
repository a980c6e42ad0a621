//! Artifact cache for firmware bundles
//!
//! Bundles are keyed by the last path segment of their URL. A cached bundle is
//! reused when its size is within a small tolerance of what a HEAD probe reports
//! (and, when the catalog publishes one, its SHA-256 still matches). Otherwise
//! the bundle is streamed to disk chunk by chunk, so peak memory use does not
//! depend on bundle size.

mod disk;
mod storage;

pub use storage::{FsStorage, LocalStorage, StorageWriter};

use crate::config::{CacheConfig, RetryConfig};
use crate::error::{Error, Result, ValidationError};
use crate::reporter::UiReporter;
use crate::retry::retry_with_backoff;
use crate::types::{ImageSource, ProgressEvent};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use url::Url;

const PROGRESS_STAGE: &str = "download";

/// Where a resolved artifact lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactOrigin {
    /// Downloaded into the cache
    Cache,
    /// A local file supplied by the caller; never deleted
    Local,
}

/// A bundle available on local disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedArtifact {
    /// Cache key
    pub name: String,
    /// Size in bytes
    pub size_bytes: u64,
    /// Path for readers
    pub path: PathBuf,
    /// Cache entry or caller-owned file
    pub origin: ArtifactOrigin,
}

/// Resolves image sources to local files
pub struct ArtifactCache {
    storage: Arc<dyn LocalStorage>,
    client: reqwest::Client,
    config: CacheConfig,
    retry: RetryConfig,
}

impl ArtifactCache {
    /// Cache over filesystem storage in `config.dir`
    pub fn new(config: CacheConfig, retry: RetryConfig) -> Self {
        let storage = Arc::new(FsStorage::new(config.dir.clone()));
        Self::with_storage(storage, config, retry)
    }

    /// Cache over a custom storage backend
    pub fn with_storage(
        storage: Arc<dyn LocalStorage>,
        config: CacheConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            storage,
            client: reqwest::Client::new(),
            config,
            retry,
        }
    }

    /// Use a preconfigured HTTP client (proxies, timeouts)
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Make `source` available on local disk
    pub async fn resolve(
        &self,
        source: &ImageSource,
        reporter: &dyn UiReporter,
    ) -> Result<CachedArtifact> {
        match source {
            ImageSource::Local { path } => {
                let meta = tokio::fs::metadata(path).await?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "bundle.zip".to_string());
                debug!(?path, "using local bundle");
                Ok(CachedArtifact {
                    name,
                    size_bytes: meta.len(),
                    path: path.clone(),
                    origin: ArtifactOrigin::Local,
                })
            }
            ImageSource::Url { url, sha256 } => {
                self.resolve_url(url, sha256.as_deref(), reporter).await
            }
        }
    }

    async fn resolve_url(
        &self,
        url: &str,
        sha256: Option<&str>,
        reporter: &dyn UiReporter,
    ) -> Result<CachedArtifact> {
        let name = cache_key(url)?;
        let expected = sha256.filter(|_| self.config.verify_checksum);

        if let Some(cached_size) = self.storage.size(&name).await? {
            let remote = self.probe_size(url).await;
            let size_matches =
                remote.is_some_and(|r| cached_size.abs_diff(r) <= self.config.size_tolerance);

            let reuse = match (expected, size_matches, remote) {
                (None, matches, _) => matches,
                // A published hash settles it, even when the probe failed
                (Some(hash), true, _) | (Some(hash), false, None) => {
                    self.checksum_matches(&name, hash).await?
                }
                (Some(_), false, Some(_)) => false,
            };

            if reuse {
                info!(%name, cached_size, ?remote, "using cached artifact");
                return Ok(self.artifact(&name, cached_size));
            }
            info!(%name, cached_size, ?remote, "cached artifact is stale, downloading again");
        }

        let size = retry_with_backoff(&self.retry, || self.download(url, &name, reporter)).await?;

        if let Some(hash) = expected {
            let actual = self.digest(&name).await?;
            if !actual.eq_ignore_ascii_case(hash) {
                self.storage.delete(&name).await?;
                return Err(ValidationError::ChecksumMismatch {
                    name,
                    expected: hash.to_string(),
                    actual,
                }
                .into());
            }
        }

        Ok(self.artifact(&name, size))
    }

    /// Delete a cached artifact so the next run downloads it again.
    ///
    /// Caller-owned local files are left alone.
    pub async fn invalidate(&self, artifact: &CachedArtifact) -> Result<()> {
        match artifact.origin {
            ArtifactOrigin::Cache => {
                info!(name = %artifact.name, "invalidating cached artifact");
                self.storage.delete(&artifact.name).await
            }
            ArtifactOrigin::Local => {
                debug!(path = ?artifact.path, "not deleting caller-owned bundle");
                Ok(())
            }
        }
    }

    fn artifact(&self, name: &str, size_bytes: u64) -> CachedArtifact {
        CachedArtifact {
            name: name.to_string(),
            size_bytes,
            path: self.storage.path(name),
            origin: ArtifactOrigin::Cache,
        }
    }

    /// Size reported by a HEAD request; `None` if the probe fails
    async fn probe_size(&self, url: &str) -> Option<u64> {
        let response = match self.client.head(url).send().await.and_then(|r| r.error_for_status()) {
            Ok(response) => response,
            Err(e) => {
                warn!(url, error = %e, "size probe failed");
                return None;
            }
        };
        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    }

    async fn download(&self, url: &str, name: &str, reporter: &dyn UiReporter) -> Result<u64> {
        info!(url, %name, "downloading artifact");
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        let total = response.content_length();

        if let Some(total) = total {
            self.ensure_space(total)?;
        }

        let mut writer = self.storage.create(name).await?;
        let mut written: u64 = 0;
        let mut reported = 0.0;

        let streamed: Result<()> = async {
            while let Some(chunk) = response.chunk().await? {
                writer.append(&chunk).await?;
                written += chunk.len() as u64;
                if let Some(total) = total {
                    let progress = ProgressEvent::from_bytes(PROGRESS_STAGE, name, written, total);
                    if progress.fraction - reported >= 0.01 {
                        reported = progress.fraction;
                        reporter.report_progress(progress);
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = streamed {
            if let Err(discard_err) = writer.discard().await {
                warn!(%name, error = %discard_err, "failed to discard partial download");
            }
            return Err(e);
        }

        let size = writer.commit().await?;
        if reported < 1.0 {
            reporter.report_progress(ProgressEvent::from_bytes(PROGRESS_STAGE, name, size, size));
        }
        info!(%name, bytes = size, "download complete");
        Ok(size)
    }

    fn ensure_space(&self, required: u64) -> Result<()> {
        if !self.config.check_disk_space {
            return Ok(());
        }
        if let Some(available) = self.storage.available_space()? {
            if available < required {
                return Err(Error::InsufficientSpace {
                    required,
                    available,
                });
            }
        }
        Ok(())
    }

    async fn checksum_matches(&self, name: &str, expected: &str) -> Result<bool> {
        let actual = self.digest(name).await?;
        let matches = actual.eq_ignore_ascii_case(expected);
        if !matches {
            warn!(%name, expected, %actual, "cached artifact checksum mismatch");
        }
        Ok(matches)
    }

    /// Lowercase hex SHA-256 of a stored entry
    async fn digest(&self, name: &str) -> Result<String> {
        let mut file = self.storage.open(name).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Cache key for a source URL: its last non-empty path segment, made filesystem-safe
pub fn cache_key(source_url: &str) -> Result<String> {
    let url = Url::parse(source_url).map_err(|e| Error::Config {
        message: format!("invalid image URL '{source_url}': {e}"),
        key: Some("image.url".to_string()),
    })?;

    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .unwrap_or_default();

    let name: String = segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() || name.chars().all(|c| c == '.') {
        return Ok("artifact".to_string());
    }
    Ok(name)
}

#[cfg(test)]
mod tests;
