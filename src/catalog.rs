//! Build catalog
//!
//! The catalog publishes `builds_index.json` (a list of builds, either as a bare
//! JSON array or wrapped as `{"builds": [...]}`) and the public key blob that is
//! provisioned into the custom key slot. In development mode both are read from
//! a local directory and bundles resolve to files next to the index.

use crate::config::{CatalogConfig, RetryConfig};
use crate::error::{Error, Result};
use crate::retry::retry_with_backoff;
use crate::types::{FlashPlan, ImageSource, ResolvedArtifacts};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};
use url::Url;

/// Index file name under the catalog root
pub const INDEX_FILE: &str = "builds_index.json";
/// Public key path under the catalog root
pub const PUBLIC_KEY_FILE: &str = "keys/avb_pkmd.bin";

/// One published build
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEntry {
    /// Device codename
    pub device: String,
    /// Android release
    #[serde(default)]
    pub android_version: String,
    /// Human-readable build date
    #[serde(default)]
    pub build_date: String,
    /// Bundle file name
    pub filename: String,
    /// Bundle download URL
    #[serde(default)]
    pub url: String,
    /// Sortable build timestamp
    #[serde(default)]
    pub timestamp: String,
    /// SHA-256 of the bundle, when published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Bundle location in development mode
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
}

impl BuildEntry {
    /// Where to get this build's bundle
    pub fn image_source(&self) -> ImageSource {
        match &self.local_path {
            Some(path) => ImageSource::Local { path: path.clone() },
            None => ImageSource::Url {
                url: self.url.clone(),
                sha256: self.sha256.clone(),
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IndexDocument {
    List(Vec<BuildEntry>),
    Wrapped {
        #[serde(default)]
        builds: Vec<BuildEntry>,
    },
}

/// Read-only access to published builds and the public key
#[async_trait]
pub trait RemoteCatalog: Send + Sync {
    /// Published builds, newest first
    async fn builds(&self) -> Result<Vec<BuildEntry>>;

    /// Public key blob for the custom key slot
    async fn public_key(&self) -> Result<Vec<u8>>;
}

/// Catalog served over HTTP, or from disk in development mode
pub struct HttpCatalog {
    client: reqwest::Client,
    index_url: String,
    public_key_url: String,
    local_root: Option<PathBuf>,
    retry: RetryConfig,
}

impl HttpCatalog {
    /// Create a catalog from configuration.
    ///
    /// Without a local root the index URL is required. The key URL defaults to
    /// `keys/avb_pkmd.bin` next to the index.
    pub fn new(config: &CatalogConfig, retry: RetryConfig) -> Result<Self> {
        let mut index_url = String::new();
        let mut public_key_url = String::new();

        if config.local_root.is_none() {
            if config.index_url.trim().is_empty() {
                return Err(Error::Config {
                    message: "catalog index URL is required outside development mode".to_string(),
                    key: Some("catalog.index_url".to_string()),
                });
            }
            let index = Url::parse(&config.index_url).map_err(|e| Error::Config {
                message: format!("invalid catalog index URL '{}': {}", config.index_url, e),
                key: Some("catalog.index_url".to_string()),
            })?;
            public_key_url = if config.public_key_url.trim().is_empty() {
                index
                    .join(PUBLIC_KEY_FILE)
                    .map_err(|e| Error::Config {
                        message: format!("cannot derive public key URL: {e}"),
                        key: Some("catalog.public_key_url".to_string()),
                    })?
                    .to_string()
            } else {
                config.public_key_url.clone()
            };
            index_url = index.to_string();
        }

        Ok(Self {
            client: reqwest::Client::new(),
            index_url,
            public_key_url,
            local_root: config.local_root.clone(),
            retry,
        })
    }

    /// Use a preconfigured HTTP client
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        retry_with_backoff(&self.retry, || async {
            let response = self.client.get(url).send().await?.error_for_status()?;
            Ok::<_, Error>(response.bytes().await?.to_vec())
        })
        .await
    }

    fn parse_index(&self, raw: &[u8]) -> Result<Vec<BuildEntry>> {
        let mut builds = match serde_json::from_slice::<IndexDocument>(raw)? {
            IndexDocument::List(builds) | IndexDocument::Wrapped { builds } => builds,
        };

        if let Some(root) = &self.local_root {
            for build in &mut builds {
                build.local_path = Some(root.join(&build.filename));
            }
        }

        builds.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.build_date.cmp(&a.build_date))
        });
        Ok(builds)
    }
}

#[async_trait]
impl RemoteCatalog for HttpCatalog {
    async fn builds(&self) -> Result<Vec<BuildEntry>> {
        let raw = match &self.local_root {
            Some(root) => {
                let path = root.join(INDEX_FILE);
                debug!(?path, "reading local build index");
                tokio::fs::read(&path).await.map_err(|e| {
                    Error::Catalog(format!("index not found at {}: {}", path.display(), e))
                })?
            }
            None => {
                debug!(url = %self.index_url, "fetching build index");
                self.fetch(&self.index_url).await?
            }
        };
        let builds = self.parse_index(&raw)?;
        info!(count = builds.len(), "loaded build index");
        Ok(builds)
    }

    async fn public_key(&self) -> Result<Vec<u8>> {
        let key = match &self.local_root {
            Some(root) => tokio::fs::read(root.join(PUBLIC_KEY_FILE)).await.map_err(Error::from),
            None => self.fetch(&self.public_key_url).await,
        }
        .map_err(|e| Error::Catalog(format!("could not download public key: {e}")))?;
        info!(bytes = key.len(), "fetched public key");
        Ok(key)
    }
}

/// Collect what `plan` needs from the catalog.
///
/// The key is only fetched when the plan provisions one, and a build must be
/// selected when the plan flashes a bundle.
pub async fn resolve_artifacts(
    catalog: &dyn RemoteCatalog,
    plan: &FlashPlan,
    build: Option<&BuildEntry>,
) -> Result<ResolvedArtifacts> {
    let key = if plan.flash_key {
        Some(catalog.public_key().await?)
    } else {
        None
    };

    let image = if plan.flash_zip {
        let build = build.ok_or_else(|| Error::Config {
            message: "flashing a bundle requires a selected build".to_string(),
            key: Some("build".to_string()),
        })?;
        Some(build.image_source())
    } else {
        None
    };

    Ok(ResolvedArtifacts { key, image })
}
