//! Registry client: fetches plugin archives and checks their integrity.
//!
//! Protocol:
//! - `GET {base}/download/{module}/{version}`; the hash of an already present
//!   archive is sent in the hash header and the registry answers `304` when
//!   it is still current.
//! - `GET {base}/validate/{module}/{version}` with the same header; `200`
//!   means the registry vouches for that hash.

use crate::archive::archive_path;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

/// Default public registry.
pub const DEFAULT_REGISTRY_URL: &str = "https://plugins.portcullis.dev/public/";

/// Header carrying an archive hash in both directions.
pub const DEFAULT_HASH_HEADER: &str = "X-Plugin-Hash";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    #[error("invalid registry URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("unexpected registry response for {module}@{version}: {status}: {body}")]
    UnexpectedStatus {
        module: String,
        version: String,
        status: StatusCode,
        body: String,
    },

    #[error("plugin integrity check failed for {module}@{version}: expected hash {expected}, got {actual}")]
    HashMismatch {
        module: String,
        version: String,
        expected: String,
        actual: String,
    },

    #[error("registry rejected {module}@{version} with hash {hash}: {status}: {body}")]
    ValidationRejected {
        module: String,
        version: String,
        hash: String,
        status: StatusCode,
        body: String,
    },

    #[error("archive I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Source of plugin archives.
#[async_trait]
pub trait PluginDownloader: Send + Sync {
    /// Makes the archive of `module@version` available locally and returns
    /// its sha256 hex digest.
    async fn download(&self, module: &str, version: &str) -> RegistryResult<String>;

    /// Verifies `computed_hash`: against `pinned_hash` when one is set,
    /// otherwise with the registry.
    async fn check(
        &self,
        module: &str,
        version: &str,
        pinned_hash: &str,
        computed_hash: &str,
    ) -> RegistryResult<()>;
}

/// HTTP registry client writing archives under `archives`.
#[derive(Debug, Clone)]
pub struct RegistryDownloader {
    client: Client,
    base_url: Url,
    hash_header: String,
    archives: PathBuf,
}

impl RegistryDownloader {
    pub fn new(base_url: &str, archives: impl Into<PathBuf>) -> RegistryResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(RegistryError::Client)?;
        Self::with_client(client, base_url, archives)
    }

    /// Uses a preconfigured HTTP client (proxy, TLS roots, timeouts).
    pub fn with_client(
        client: Client,
        base_url: &str,
        archives: impl Into<PathBuf>,
    ) -> RegistryResult<Self> {
        Ok(Self {
            client,
            base_url: parse_base_url(base_url)?,
            hash_header: DEFAULT_HASH_HEADER.to_string(),
            archives: archives.into(),
        })
    }

    pub fn with_hash_header(mut self, header: impl Into<String>) -> Self {
        self.hash_header = header.into();
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, action: &str, module: &str, version: &str) -> RegistryResult<Url> {
        let relative = format!("{action}/{module}/{version}");
        self.base_url
            .join(&relative)
            .map_err(|source| RegistryError::InvalidUrl {
                url: format!("{}{relative}", self.base_url),
                source,
            })
    }

    async fn write_archive(
        &self,
        response: reqwest::Response,
        url: &Url,
        filename: &Path,
    ) -> RegistryResult<String> {
        let io_err = |source| RegistryError::Io {
            path: filename.to_path_buf(),
            source,
        };

        let dir = filename.parent().unwrap_or(&self.archives);
        std::fs::create_dir_all(dir).map_err(io_err)?;

        // Written beside the target so the final rename stays atomic.
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|source| RegistryError::Request {
                url: url.to_string(),
                source,
            })?;
            hasher.update(&chunk);
            tmp.write_all(&chunk).map_err(io_err)?;
        }

        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(filename).map_err(|e| io_err(e.error))?;

        Ok(hex::encode(hasher.finalize()))
    }
}

#[async_trait]
impl PluginDownloader for RegistryDownloader {
    async fn download(&self, module: &str, version: &str) -> RegistryResult<String> {
        let filename = archive_path(&self.archives, module, version);

        let local_hash = if filename.is_file() {
            Some(file_sha256(&filename).map_err(|source| RegistryError::Io {
                path: filename.clone(),
                source,
            })?)
        } else {
            None
        };

        let url = self.endpoint("download", module, version)?;
        let mut request = self.client.get(url.clone());
        if let Some(hash) = &local_hash {
            request = request.header(self.hash_header.as_str(), hash.as_str());
        }

        let response = request.send().await.map_err(|source| RegistryError::Request {
            url: url.to_string(),
            source,
        })?;

        match (response.status(), local_hash) {
            (StatusCode::NOT_MODIFIED, Some(hash)) => {
                debug!(module, version, "local archive is up to date");
                Ok(hash)
            }
            (StatusCode::OK, _) => {
                let hash = self.write_archive(response, &url, &filename).await?;
                info!(module, version, path = %filename.display(), "downloaded plugin archive");
                Ok(hash)
            }
            (status, _) => Err(RegistryError::UnexpectedStatus {
                module: module.to_string(),
                version: version.to_string(),
                status,
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn check(
        &self,
        module: &str,
        version: &str,
        pinned_hash: &str,
        computed_hash: &str,
    ) -> RegistryResult<()> {
        if !pinned_hash.is_empty() {
            if pinned_hash == computed_hash {
                return Ok(());
            }
            return Err(RegistryError::HashMismatch {
                module: module.to_string(),
                version: version.to_string(),
                expected: pinned_hash.to_string(),
                actual: computed_hash.to_string(),
            });
        }

        let url = self.endpoint("validate", module, version)?;
        let response = self
            .client
            .get(url.clone())
            .header(self.hash_header.as_str(), computed_hash)
            .send()
            .await
            .map_err(|source| RegistryError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status == StatusCode::OK {
            debug!(module, version, "registry validated archive hash");
            return Ok(());
        }

        Err(RegistryError::ValidationRejected {
            module: module.to_string(),
            version: version.to_string(),
            hash: computed_hash.to_string(),
            status,
            body: response.text().await.unwrap_or_default(),
        })
    }
}

fn parse_base_url(raw: &str) -> RegistryResult<Url> {
    // A base without a trailing slash would lose its last segment on join.
    let normalized = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    Url::parse(&normalized).map_err(|source| RegistryError::InvalidUrl {
        url: raw.to_string(),
        source,
    })
}

/// Computes the sha256 hex digest of a file.
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
