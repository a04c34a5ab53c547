//! Static configuration of the plugin subsystem.

use crate::builder::RuntimeLimits;
use crate::client::{DEFAULT_HASH_HEADER, DEFAULT_REGISTRY_URL, RegistryDownloader, RegistryError};
use crate::types::{Descriptor, LocalDescriptor};
use portcullis_kernel::config::{ConfigResult, load_config};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Plugin section of the operator's static configuration.
///
/// ```yaml
/// registry:
///   baseUrl: https://plugins.example.com/public/
/// storage:
///   output: ./plugins-storage
/// plugins:
///   allow:
///     moduleName: github.com/acme/ip-allow
///     version: v1.2.0
/// localPlugins:
///   dev:
///     moduleName: example.com/dev
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StaticConfig {
    pub registry: RegistryConfig,
    pub storage: StorageConfig,
    pub plugins: HashMap<String, Descriptor>,
    #[serde(alias = "localplugins")]
    pub local_plugins: HashMap<String, LocalDescriptor>,
    pub limits: RuntimeLimits,
}

impl StaticConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        load_config(path)
    }

    /// Registry client writing archives under `archives`.
    pub fn downloader(&self, archives: impl Into<PathBuf>) -> Result<RegistryDownloader, RegistryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.registry.timeout_secs))
            .build()
            .map_err(RegistryError::Client)?;
        Ok(RegistryDownloader::with_client(client, &self.registry.base_url, archives)?
            .with_hash_header(&self.registry.hash_header))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    #[serde(alias = "baseurl")]
    pub base_url: String,
    #[serde(alias = "hashheader")]
    pub hash_header: String,
    #[serde(alias = "timeoutsecs")]
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REGISTRY_URL.to_string(),
            hash_header: DEFAULT_HASH_HEADER.to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Archives, state file and extracted sources.
    pub output: PathBuf,
    /// Developer plugins, laid out as `src/{module}`.
    #[serde(alias = "localroot")]
    pub local_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output: PathBuf::from("./plugins-storage"),
            local_root: PathBuf::from("./plugins-local"),
        }
    }
}
