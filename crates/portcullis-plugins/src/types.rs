//! Operator-side plugin declarations.

use crate::manifest::Manifest;
use serde::{Deserialize, Serialize};

/// Identity and pin of one remote plugin declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Module path in the registry, e.g. `github.com/acme/ip-allow`.
    // keys may arrive lowercased from the static config loader
    #[serde(alias = "modulename")]
    pub module_name: String,
    pub version: String,
    #[serde(default)]
    pub settings: Settings,
    /// Expected sha256 of the archive; empty means ask the registry.
    #[serde(default)]
    pub hash: String,
}

impl Descriptor {
    pub fn new(module_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            version: version.into(),
            ..Default::default()
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }
}

/// A plugin loaded straight from a local source tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDescriptor {
    #[serde(alias = "modulename")]
    pub module_name: String,
    #[serde(default)]
    pub settings: Settings,
}

/// Operator sandbox policy for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Host environment variable names visible to the guest.
    #[serde(default)]
    pub envs: Vec<String>,
    /// `host` or `host:guest` directory mounts.
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default, alias = "useunsafe")]
    pub use_unsafe: bool,
}

impl Settings {
    /// Merges operator policy with the author's manifest.
    pub fn effective(&self, manifest: &Manifest) -> EffectiveSettings {
        EffectiveSettings {
            envs: self.envs.clone(),
            mounts: self.mounts.clone(),
            allow_unsafe: manifest.use_unsafe && self.use_unsafe,
        }
    }
}

/// Sandbox policy in force for a built plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectiveSettings {
    pub envs: Vec<String>,
    pub mounts: Vec<String>,
    /// Both the author and the operator opted in.
    pub allow_unsafe: bool,
}
