//! Plugin manifest: the author's declaration shipped at the root of every
//! plugin tree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the manifest inside a plugin tree.
pub const MANIFEST_FILE: &str = ".portcullis.yml";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid manifest {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

pub type ManifestResult<T> = Result<T, ManifestError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    #[default]
    Middleware,
    Provider,
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginType::Middleware => write!(f, "middleware"),
            PluginType::Provider => write!(f, "provider"),
        }
    }
}

/// Execution backend of a plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Runtime {
    /// Interpreted sources, run by the embedded Rhai engine.
    #[default]
    #[serde(rename = "yaegi", alias = "rhai", alias = "script", alias = "")]
    Script,
    /// A compiled WebAssembly guest.
    #[serde(rename = "wasm")]
    Wasm,
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Runtime::Script => write!(f, "yaegi"),
            Runtime::Wasm => write!(f, "wasm"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub runtime: Runtime,
    #[serde(default)]
    pub wasm_path: String,
    #[serde(default)]
    pub import: String,
    #[serde(default)]
    pub base_pkg: String,
    #[serde(default)]
    pub compatibility: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub use_unsafe: bool,
    #[serde(default, rename = "supportsTCP")]
    pub supports_tcp: bool,
    #[serde(default)]
    pub test_data: serde_json::Value,
}

impl Manifest {
    /// Reads and parses `dir/.portcullis.yml`.
    pub fn read_from(dir: &Path) -> ManifestResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).map_err(|source| ManifestError::Read {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ManifestError::Parse { path, source })
    }

    pub fn is_script(&self) -> bool {
        self.runtime == Runtime::Script
    }

    /// Namespace the plugin's entry points live in.
    ///
    /// The explicit `basePkg` wins; otherwise the last segment of `import`
    /// with `-` replaced by `_`.
    pub fn base_pkg(&self) -> String {
        if !self.base_pkg.is_empty() {
            return self.base_pkg.clone();
        }
        self.import
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .replace('-', "_")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_ALLOW: &str = r#"
displayName: IP allow-list
type: middleware
import: github.com/acme/ip-allow
summary: Rejects clients outside a prefix
supportsTCP: true
testData:
  allowedIPPrefix: "127"
"#;

    #[test]
    fn parses_script_manifest() {
        let manifest: Manifest = serde_yaml::from_str(IP_ALLOW).unwrap();

        assert_eq!(manifest.display_name, "IP allow-list");
        assert_eq!(manifest.plugin_type, PluginType::Middleware);
        assert_eq!(manifest.runtime, Runtime::Script);
        assert!(manifest.supports_tcp);
        assert!(!manifest.use_unsafe);
        assert_eq!(manifest.test_data["allowedIPPrefix"], "127");
    }

    #[test]
    fn base_pkg_defaults_to_last_import_segment() {
        let manifest: Manifest = serde_yaml::from_str(IP_ALLOW).unwrap();
        assert_eq!(manifest.base_pkg(), "ip_allow");

        let explicit = Manifest {
            base_pkg: "allow".into(),
            ..manifest
        };
        assert_eq!(explicit.base_pkg(), "allow");

        let bare = Manifest {
            import: "testplugin".into(),
            ..Default::default()
        };
        assert_eq!(bare.base_pkg(), "testplugin");
    }

    #[test]
    fn runtime_accepts_aliases() {
        for (raw, expected) in [
            ("yaegi", Runtime::Script),
            ("rhai", Runtime::Script),
            ("wasm", Runtime::Wasm),
        ] {
            let doc = format!("type: provider\nruntime: {raw}\n");
            let manifest: Manifest = serde_yaml::from_str(&doc).unwrap();
            assert_eq!(manifest.runtime, expected);
            assert_eq!(manifest.plugin_type, PluginType::Provider);
        }
    }

    #[test]
    fn unknown_type_or_runtime_is_rejected() {
        assert!(serde_yaml::from_str::<Manifest>("type: filter\n").is_err());
        assert!(serde_yaml::from_str::<Manifest>("type: middleware\nruntime: lua\n").is_err());
    }

    #[test]
    fn read_from_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Manifest::read_from(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
        assert!(err.to_string().contains(MANIFEST_FILE));

        std::fs::write(dir.path().join(MANIFEST_FILE), "type: [").unwrap();
        let err = Manifest::read_from(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }
}
