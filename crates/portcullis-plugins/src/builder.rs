//! Turns installed plugins into middleware constructors and providers.

use crate::archive::module_dir;
use crate::manifest::{Manifest, ManifestError, PluginType, Runtime};
use crate::script::{ScriptBuilder, ScriptError, ScriptLimits};
use crate::types::{Descriptor, LocalDescriptor, Settings};
use crate::wasm::{WasmBuilder, WasmError, WasmLimits};
use portcullis_kernel::{HttpMiddleware, Provider, TcpMiddleware};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BuildError {
    #[error("unknown plugin {0:?}")]
    UnknownPlugin(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Wasm(#[from] WasmError),

    #[error("plugin {alias} is a {found}, not a {expected}")]
    WrongType {
        alias: String,
        expected: PluginType,
        found: PluginType,
    },

    #[error("plugin {alias}: the {runtime} runtime does not support {capability}")]
    UnsupportedRuntime {
        alias: String,
        runtime: Runtime,
        capability: &'static str,
    },

    #[error("plugin {0} does not support TCP")]
    NotTcpCapable(String),
}

pub type BuildResult<T> = Result<T, BuildError>;

/// Resource limits applied to plugin runtimes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLimits {
    pub script: ScriptLimits,
    pub wasm: WasmLimits,
}

enum PluginRuntime {
    Script(ScriptBuilder),
    Wasm(WasmBuilder),
}

struct PluginEntry {
    manifest: Manifest,
    runtime: PluginRuntime,
}

/// Holds one compiled runtime per declared plugin alias.
pub struct Builder {
    plugins: HashMap<String, PluginEntry>,
}

impl Builder {
    /// `sources_root` holds installed remote plugins under `src/`,
    /// `local_root` developer plugins under `src/`.
    pub fn new(
        sources_root: &Path,
        plugins: &HashMap<String, Descriptor>,
        local_root: &Path,
        local_plugins: &HashMap<String, LocalDescriptor>,
    ) -> BuildResult<Self> {
        Self::with_limits(
            sources_root,
            plugins,
            local_root,
            local_plugins,
            &RuntimeLimits::default(),
        )
    }

    pub fn with_limits(
        sources_root: &Path,
        plugins: &HashMap<String, Descriptor>,
        local_root: &Path,
        local_plugins: &HashMap<String, LocalDescriptor>,
        limits: &RuntimeLimits,
    ) -> BuildResult<Self> {
        let mut entries = HashMap::new();

        for (alias, desc) in plugins {
            let entry = load(sources_root, &desc.module_name, &desc.settings, limits)?;
            info!(plugin = %alias, module = %desc.module_name, version = %desc.version, runtime = %entry.manifest.runtime, "plugin loaded");
            entries.insert(alias.clone(), entry);
        }

        for (alias, desc) in local_plugins {
            let entry = load(local_root, &desc.module_name, &desc.settings, limits)?;
            info!(plugin = %alias, module = %desc.module_name, runtime = %entry.manifest.runtime, "local plugin loaded");
            entries.insert(alias.clone(), entry);
        }

        Ok(Self { plugins: entries })
    }

    pub fn manifest(&self, alias: &str) -> Option<&Manifest> {
        self.plugins.get(alias).map(|e| &e.manifest)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Whether `alias` can build TCP middlewares.
    pub fn is_tcp_capable(&self, alias: &str) -> bool {
        matches!(
            self.plugins.get(alias).map(|e| &e.runtime),
            Some(PluginRuntime::Script(script)) if script.is_tcp_capable()
        )
    }

    /// Builds the HTTP middleware `name` from plugin `alias`.
    pub fn build(
        &self,
        alias: &str,
        config: &Map<String, Value>,
        name: &str,
    ) -> BuildResult<Arc<dyn HttpMiddleware>> {
        let entry = self.entry(alias, PluginType::Middleware)?;
        debug!(plugin = %alias, middleware = %name, "building middleware");
        let middleware: Arc<dyn HttpMiddleware> = match &entry.runtime {
            PluginRuntime::Script(script) => Arc::new(script.new_middleware(config, name)?),
            PluginRuntime::Wasm(wasm) => Arc::new(wasm.new_middleware(config, name)?),
        };
        Ok(middleware)
    }

    /// Builds the TCP middleware `name` from plugin `alias`.
    pub fn build_tcp(
        &self,
        alias: &str,
        config: &Map<String, Value>,
        name: &str,
    ) -> BuildResult<Arc<dyn TcpMiddleware>> {
        let entry = self.entry(alias, PluginType::Middleware)?;
        match &entry.runtime {
            PluginRuntime::Script(script) if script.is_tcp_capable() => {
                debug!(plugin = %alias, middleware = %name, "building TCP middleware");
                Ok(Arc::new(script.new_middleware(config, name)?))
            }
            PluginRuntime::Script(_) => Err(BuildError::NotTcpCapable(alias.to_string())),
            PluginRuntime::Wasm(_) => Err(BuildError::UnsupportedRuntime {
                alias: alias.to_string(),
                runtime: Runtime::Wasm,
                capability: "TCP middlewares",
            }),
        }
    }

    /// Builds the provider of plugin `alias`, published as `plugin-{alias}`.
    pub fn build_provider(&self, alias: &str, config: &Map<String, Value>) -> BuildResult<Box<dyn Provider>> {
        let entry = self.entry(alias, PluginType::Provider)?;
        match &entry.runtime {
            PluginRuntime::Script(script) => {
                let provider = script.new_provider(config, &format!("plugin-{alias}"))?;
                Ok(Box::new(provider))
            }
            PluginRuntime::Wasm(_) => Err(BuildError::UnsupportedRuntime {
                alias: alias.to_string(),
                runtime: Runtime::Wasm,
                capability: "providers",
            }),
        }
    }

    fn entry(&self, alias: &str, expected: PluginType) -> BuildResult<&PluginEntry> {
        let entry = self
            .plugins
            .get(alias)
            .ok_or_else(|| BuildError::UnknownPlugin(alias.to_string()))?;
        if entry.manifest.plugin_type != expected {
            return Err(BuildError::WrongType {
                alias: alias.to_string(),
                expected,
                found: entry.manifest.plugin_type,
            });
        }
        Ok(entry)
    }
}

fn load(root: &Path, module: &str, settings: &Settings, limits: &RuntimeLimits) -> BuildResult<PluginEntry> {
    let plugin_dir = module_dir(&root.join("src"), module);
    let manifest = Manifest::read_from(&plugin_dir)?;
    let effective = settings.effective(&manifest);

    let runtime = match manifest.runtime {
        Runtime::Script => {
            PluginRuntime::Script(ScriptBuilder::with_limits(root, &manifest, &effective, &limits.script)?)
        }
        Runtime::Wasm => {
            PluginRuntime::Wasm(WasmBuilder::with_limits(&plugin_dir, &manifest, &effective, &limits.wasm)?)
        }
    };

    Ok(PluginEntry { manifest, runtime })
}
