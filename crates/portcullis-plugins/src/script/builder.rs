use super::convert::{dynamic_to_json, json_to_dynamic};
use super::middleware::{ScriptMiddleware, unpack_constructor_result};
use super::provider::{ScriptProvider, register_sender};
use super::resolver::{PluginModuleResolver, restricted_import};
use super::{
    CREATE_CONFIG, NEW_HANDLER, NEW_PROVIDER, NEW_TCP_HANDLER, PROVIDE, SERVE_HTTP, SERVE_TCP,
    STOP, ScriptError, ScriptResult,
};
use crate::archive::module_dir;
use crate::decode::decode_config;
use crate::manifest::{Manifest, PluginType};
use crate::types::EffectiveSettings;
use rhai::{AST, CallFnOptions, Dynamic, Engine, EvalAltResult, FuncArgs, Position, Scope};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Resource limits applied to every plugin engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScriptLimits {
    pub max_call_levels: usize,
    /// Operations allowed per entry point invocation, 0 for unlimited.
    pub max_operations: u64,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_string_size: usize,
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_call_levels: 64,
            max_operations: 1_000_000,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_string_size: 1_000_000,
        }
    }
}

/// Compiled plugin shared by all instances built from one declaration.
pub(crate) struct ScriptRuntime {
    engine: Engine,
    ast: AST,
    pub(crate) plugin: String,
    pub(crate) base_pkg: String,
    pub(crate) tcp_capable: bool,
}

impl ScriptRuntime {
    pub(crate) fn has_fn(&self, name: &str, arity: usize) -> bool {
        self.ast
            .iter_functions()
            .any(|f| f.name == name && f.params.len() == arity)
    }

    pub(crate) fn qualified(&self, symbol: &str) -> String {
        format!("{}::{symbol}", self.base_pkg)
    }

    pub(crate) fn call(
        &self,
        name: &str,
        args: impl FuncArgs,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        self.engine
            .call_fn::<Dynamic>(&mut Scope::new(), &self.ast, name, args)
    }

    /// Calls `name` with `this` bound to `this`; edits made through `this`
    /// are visible to the caller afterwards.
    pub(crate) fn call_method(
        &self,
        this: &mut Dynamic,
        name: &str,
        args: impl FuncArgs,
    ) -> Result<Dynamic, Box<EvalAltResult>> {
        let options = CallFnOptions::new().bind_this_ptr(this);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut Scope::new(), &self.ast, name, args)
    }
}

/// Builds middleware and provider instances from a script plugin.
#[derive(Clone)]
pub struct ScriptBuilder {
    runtime: Arc<ScriptRuntime>,
}

impl ScriptBuilder {
    /// Compiles the plugin found under `{root}/src/{manifest.import}`.
    pub fn new(root: &Path, manifest: &Manifest, settings: &EffectiveSettings) -> ScriptResult<Self> {
        Self::with_limits(root, manifest, settings, &ScriptLimits::default())
    }

    pub fn with_limits(
        root: &Path,
        manifest: &Manifest,
        settings: &EffectiveSettings,
        limits: &ScriptLimits,
    ) -> ScriptResult<Self> {
        let base_pkg = manifest.base_pkg();
        let plugin_dir = module_dir(&root.join("src"), &manifest.import);
        let entry = plugin_dir.join(format!("{base_pkg}.rhai"));

        let source = std::fs::read_to_string(&entry).map_err(|source| ScriptError::Read {
            path: entry.clone(),
            source,
        })?;

        let engine = new_engine(&plugin_dir, settings.allow_unsafe, limits, &manifest.import);
        let mut ast = engine
            .compile_into_self_contained(&Scope::new(), &source)
            .map_err(|err| match restricted_import(&err) {
                Some(path) => ScriptError::RestrictedImport { path },
                None => ScriptError::Compile {
                    path: entry.clone(),
                    message: err.to_string(),
                },
            })?;
        ast.set_source(entry.to_string_lossy().as_ref());

        let runtime = ScriptRuntime {
            engine,
            ast,
            plugin: manifest.import.clone(),
            base_pkg,
            tcp_capable: false,
        };

        let required: &[(&str, usize)] = match manifest.plugin_type {
            PluginType::Middleware => &[(CREATE_CONFIG, 0), (NEW_HANDLER, 2), (SERVE_HTTP, 1)],
            PluginType::Provider => &[(CREATE_CONFIG, 0), (NEW_PROVIDER, 2), (PROVIDE, 2), (STOP, 1)],
        };
        for (symbol, arity) in required {
            if !runtime.has_fn(symbol, *arity) {
                return Err(ScriptError::MissingSymbol {
                    symbol: format!("{}/{arity}", runtime.qualified(symbol)),
                });
            }
        }

        let tcp_capable = runtime.has_fn(NEW_TCP_HANDLER, 2) && runtime.has_fn(SERVE_TCP, 1);
        if manifest.supports_tcp != tcp_capable {
            warn!(
                plugin = %manifest.import,
                declared = manifest.supports_tcp,
                detected = tcp_capable,
                "manifest TCP support does not match plugin entry points"
            );
        }

        debug!(plugin = %manifest.import, entry = %entry.display(), tcp_capable, "script plugin compiled");

        Ok(Self {
            runtime: Arc::new(ScriptRuntime {
                tcp_capable,
                ..runtime
            }),
        })
    }

    pub fn base_pkg(&self) -> &str {
        &self.runtime.base_pkg
    }

    pub fn is_tcp_capable(&self) -> bool {
        self.runtime.tcp_capable
    }

    /// Decodes `config` over the plugin's `create_config` template.
    pub fn decode(&self, config: &serde_json::Map<String, serde_json::Value>, name: &str) -> ScriptResult<Dynamic> {
        let template = self
            .runtime
            .call(CREATE_CONFIG, ())
            .map_err(|err| ScriptError::Runtime {
                symbol: self.runtime.qualified(CREATE_CONFIG),
                message: err.to_string(),
            })?;

        let decoded = decode_config(dynamic_to_json(&template), config).map_err(|source| {
            ScriptError::Decode {
                name: name.to_string(),
                source,
            }
        })?;
        Ok(json_to_dynamic(&decoded))
    }

    /// Decodes the configuration once; the same value backs both
    /// `new_handler` and `new_tcp_handler`.
    pub fn new_middleware(
        &self,
        config: &serde_json::Map<String, serde_json::Value>,
        name: &str,
    ) -> ScriptResult<ScriptMiddleware> {
        let config = self.decode(config, name)?;
        Ok(ScriptMiddleware::new(self.runtime.clone(), config, name))
    }

    pub fn new_provider(
        &self,
        config: &serde_json::Map<String, serde_json::Value>,
        name: &str,
    ) -> ScriptResult<ScriptProvider> {
        let config = self.decode(config, name)?;
        let symbol = self.runtime.qualified(NEW_PROVIDER);
        let result = self
            .runtime
            .call(NEW_PROVIDER, (config, name.to_string()))
            .map_err(|err| ScriptError::Constructor {
                symbol: symbol.clone(),
                message: err.to_string(),
            })?;
        let state = unpack_constructor_result(&symbol, result)?;
        Ok(ScriptProvider::new(self.runtime.clone(), state, name))
    }
}

fn new_engine(plugin_dir: &Path, allow_unsafe: bool, limits: &ScriptLimits, plugin: &str) -> Engine {
    let mut engine = Engine::new();

    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_operations(limits.max_operations);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);
    engine.set_max_string_size(limits.max_string_size);

    let name = plugin.to_string();
    engine.on_print(move |s| info!(plugin = %name, "{s}"));
    let name = plugin.to_string();
    engine.on_debug(move |s, source, pos: Position| {
        debug!(plugin = %name, source = source.unwrap_or_default(), %pos, "{s}")
    });

    let name = plugin.to_string();
    engine.register_fn("log", move |msg: &str| info!(plugin = %name, "{msg}"));
    let name = plugin.to_string();
    engine.register_fn("warn", move |msg: &str| warn!(plugin = %name, "{msg}"));
    let name = plugin.to_string();
    engine.register_fn("error", move |msg: &str| error!(plugin = %name, "{msg}"));

    engine.register_fn("to_json", |value: Dynamic| dynamic_to_json(&value).to_string());
    engine.register_fn("parse_json", |text: &str| -> Result<Dynamic, Box<EvalAltResult>> {
        serde_json::from_str::<serde_json::Value>(text)
            .map(|value| json_to_dynamic(&value))
            .map_err(|e| e.to_string().into())
    });

    register_sender(&mut engine);
    engine.set_module_resolver(PluginModuleResolver::new(plugin_dir, allow_unsafe));
    engine
}
