//! Import resolution for script plugins.
//!
//! Plugin-relative imports resolve to `.rhai` files under the plugin's own
//! directory. The host-level modules in [`RESTRICTED_MODULES`] are only
//! served when the plugin runs with unsafe access.

use rhai::module_resolvers::FileModuleResolver;
use rhai::{AST, Dynamic, Engine, EvalAltResult, INT, Module, ModuleResolver, Position, Shared};
use std::collections::HashMap;
use std::path::Path;

/// Modules that expose host process state to a script.
pub const RESTRICTED_MODULES: &[&str] = &["unsafe", "syscall"];

/// Error payload raised when a script imports a restricted module without
/// unsafe access.
#[derive(Debug, Clone)]
pub(crate) struct RestrictedImport {
    pub(crate) path: String,
}

pub(crate) struct PluginModuleResolver {
    files: FileModuleResolver,
    restricted: HashMap<&'static str, Shared<Module>>,
    allow_unsafe: bool,
}

impl PluginModuleResolver {
    pub(crate) fn new(plugin_dir: &Path, allow_unsafe: bool) -> Self {
        let mut restricted = HashMap::new();
        restricted.insert("syscall", Shared::new(syscall_module()));
        restricted.insert("unsafe", Shared::new(unsafe_module()));

        Self {
            files: FileModuleResolver::new_with_path(plugin_dir),
            restricted,
            allow_unsafe,
        }
    }
}

impl ModuleResolver for PluginModuleResolver {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        match self.restricted.get(path) {
            Some(_) if !self.allow_unsafe => Err(EvalAltResult::ErrorRuntime(
                Dynamic::from(RestrictedImport {
                    path: path.to_string(),
                }),
                pos,
            )
            .into()),
            Some(module) => Ok(module.clone()),
            None => self.files.resolve(engine, source, path, pos),
        }
    }

    fn resolve_ast(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Option<Result<AST, Box<EvalAltResult>>> {
        if self.restricted.contains_key(path) {
            return None;
        }
        self.files.resolve_ast(engine, source, path, pos)
    }
}

/// Extracts the restricted module path from a resolution error, looking
/// through errors raised inside imported modules.
pub(crate) fn restricted_import(err: &EvalAltResult) -> Option<String> {
    match err {
        EvalAltResult::ErrorRuntime(value, _) => value
            .clone()
            .try_cast::<RestrictedImport>()
            .map(|r| r.path),
        EvalAltResult::ErrorInModule(_, inner, _) => restricted_import(inner),
        _ => None,
    }
}

fn syscall_module() -> Module {
    fn getpid() -> Result<INT, Box<EvalAltResult>> {
        Ok(INT::from(std::process::id()))
    }

    fn getenv(name: &str) -> Result<String, Box<EvalAltResult>> {
        Ok(std::env::var(name).unwrap_or_default())
    }

    fn hostname() -> Result<String, Box<EvalAltResult>> {
        Ok(std::env::var("HOSTNAME").unwrap_or_default())
    }

    let mut module = Module::new();
    module.set_native_fn("getpid", getpid);
    module.set_native_fn("getenv", getenv);
    module.set_native_fn("hostname", hostname);
    module.build_index();
    module
}

fn unsafe_module() -> Module {
    fn pointer_width() -> Result<INT, Box<EvalAltResult>> {
        Ok(INT::try_from(usize::BITS).unwrap_or(64))
    }

    fn size_of_int() -> Result<INT, Box<EvalAltResult>> {
        Ok(INT::try_from(std::mem::size_of::<INT>()).unwrap_or(8))
    }

    let mut module = Module::new();
    module.set_native_fn("pointer_width", pointer_width);
    module.set_native_fn("size_of_int", size_of_int);
    module.build_index();
    module
}
