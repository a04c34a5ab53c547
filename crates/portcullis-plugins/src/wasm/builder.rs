use super::guest_config::GuestConfig;
use super::host::{self, Exchange, HostState, StoreLimits};
use super::sandbox::{Mount, Sandbox, allowed_root};
use super::sockets::{self, SocketTable, uses_socket_extension};
use super::{WasmError, WasmResult};
use crate::manifest::Manifest;
use crate::types::EffectiveSettings;
use async_trait::async_trait;
use http::StatusCode;
use portcullis_kernel::{
    HttpHandler, HttpMiddleware, HttpRequest, HttpResponse, PluginResult, SharedHttpHandler,
    remote_addr, text_response,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error};
use wasmtime::{Config, Engine, Instance, InstancePre, Linker, Module, Store};

/// Per-instance resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WasmLimits {
    pub max_memory_bytes: u64,
    pub max_table_elements: u32,
}

impl Default for WasmLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 64 * 1024 * 1024,
            max_table_elements: 10_000,
        }
    }
}

struct WasmPlugin {
    engine: Engine,
    pre: InstancePre<HostState>,
    path: PathBuf,
    plugin: Arc<str>,
    envs: Vec<String>,
    mounts: Vec<Mount>,
    network: bool,
    limits: WasmLimits,
}

/// Compiles a wasm plugin once and builds middleware instances from it.
#[derive(Clone)]
pub struct WasmBuilder {
    plugin: Arc<WasmPlugin>,
}

impl WasmBuilder {
    /// Compiles `{plugin_dir}/{manifest.wasm_path}`.
    pub fn new(plugin_dir: &Path, manifest: &Manifest, settings: &EffectiveSettings) -> WasmResult<Self> {
        Self::with_limits(plugin_dir, manifest, settings, &WasmLimits::default())
    }

    pub fn with_limits(
        plugin_dir: &Path,
        manifest: &Manifest,
        settings: &EffectiveSettings,
        limits: &WasmLimits,
    ) -> WasmResult<Self> {
        let path = plugin_dir.join(&manifest.wasm_path);
        let bytes = std::fs::read(&path).map_err(|source| WasmError::Read {
            path: path.clone(),
            source,
        })?;

        let engine = Engine::new(&Config::new()).map_err(|e| WasmError::Internal(e.to_string()))?;
        let module = Module::new(&engine, &bytes).map_err(|e| WasmError::Compile {
            path: path.clone(),
            message: e.to_string(),
        })?;

        let network = uses_socket_extension(&module);

        let mut linker: Linker<HostState> = Linker::new(&engine);
        wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| WasmError::Internal(e.to_string()))?;
        host::add_to_linker(&mut linker)?;
        if network {
            sockets::add_to_linker(&mut linker)?;
        }

        let pre = linker
            .instantiate_pre(&module)
            .map_err(|e| WasmError::Instantiation(e.to_string()))?;

        let mounts = settings
            .mounts
            .iter()
            .map(|m| m.parse::<Mount>())
            .collect::<WasmResult<Vec<_>>>()?;

        debug!(
            plugin = %manifest.display_name,
            path = %path.display(),
            network,
            "wasm plugin compiled"
        );

        Ok(Self {
            plugin: Arc::new(WasmPlugin {
                engine,
                pre,
                path,
                plugin: Arc::from(manifest.display_name.as_str()),
                envs: settings.envs.clone(),
                mounts,
                network,
                limits: limits.clone(),
            }),
        })
    }

    /// Whether the guest imports the socket extension.
    pub fn uses_sockets(&self) -> bool {
        self.plugin.network
    }

    pub fn path(&self) -> &Path {
        &self.plugin.path
    }

    pub fn new_middleware(&self, config: &Map<String, Value>, name: &str) -> WasmResult<WasmMiddleware> {
        let guest = GuestConfig::from_map(config)?;
        let root_fs = guest
            .root_fs
            .as_deref()
            .map(|root| allowed_root(root, &self.plugin.mounts))
            .transpose()?;

        Ok(WasmMiddleware {
            plugin: self.plugin.clone(),
            sandbox: Sandbox {
                envs: self.plugin.envs.clone(),
                mounts: self.plugin.mounts.clone(),
                root_fs,
                network: self.plugin.network,
            },
            config: Arc::new(guest.config),
            name: name.to_string(),
        })
    }
}

/// A configured instance of a wasm middleware.
#[derive(Clone)]
pub struct WasmMiddleware {
    plugin: Arc<WasmPlugin>,
    sandbox: Sandbox,
    config: Arc<Vec<u8>>,
    name: String,
}

impl WasmMiddleware {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The JSON document served to the guest by `get_config`.
    pub fn guest_config(&self) -> &[u8] {
        &self.config
    }

    fn store(&self, exchange: Exchange) -> WasmResult<Store<HostState>> {
        let state = HostState {
            wasi: self.sandbox.wasi_ctx()?,
            limits: StoreLimits {
                max_memory_bytes: self.plugin.limits.max_memory_bytes,
                max_table_elements: self.plugin.limits.max_table_elements,
            },
            exchange,
            config: self.config.clone(),
            features: 0,
            sockets: SocketTable::default(),
            plugin: self.plugin.plugin.clone(),
        };
        let mut store = Store::new(&self.plugin.engine, state);
        store.limiter(|state| &mut state.limits);
        Ok(store)
    }

    /// Instantiates the guest and runs its initializer.
    fn instantiate(&self, store: &mut Store<HostState>) -> WasmResult<Instance> {
        let instance = self
            .plugin
            .pre
            .instantiate(&mut *store)
            .map_err(|e| WasmError::Instantiation(e.to_string()))?;

        if let Ok(init) = instance.get_typed_func::<(), ()>(&mut *store, "_initialize") {
            init.call(&mut *store, ())
                .map_err(|e| WasmError::Instantiation(e.to_string()))?;
        } else if let Ok(start) = instance.get_typed_func::<(), ()>(&mut *store, "_start") {
            if let Err(err) = start.call(&mut *store, ()) {
                let clean_exit = err
                    .downcast_ref::<wasmtime_wasi::I32Exit>()
                    .is_some_and(|exit| exit.0 == 0);
                if !clean_exit {
                    return Err(WasmError::Instantiation(err.to_string()));
                }
            }
        }
        Ok(instance)
    }

    async fn handle(
        &self,
        req: HttpRequest,
        peer: Option<SocketAddr>,
        next: &SharedHttpHandler,
    ) -> WasmResult<HttpResponse> {
        let middleware = self.clone();
        let (mut store, instance, ctx_next) = run_guest(move || {
            let mut store = middleware.store(Exchange::new(req, peer))?;
            let instance = middleware.instantiate(&mut store)?;
            let handle_request = instance
                .get_typed_func::<(), i64>(&mut store, "handle_request")
                .map_err(|_| WasmError::ExportNotFound("handle_request".to_string()))?;
            let ctx_next = handle_request
                .call(&mut store, ())
                .map_err(|e| WasmError::Execution(e.to_string()))?;
            Ok((store, instance, ctx_next))
        })
        .await?;

        if ctx_next & 1 == 0 {
            return Ok(store.data_mut().exchange.take_response());
        }

        let request = store.data_mut().exchange.take_request();
        let response = next.serve_http(request).await;
        store.data_mut().exchange.set_response(response);

        run_guest(move || {
            if let Ok(handle_response) =
                instance.get_typed_func::<(i32, i32), ()>(&mut store, "handle_response")
            {
                let ctx = (ctx_next >> 32) as i32;
                handle_response
                    .call(&mut store, (ctx, 0))
                    .map_err(|e| WasmError::Execution(e.to_string()))?;
            }
            Ok(store.data_mut().exchange.take_response())
        })
        .await
    }
}

/// Runs guest code on the blocking pool.
async fn run_guest<T, F>(f: F) -> WasmResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> WasmResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WasmError::Internal(e.to_string()))?
}

impl HttpMiddleware for WasmMiddleware {
    fn new_handler(&self, next: SharedHttpHandler) -> PluginResult<SharedHttpHandler> {
        // Surfaces guest configuration errors at build time.
        let mut store = self.store(Exchange::default())?;
        self.instantiate(&mut store)?;

        Ok(Arc::new(WasmHandler {
            middleware: self.clone(),
            next,
        }))
    }
}

/// HTTP handler dispatching each request to a fresh guest instance.
pub struct WasmHandler {
    middleware: WasmMiddleware,
    next: SharedHttpHandler,
}

#[async_trait]
impl HttpHandler for WasmHandler {
    async fn serve_http(&self, req: HttpRequest) -> HttpResponse {
        let peer = remote_addr(&req);
        match self.middleware.handle(req, peer, &self.next).await {
            Ok(response) => response,
            Err(err) => {
                error!(middleware = %self.middleware.name, error = %err, "wasm middleware failed");
                text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    StatusCode::INTERNAL_SERVER_ERROR.canonical_reason().unwrap_or_default(),
                )
            }
        }
    }
}
