use super::builder::ScriptRuntime;
use super::convert::{apply_request_changes, conn_to_dynamic, request_to_dynamic, response_from_dynamic};
use super::{NEW_HANDLER, NEW_TCP_HANDLER, SERVE_HTTP, SERVE_TCP, ScriptError, ScriptResult};
use async_trait::async_trait;
use http::{Request, StatusCode};
use portcullis_kernel::{
    HttpHandler, HttpMiddleware, HttpRequest, HttpResponse, PluginResult, SharedHttpHandler,
    SharedTcpHandler, TcpConn, TcpHandler, TcpMiddleware, remote_addr, text_response,
};
use rhai::{Array, Dynamic, Map};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

/// A configured instance of a script middleware.
///
/// Holds the decoded configuration; each `new_handler` / `new_tcp_handler`
/// call runs the plugin's constructor against it.
#[derive(Clone)]
pub struct ScriptMiddleware {
    runtime: Arc<ScriptRuntime>,
    config: Dynamic,
    name: String,
}

impl ScriptMiddleware {
    pub(crate) fn new(runtime: Arc<ScriptRuntime>, config: Dynamic, name: &str) -> Self {
        Self {
            runtime,
            config,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The decoded configuration passed to constructors.
    pub fn config(&self) -> &Dynamic {
        &self.config
    }

    fn construct(&self, symbol: &str) -> ScriptResult<Dynamic> {
        let qualified = self.runtime.qualified(symbol);
        let result = self
            .runtime
            .call(symbol, (self.config.clone(), self.name.clone()))
            .map_err(|err| ScriptError::Constructor {
                symbol: qualified.clone(),
                message: err.to_string(),
            })?;
        unpack_constructor_result(&qualified, result)
    }
}

impl HttpMiddleware for ScriptMiddleware {
    fn new_handler(&self, next: SharedHttpHandler) -> PluginResult<SharedHttpHandler> {
        let state = self.construct(NEW_HANDLER)?;
        Ok(Arc::new(ScriptHttpHandler {
            runtime: self.runtime.clone(),
            state,
            next,
            name: self.name.clone(),
        }))
    }
}

impl TcpMiddleware for ScriptMiddleware {
    fn new_tcp_handler(&self, next: SharedTcpHandler) -> PluginResult<SharedTcpHandler> {
        if !self.runtime.tcp_capable {
            return Err(ScriptError::NotTcpCapable {
                plugin: self.runtime.plugin.clone(),
            }
            .into());
        }
        let state = self.construct(NEW_TCP_HANDLER)?;
        Ok(Arc::new(ScriptTcpHandler {
            runtime: self.runtime.clone(),
            state,
            next,
            name: self.name.clone(),
        }))
    }
}

/// Accepts a bare handler value or a `[handler, error]` pair.
pub(crate) fn unpack_constructor_result(symbol: &str, result: Dynamic) -> ScriptResult<Dynamic> {
    if result.is_unit() {
        return Err(ScriptError::InvalidConstructorResult {
            symbol: symbol.to_string(),
            detail: "no handler returned".to_string(),
        });
    }

    if !result.is_array() {
        return Ok(result);
    }

    let pair: Array = result.cast::<Array>();
    let [handler, err]: [Dynamic; 2] = match pair.try_into() {
        Ok(pair) => pair,
        Err(other) => return Ok(Dynamic::from(other)),
    };

    if !err.is_unit() {
        let message = if err.is_string() {
            err.to_string()
        } else if let Some(message) = err
            .read_lock::<Map>()
            .and_then(|map| map.get("message").map(|m| m.to_string()))
        {
            message
        } else {
            return Err(ScriptError::InvalidConstructorResult {
                symbol: symbol.to_string(),
                detail: format!("second result must be an error, got {}", err.type_name()),
            });
        };
        return Err(ScriptError::Constructor {
            symbol: symbol.to_string(),
            message,
        });
    }

    if handler.is_unit() {
        return Err(ScriptError::InvalidConstructorResult {
            symbol: symbol.to_string(),
            detail: "no handler returned".to_string(),
        });
    }
    Ok(handler)
}

/// HTTP handler backed by a script's `serve_http`.
pub struct ScriptHttpHandler {
    runtime: Arc<ScriptRuntime>,
    state: Dynamic,
    next: SharedHttpHandler,
    name: String,
}

impl ScriptHttpHandler {
    fn fail(&self, message: impl std::fmt::Display) -> HttpResponse {
        error!(middleware = %self.name, error = %message, "script middleware failed");
        text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::INTERNAL_SERVER_ERROR.canonical_reason().unwrap_or_default(),
        )
    }
}

#[async_trait]
impl HttpHandler for ScriptHttpHandler {
    async fn serve_http(&self, req: HttpRequest) -> HttpResponse {
        let peer = remote_addr(&req);
        let (mut parts, mut body) = req.into_parts();
        let mut view = request_to_dynamic(&parts, &body, peer);

        let outcome = match self.runtime.call_method(&mut view, SERVE_HTTP, (self.state.clone(),)) {
            Ok(outcome) => outcome,
            Err(err) => return self.fail(err),
        };

        if !outcome.is_unit() {
            return match response_from_dynamic(outcome) {
                Ok(response) => response,
                Err(err) => self.fail(err),
            };
        }

        if let Err(err) = apply_request_changes(&mut parts, &mut body, view) {
            return self.fail(err);
        }
        self.next.serve_http(Request::from_parts(parts, body)).await
    }
}

/// TCP handler backed by a script's `serve_tcp`.
pub struct ScriptTcpHandler {
    runtime: Arc<ScriptRuntime>,
    state: Dynamic,
    next: SharedTcpHandler,
    name: String,
}

#[async_trait]
impl TcpHandler for ScriptTcpHandler {
    async fn serve_tcp(&self, conn: TcpConn) -> io::Result<()> {
        let mut view = conn_to_dynamic(conn.remote_addr());
        let verdict = self
            .runtime
            .call_method(&mut view, SERVE_TCP, (self.state.clone(),))
            .map_err(|err| err.to_string())
            .and_then(|v| {
                v.as_bool()
                    .map_err(|t| format!("serve_tcp must return a bool, got {t}"))
            });

        match verdict {
            Ok(true) => self.next.serve_tcp(conn).await,
            Ok(false) => {
                debug!(middleware = %self.name, remote = %conn.remote_addr(), "connection refused by plugin");
                conn.into_stream().shutdown().await
            }
            Err(err) => {
                error!(middleware = %self.name, error = %err, "script middleware failed");
                let _ = conn.into_stream().shutdown().await;
                Err(io::Error::other(err))
            }
        }
    }
}
