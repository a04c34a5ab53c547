//! Interpreted plugin runtime backed by Rhai.
//!
//! A script plugin is a source tree under `{root}/src/{import}` whose entry
//! file is `{base_pkg}.rhai`. One engine and one compiled AST are built per
//! plugin declaration and shared by every middleware or provider instance
//! created from it.
//!
//! Entry points a plugin defines:
//!
//! | function | role |
//! |---|---|
//! | `create_config()` | zero-valued config map, decoding template |
//! | `new_handler(config, name)` | HTTP handler state |
//! | `new_tcp_handler(config, name)` | TCP handler state, optional |
//! | `serve_http(handler)` | per request; the request is `this` |
//! | `serve_tcp(handler)` | per connection; `this` holds `remote_addr` |
//! | `new_provider(config, name)` | provider state |
//! | `init(provider)` | optional provider setup |
//! | `provide(provider, sender)` | publishes configuration documents |
//! | `stop(provider)` | provider shutdown |
//!
//! Constructors return the handler value itself or a two element array
//! `[handler, error]` where `error` is `()` on success.

mod builder;
mod convert;
mod middleware;
mod provider;
mod resolver;

pub use builder::{ScriptBuilder, ScriptLimits};
pub use convert::{dynamic_to_json, json_to_dynamic};
pub use middleware::{ScriptHttpHandler, ScriptMiddleware, ScriptTcpHandler};
pub use provider::{ConfigSender, ScriptProvider};
pub use resolver::RESTRICTED_MODULES;

use crate::decode::DecodeError;
use std::path::PathBuf;
use thiserror::Error;

pub const CREATE_CONFIG: &str = "create_config";
pub const NEW_HANDLER: &str = "new_handler";
pub const NEW_TCP_HANDLER: &str = "new_tcp_handler";
pub const SERVE_HTTP: &str = "serve_http";
pub const SERVE_TCP: &str = "serve_tcp";
pub const NEW_PROVIDER: &str = "new_provider";
pub const INIT: &str = "init";
pub const PROVIDE: &str = "provide";
pub const STOP: &str = "stop";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ScriptError {
    #[error("failed to read plugin source {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile plugin {path}: {message}")]
    Compile { path: PathBuf, message: String },

    #[error(
        "restricted imports: module {path:?} requires useUnsafe in both the plugin manifest and its settings"
    )]
    RestrictedImport { path: String },

    #[error("plugin does not define {symbol}")]
    MissingSymbol { symbol: String },

    #[error("failed to decode configuration of {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: DecodeError,
    },

    #[error("{symbol} returned an invalid result: {detail}")]
    InvalidConstructorResult { symbol: String, detail: String },

    #[error("{symbol} failed: {message}")]
    Constructor { symbol: String, message: String },

    #[error("{symbol} failed: {message}")]
    Runtime { symbol: String, message: String },

    #[error("plugin {plugin} has no TCP handler")]
    NotTcpCapable { plugin: String },
}

pub type ScriptResult<T> = Result<T, ScriptError>;
