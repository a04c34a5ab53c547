//! Sandboxed WebAssembly plugin runtime.
//!
//! A wasm plugin is compiled once per declaration. Each request gets a fresh
//! store and instance created from a pre-linked [`wasmtime::InstancePre`],
//! so guests never share state across requests.
//!
//! Guests talk to the proxy through the `http_handler` host module and see
//! the host only through WASI preview 1: allow-listed environment variables,
//! allow-listed directory mounts and, when the guest imports the socket
//! extension, the host network.

mod builder;
mod guest_config;
mod host;
mod sandbox;
mod sockets;

pub use builder::{WasmBuilder, WasmHandler, WasmLimits, WasmMiddleware};
pub use guest_config::GuestConfig;
pub use sandbox::Mount;
pub use sockets::{SOCKET_IMPORTS, uses_socket_extension};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WasmError {
    #[error("failed to read wasm module {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compile wasm module {path}: {message}")]
    Compile { path: PathBuf, message: String },

    #[error("invalid mount {mount:?}: {reason}")]
    InvalidMount { mount: String, reason: String },

    #[error("invalid guest configuration: {0}")]
    GuestConfig(String),

    #[error("failed to instantiate wasm guest: {0}")]
    Instantiation(String),

    #[error("wasm guest does not export {0}")]
    ExportNotFound(String),

    #[error("wasm guest failed: {0}")]
    Execution(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type WasmResult<T> = Result<T, WasmError>;
