//! Capabilities a loaded plugin exposes to the router layer.
//!
//! A middleware plugin yields an [`HttpMiddleware`] (and, when TCP-capable, a
//! [`TcpMiddleware`]) per middleware declaration; the router calls it once per
//! chain build to wrap the next handler. A provider plugin yields a
//! [`Provider`] that streams [`ConfigMessage`]s.

use crate::dynamic::ConfigMessage;
use crate::handler::SharedHttpHandler;
use crate::safe::Pool;
use crate::tcp::SharedTcpHandler;
use tokio::sync::mpsc;

pub mod error;
pub use error::PluginError;

/// Result type of the plugin contracts.
pub type PluginResult<T> = Result<T, PluginError>;

/// Builds an HTTP handler wrapping `next`.
pub trait HttpMiddleware: Send + Sync {
    fn new_handler(&self, next: SharedHttpHandler) -> PluginResult<SharedHttpHandler>;
}

/// Builds a TCP handler wrapping `next`.
pub trait TcpMiddleware: Send + Sync {
    fn new_tcp_handler(&self, next: SharedTcpHandler) -> PluginResult<SharedTcpHandler>;
}

/// A source of dynamic configuration.
pub trait Provider: Send + Sync {
    /// Prepares the provider; called once before [`Provider::provide`].
    fn init(&self) -> PluginResult<()>;

    /// Starts publishing configuration on `tx`. Background work must run on
    /// `pool` and end when the pool is stopped.
    fn provide(&self, tx: mpsc::Sender<ConfigMessage>, pool: &Pool) -> PluginResult<()>;

    /// Stops the provider. Must return promptly.
    fn stop(&self) -> PluginResult<()>;
}
