//! Typed errors surfaced to the router layer by plugin constructors and providers.

use thiserror::Error;

/// Errors a plugin can report through the kernel contracts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// Plugin code or its runtime could not be loaded.
    #[error("Plugin load failed: {0}")]
    LoadFailed(String),

    /// A constructor (`new_handler`, `new_provider`, ...) failed.
    #[error("Plugin initialization failed: {0}")]
    InitFailed(String),

    /// Plugin code failed while running.
    #[error("Plugin execution failed: {0}")]
    ExecutionFailed(String),

    /// The plugin does not offer the requested capability.
    #[error("Plugin does not support {0}")]
    Unsupported(String),

    /// Plugin configuration is invalid or could not be decoded.
    #[error("Plugin configuration error: {0}")]
    ConfigError(String),

    /// The plugin's sandbox policy forbids the requested operation.
    #[error("Plugin sandbox policy violation: {0}")]
    Policy(String),

    /// An I/O error surfaced during a plugin operation.
    #[error("Plugin I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// A (de)serialization error surfaced during a plugin operation.
    #[error("Plugin serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}
