//! Portcullis plugins
//!
//! Distribution and sandboxed execution of proxy plugins:
//!
//! - fetching plugin archives from a registry, verifying and unpacking them
//!   ([`client`], [`archive`], [`manager`], [`setup`])
//! - reading the author's manifest and the operator's declarations
//!   ([`manifest`], [`types`], [`config`])
//! - running plugins as HTTP/TCP middlewares or configuration providers on
//!   an embedded Rhai interpreter ([`script`]) or a WASI sandbox ([`wasm`])
//!
//! ```rust,ignore
//! use portcullis_plugins::{Builder, Manager, StaticConfig, setup_remote_plugins};
//!
//! let cfg = StaticConfig::load(Path::new("portcullis.yml"))?;
//! let manager = Manager::new(Arc::new(cfg.downloader(cfg.storage.output.join("archives"))?), &cfg.storage.output)?;
//! setup_remote_plugins(&manager, &cfg.plugins).await?;
//!
//! let builder = Builder::new(manager.sources_root(), &cfg.plugins, &cfg.storage.local_root, &cfg.local_plugins)?;
//! let middleware = builder.build("allow", &config, "allow-local")?;
//! ```

pub mod archive;
pub mod builder;
pub mod client;
pub mod config;
pub mod decode;
pub mod manager;
pub mod manifest;
pub mod script;
pub mod setup;
pub mod types;
pub mod wasm;

mod error_conversions;

pub use builder::{BuildError, BuildResult, Builder, RuntimeLimits};
pub use client::{PluginDownloader, RegistryDownloader, RegistryError};
pub use config::StaticConfig;
pub use manager::{Manager, ManagerError};
pub use manifest::{MANIFEST_FILE, Manifest, PluginType, Runtime};
pub use setup::{
    SetupError, SetupResult, check_local_plugin_manifest, check_remote_plugins_configuration,
    setup_local_plugins, setup_remote_plugins,
};
pub use types::{Descriptor, EffectiveSettings, LocalDescriptor, Settings};
