//! Portcullis kernel
//!
//! Contracts between the plugin subsystem and the router layer: HTTP and TCP
//! handler traits, the middleware constructors plugins produce, the
//! configuration `Provider` trait, the canonical dynamic configuration and
//! the task pool providers run on.

// config module
#[cfg(feature = "config")]
pub mod config;

// http handler module
pub mod handler;
pub use handler::*;

// tcp module
pub mod tcp;
pub use tcp::*;

// dynamic configuration module
pub mod dynamic;
pub use dynamic::{ConfigMessage, Configuration};

// task pool module
pub mod safe;
pub use safe::Pool;

// plugin module
pub mod plugin;
pub use plugin::*;
