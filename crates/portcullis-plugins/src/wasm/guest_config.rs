use super::{WasmError, WasmResult};
use serde::Deserialize;
use serde_json::{Map, Value};

/// Configuration handed to a wasm guest.
#[derive(Debug, Clone, PartialEq)]
pub struct GuestConfig {
    /// Host directory the guest asked to see as `/`.
    pub root_fs: Option<String>,
    /// JSON document returned by `get_config`.
    pub config: Vec<u8>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeSection {
    #[serde(default, rename = "rootFS", alias = "rootfs")]
    root_fs: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    runtime: Option<RuntimeSection>,
    #[serde(default)]
    config: Option<Value>,
}

impl GuestConfig {
    /// Reads `{runtime: {rootFS}, config}` first; a document with neither
    /// key is taken as the guest configuration itself.
    pub fn from_map(raw: &Map<String, Value>) -> WasmResult<Self> {
        let envelope: Envelope = serde_json::from_value(Value::Object(raw.clone()))
            .map_err(|e| WasmError::GuestConfig(e.to_string()))?;

        if envelope.runtime.is_none() && envelope.config.is_none() {
            let config = serde_json::to_vec(raw).map_err(|e| WasmError::GuestConfig(e.to_string()))?;
            return Ok(Self {
                root_fs: None,
                config,
            });
        }

        let root_fs = envelope
            .runtime
            .map(|r| r.root_fs)
            .filter(|root| !root.is_empty());
        let config = match envelope.config {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(config) => config,
        };

        Ok(Self {
            root_fs,
            config: serde_json::to_vec(&config).map_err(|e| WasmError::GuestConfig(e.to_string()))?,
        })
    }
}
