//! Cross-crate error conversions for portcullis-plugins
//!
//! Implements `From<DomainError> for PluginError` so that runtime-specific
//! errors from this crate surface through the kernel middleware and
//! provider contracts with the `?` operator.

use crate::builder::BuildError;
use crate::script::ScriptError;
use crate::wasm::WasmError;
use portcullis_kernel::PluginError;

// ============================================================================
// ScriptError → PluginError
// ============================================================================

impl From<ScriptError> for PluginError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Read { .. } | ScriptError::Compile { .. } | ScriptError::MissingSymbol { .. } => {
                PluginError::LoadFailed(err.to_string())
            }
            ScriptError::RestrictedImport { .. } => PluginError::Policy(err.to_string()),
            ScriptError::Decode { .. } => PluginError::ConfigError(err.to_string()),
            ScriptError::InvalidConstructorResult { .. } | ScriptError::Constructor { .. } => {
                PluginError::InitFailed(err.to_string())
            }
            ScriptError::Runtime { .. } => PluginError::ExecutionFailed(err.to_string()),
            ScriptError::NotTcpCapable { .. } => PluginError::Unsupported(err.to_string()),
        }
    }
}

// ============================================================================
// WasmError → PluginError
// ============================================================================

impl From<WasmError> for PluginError {
    fn from(err: WasmError) -> Self {
        match err {
            WasmError::Read { .. } | WasmError::Compile { .. } => PluginError::LoadFailed(err.to_string()),
            WasmError::InvalidMount { .. } | WasmError::GuestConfig(_) => {
                PluginError::ConfigError(err.to_string())
            }
            WasmError::Instantiation(_) | WasmError::ExportNotFound(_) => {
                PluginError::InitFailed(err.to_string())
            }
            WasmError::Execution(_) => PluginError::ExecutionFailed(err.to_string()),
            WasmError::Internal(_) => PluginError::Other(err.to_string()),
        }
    }
}

// ============================================================================
// BuildError → PluginError
// ============================================================================

impl From<BuildError> for PluginError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Script(inner) => inner.into(),
            BuildError::Wasm(inner) => inner.into(),
            BuildError::UnsupportedRuntime { .. } | BuildError::NotTcpCapable(_) => {
                PluginError::Unsupported(err.to_string())
            }
            other => PluginError::LoadFailed(other.to_string()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
