use super::builder::ScriptRuntime;
use super::convert::dynamic_to_json;
use super::{INIT, PROVIDE, STOP, ScriptError};
use portcullis_kernel::{ConfigMessage, Configuration, PluginError, PluginResult, Pool, Provider};
use rhai::{Dynamic, Engine};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Handle a provider script publishes configuration documents through.
///
/// `send` accepts a JSON string or a map and returns `false` once the
/// provider has been shut down.
#[derive(Debug, Clone)]
pub struct ConfigSender {
    tx: mpsc::UnboundedSender<String>,
}

impl ConfigSender {
    fn send_document(&mut self, document: Dynamic) -> bool {
        let raw = if document.is_string() {
            document.to_string()
        } else {
            dynamic_to_json(&document).to_string()
        };
        self.tx.send(raw).is_ok()
    }
}

pub(crate) fn register_sender(engine: &mut Engine) {
    engine
        .register_type_with_name::<ConfigSender>("ConfigSender")
        .register_fn("send", ConfigSender::send_document);
}

/// Provider backed by a script's `provide` / `stop` entry points.
pub struct ScriptProvider {
    runtime: Arc<ScriptRuntime>,
    state: Dynamic,
    name: String,
}

impl ScriptProvider {
    pub(crate) fn new(runtime: Arc<ScriptRuntime>, state: Dynamic, name: &str) -> Self {
        Self {
            runtime,
            state,
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Provider for ScriptProvider {
    fn init(&self) -> PluginResult<()> {
        if !self.runtime.has_fn(INIT, 1) {
            return Ok(());
        }
        self.runtime
            .call(INIT, (self.state.clone(),))
            .map(|_| ())
            .map_err(|err| PluginError::InitFailed(format!("{}: {err}", self.name)))
    }

    fn provide(&self, tx: mpsc::Sender<ConfigMessage>, pool: &Pool) -> PluginResult<()> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<String>();
        let sender = ConfigSender { tx: raw_tx };

        let outcome = guarded(&self.name, || {
            self.runtime
                .call(PROVIDE, (self.state.clone(), Dynamic::from(sender)))
        });
        match outcome {
            None => return Ok(()),
            Some(Err(err)) => {
                return Err(ScriptError::Runtime {
                    symbol: self.runtime.qualified(PROVIDE),
                    message: format!("error from {}: {err}", self.name),
                }
                .into());
            }
            Some(Ok(_)) => {}
        }

        let runtime = self.runtime.clone();
        let state = self.state.clone();
        let name = self.name.clone();
        pool.go(move |token| async move {
            let drained = tokio::select! {
                _ = token.cancelled() => false,
                _ = forward(&name, &mut raw_rx, &tx) => true,
            };
            if drained {
                token.cancelled().await;
            }
            if let Err(err) = runtime.call(STOP, (state,)) {
                error!(provider = %name, error = %err, "failed to stop the provider");
            }
        });

        info!(provider = %self.name, "provider started");
        Ok(())
    }

    fn stop(&self) -> PluginResult<()> {
        self.runtime
            .call(STOP, (self.state.clone(),))
            .map(|_| ())
            .map_err(|err| PluginError::ExecutionFailed(format!("{}: {err}", self.name)))
    }
}

/// Parses and forwards documents until the provider releases its sender or
/// the configuration channel closes.
async fn forward(
    name: &str,
    raw_rx: &mut mpsc::UnboundedReceiver<String>,
    tx: &mpsc::Sender<ConfigMessage>,
) {
    while let Some(raw) = raw_rx.recv().await {
        let configuration = match serde_json::from_str::<Configuration>(&raw) {
            Ok(configuration) => configuration,
            Err(err) => {
                error!(provider = %name, error = %err, "failed to parse configuration from provider");
                continue;
            }
        };
        let message = ConfigMessage {
            provider_name: name.to_string(),
            configuration,
        };
        if tx.send(message).await.is_err() {
            debug!(provider = %name, "configuration channel closed");
            raw_rx.close();
            return;
        }
    }
    debug!(provider = %name, "provider released its sender");
}

/// Runs `f`, logging and swallowing a panic.
fn guarded<T>(provider: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            error!(provider, panic = %panic_message(panic.as_ref()), "panic inside the plugin");
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
