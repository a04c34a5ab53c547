//! Startup orchestration: validate declarations, install remote plugins and
//! check developer plugins before the builder loads them.

use crate::archive::module_dir;
use crate::manager::Manager;
use crate::manifest::{Manifest, Runtime};
use crate::types::{Descriptor, LocalDescriptor};
use error_stack::Report;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};

/// Error-stack–backed result alias for plugin setup.
pub type SetupResult<T> = ::std::result::Result<T, Report<SetupError>>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SetupError {
    #[error("invalid plugin declaration")]
    InvalidDeclaration,

    #[error("failed to clean plugin archives")]
    CleanArchives,

    #[error("failed to install plugin")]
    Install,

    #[error("failed to write plugin state")]
    WriteState,

    #[error("invalid local plugin")]
    LocalPlugin,
}

fn sorted<V>(map: &HashMap<String, V>) -> BTreeMap<&str, &V> {
    map.iter().map(|(k, v)| (k.as_str(), v)).collect()
}

fn report(context: SetupError, problems: Vec<String>) -> SetupResult<()> {
    if problems.is_empty() {
        return Ok(());
    }
    Err(problems
        .into_iter()
        .fold(Report::new(context), |report, problem| report.attach(problem)))
}

/// Every declaration needs a module name and a version, and a module may
/// only be declared once.
pub fn check_remote_plugins_configuration(plugins: &HashMap<String, Descriptor>) -> SetupResult<()> {
    let mut problems = Vec::new();
    let mut seen: HashMap<&str, &str> = HashMap::new();

    for (alias, desc) in sorted(plugins) {
        if desc.module_name.is_empty() {
            problems.push(format!("{alias}: plugin name is missing"));
        }
        if desc.version.is_empty() {
            problems.push(format!("{alias}: plugin version is missing"));
        }
        if desc.module_name.is_empty() {
            continue;
        }
        if seen.insert(&desc.module_name, alias).is_some() {
            problems.push(format!(
                "only one version of a plugin is allowed, duplicate of {}",
                desc.module_name
            ));
        }
    }

    report(SetupError::InvalidDeclaration, problems)
}

/// Validates, cleans stale archives, installs every declared plugin and
/// records the installed set. A failed install wipes the plugin storage.
pub async fn setup_remote_plugins(manager: &Manager, plugins: &HashMap<String, Descriptor>) -> SetupResult<()> {
    check_remote_plugins_configuration(plugins)?;

    manager
        .clean_archives(plugins)
        .map_err(|e| Report::new(e).change_context(SetupError::CleanArchives))?;

    for (alias, desc) in sorted(plugins) {
        info!(plugin = %alias, module = %desc.module_name, version = %desc.version, "installing plugin");

        if let Err(err) = manager.install_plugin(desc).await {
            let mut report = Report::new(err)
                .change_context(SetupError::Install)
                .attach(format!("unable to set up plugin {alias}"))
                .attach(format!("module {}@{}", desc.module_name, desc.version));

            if let Err(reset) = manager.reset_all() {
                error!(error = %reset, "failed to reset plugin storage");
                report = report.attach(format!("storage reset failed: {reset}"));
            }
            return Err(report);
        }
    }

    manager
        .write_state(plugins)
        .map_err(|e| Report::new(e).change_context(SetupError::WriteState))?;

    info!(count = plugins.len(), "remote plugins ready");
    Ok(())
}

/// Checks what the builder needs from a developer plugin's manifest.
pub fn check_local_plugin_manifest(manifest: &Manifest, module: &str, plugin_dir: &Path) -> SetupResult<()> {
    let mut problems = Vec::new();

    if manifest.display_name.is_empty() {
        problems.push(format!("{module}: missing displayName"));
    }

    match manifest.runtime {
        Runtime::Script => {
            if manifest.import.is_empty() {
                problems.push(format!("{module}: missing import"));
            } else if !manifest.import.starts_with(module) {
                problems.push(format!(
                    "{module}: the import {:?} must be related to the module name",
                    manifest.import
                ));
            }
        }
        Runtime::Wasm => {
            if manifest.wasm_path.is_empty() {
                problems.push(format!("{module}: missing wasmPath"));
            } else if !plugin_dir.join(&manifest.wasm_path).is_file() {
                problems.push(format!("{module}: wasm file {:?} not found", manifest.wasm_path));
            }
        }
    }

    if manifest.test_data.is_null() {
        problems.push(format!("{module}: missing testData"));
    }

    report(SetupError::LocalPlugin, problems)
}

/// Reads and checks the manifest of every developer plugin under
/// `{local_root}/src`.
pub fn setup_local_plugins(local_root: &Path, plugins: &HashMap<String, LocalDescriptor>) -> SetupResult<()> {
    for (alias, desc) in sorted(plugins) {
        let plugin_dir = module_dir(&local_root.join("src"), &desc.module_name);

        let manifest = Manifest::read_from(&plugin_dir).map_err(|e| {
            Report::new(e)
                .change_context(SetupError::LocalPlugin)
                .attach(format!("local plugin {alias}"))
        })?;

        check_local_plugin_manifest(&manifest, &desc.module_name, &plugin_dir)
            .map_err(|report| report.attach(format!("local plugin {alias}")))?;

        info!(plugin = %alias, module = %desc.module_name, "local plugin ready");
    }
    Ok(())
}
