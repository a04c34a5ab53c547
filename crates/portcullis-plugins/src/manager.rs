//! Plugin storage manager.
//!
//! Owns the on-disk layout under an output directory:
//!
//! ```text
//! {output}/sources/run-XXXX/src/{module}/...   extracted plugin trees (one dir per run)
//! {output}/archives/{module}/{version}.zip     downloaded archives
//! {output}/archives/state.json                 {module: version} of the last run
//! ```
//!
//! Installing walks `download -> verify -> extract`; any failing step aborts
//! that plugin with an error naming it. Nothing is rolled back here, the
//! caller decides whether to [`Manager::reset_all`].

use crate::archive::{self, ArchiveError, Extractor, archive_path, module_dir};
use crate::client::{PluginDownloader, RegistryError};
use crate::manifest::{Manifest, ManifestError};
use crate::types::Descriptor;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const STATE_FILE: &str = "state.json";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    #[error("unable to download plugin {module}@{version}: {source}")]
    Download {
        module: String,
        version: String,
        #[source]
        source: RegistryError,
    },

    #[error("invalid hash for plugin {module}@{version}: {source}")]
    Integrity {
        module: String,
        version: String,
        #[source]
        source: RegistryError,
    },

    #[error("unable to extract plugin {module}@{version}: {source}")]
    Extract {
        module: String,
        version: String,
        #[source]
        source: ArchiveError,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("invalid state file {path}: {source}")]
    StateFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to remove archive {path}: {source}")]
    RemoveArchive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot delete {path}: it contains the current working directory {cwd}")]
    ResetRefused { path: PathBuf, cwd: PathBuf },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type ManagerResult<T> = Result<T, ManagerError>;

fn io_error(path: &Path) -> impl Fn(io::Error) -> ManagerError + '_ {
    move |source| ManagerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub struct Manager {
    downloader: Arc<dyn PluginDownloader>,
    extractors: Vec<Box<dyn Extractor>>,
    sources: PathBuf,
    work_dir: PathBuf,
    archives: PathBuf,
    state_file: PathBuf,
}

impl Manager {
    /// Prepares the storage layout under `output` and a fresh sources
    /// directory for this run.
    pub fn new(downloader: Arc<dyn PluginDownloader>, output: &Path) -> ManagerResult<Self> {
        let sources = output.join("sources");
        let archives = output.join("archives");

        std::fs::create_dir_all(&sources).map_err(io_error(&sources))?;
        std::fs::create_dir_all(&archives).map_err(io_error(&archives))?;

        let work_dir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&sources)
            .map_err(io_error(&sources))?
            .keep();

        debug!(work_dir = %work_dir.display(), "prepared plugin sources directory");

        Ok(Self {
            downloader,
            extractors: archive::default_extractors(),
            state_file: archives.join(STATE_FILE),
            sources,
            work_dir,
            archives,
        })
    }

    /// Root under which plugin trees live as `src/{module}`.
    pub fn sources_root(&self) -> &Path {
        &self.work_dir
    }

    pub fn archives_dir(&self) -> &Path {
        &self.archives
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Directory the tree of `module` is extracted into.
    pub fn source_dir(&self, module: &str) -> PathBuf {
        module_dir(&self.work_dir.join("src"), module)
    }

    pub fn archive_path(&self, module: &str, version: &str) -> PathBuf {
        archive_path(&self.archives, module, version)
    }

    /// Downloads, verifies and extracts one plugin.
    pub async fn install_plugin(&self, desc: &Descriptor) -> ManagerResult<()> {
        let module = desc.module_name.as_str();
        let version = desc.version.as_str();

        let hash = self
            .downloader
            .download(module, version)
            .await
            .map_err(|source| ManagerError::Download {
                module: module.to_string(),
                version: version.to_string(),
                source,
            })?;

        self.downloader
            .check(module, version, &desc.hash, &hash)
            .await
            .map_err(|source| ManagerError::Integrity {
                module: module.to_string(),
                version: version.to_string(),
                source,
            })?;

        self.unzip(module, version)?;
        info!(module, version, "plugin installed");
        Ok(())
    }

    fn unzip(&self, module: &str, version: &str) -> ManagerResult<()> {
        let archive = self.archive_path(module, version);
        let dest = self.source_dir(module);

        let mut last_error = None;
        for extractor in &self.extractors {
            match extractor.extract(&archive, module, version, &dest) {
                Ok(()) => {
                    debug!(module, version, strategy = extractor.name(), "archive extracted");
                    return Ok(());
                }
                Err(err) => {
                    debug!(module, version, strategy = extractor.name(), error = %err, "extraction strategy failed");
                    last_error = Some(err);
                }
            }
        }

        let source = last_error.unwrap_or_else(|| ArchiveError::Layout {
            path: archive.clone(),
            reason: "no extraction strategy configured".into(),
        });
        Err(ManagerError::Extract {
            module: module.to_string(),
            version: version.to_string(),
            source,
        })
    }

    /// Reads the manifest of an installed plugin.
    pub fn read_manifest(&self, module: &str) -> ManagerResult<Manifest> {
        Ok(Manifest::read_from(&self.source_dir(module))?)
    }

    /// Deletes the archive of every module whose requested version differs
    /// from the one recorded by the previous run.
    pub fn clean_archives(&self, plugins: &HashMap<String, Descriptor>) -> ManagerResult<()> {
        let Some(state) = self.read_state()? else {
            return Ok(());
        };

        for (module, version) in &state {
            let stale = plugins
                .values()
                .any(|desc| &desc.module_name == module && &desc.version != version);
            if !stale {
                continue;
            }

            let path = self.archive_path(module, version);
            match std::fs::remove_file(&path) {
                Ok(()) => info!(module = %module, version = %version, "removed stale plugin archive"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(ManagerError::RemoveArchive { path, source }),
            }
        }

        Ok(())
    }

    /// Records `{module: version}` for every declared plugin.
    pub fn write_state(&self, plugins: &HashMap<String, Descriptor>) -> ManagerResult<()> {
        let state: BTreeMap<&str, &str> = plugins
            .values()
            .map(|desc| (desc.module_name.as_str(), desc.version.as_str()))
            .collect();

        let data = serde_json::to_vec_pretty(&state).map_err(|source| ManagerError::StateFormat {
            path: self.state_file.clone(),
            source,
        })?;

        std::fs::create_dir_all(&self.archives).map_err(io_error(&self.archives))?;
        std::fs::write(&self.state_file, data).map_err(io_error(&self.state_file))
    }

    /// State recorded by [`Manager::write_state`], if any.
    pub fn read_state(&self) -> ManagerResult<Option<BTreeMap<String, String>>> {
        let data = match std::fs::read(&self.state_file) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ManagerError::Io {
                    path: self.state_file.clone(),
                    source,
                });
            }
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| ManagerError::StateFormat {
                path: self.state_file.clone(),
                source,
            })
    }

    /// Wipes the sources and archives trees.
    pub fn reset_all(&self) -> ManagerResult<()> {
        let cwd = std::env::current_dir().map_err(io_error(Path::new(".")))?;
        self.reset_all_from(&cwd)
    }

    /// [`Manager::reset_all`] as seen from working directory `cwd`.
    ///
    /// Both trees are checked before either is removed.
    pub fn reset_all_from(&self, cwd: &Path) -> ManagerResult<()> {
        let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
        let sources = reset_target(&self.sources, &cwd)?;
        let archives = reset_target(&self.archives, &cwd)?;

        for target in sources.into_iter().chain(archives) {
            std::fs::remove_dir_all(&target).map_err(io_error(&target))?;
        }
        warn!(sources = %self.sources.display(), archives = %self.archives.display(), "plugin storage reset");
        Ok(())
    }
}

/// Canonical path of `dir` when it exists and does not contain `cwd`.
fn reset_target(dir: &Path, cwd: &Path) -> ManagerResult<Option<PathBuf>> {
    let target = match dir.canonicalize() {
        Ok(path) => path,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ManagerError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    if cwd.starts_with(&target) {
        return Err(ManagerError::ResetRefused {
            path: target,
            cwd: cwd.to_path_buf(),
        });
    }
    Ok(Some(target))
}
