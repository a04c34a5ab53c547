use super::{WasmError, WasmResult};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

/// A host directory exposed to the guest.
///
/// Written `host` (visible at the same path) or `host:guest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub guest: String,
}

impl FromStr for Mount {
    type Err = WasmError;

    fn from_str(spec: &str) -> WasmResult<Self> {
        let invalid = |reason: &str| WasmError::InvalidMount {
            mount: spec.to_string(),
            reason: reason.to_string(),
        };

        let (host, guest) = match spec.split_once(':') {
            Some((host, guest)) => (host, guest),
            None => (spec, spec),
        };
        if host.is_empty() {
            return Err(invalid("empty host directory"));
        }
        if guest.is_empty() {
            return Err(invalid("empty guest directory"));
        }
        if !Path::new(host).is_dir() {
            return Err(invalid("host directory does not exist"));
        }

        Ok(Self {
            host: PathBuf::from(host),
            guest: guest.to_string(),
        })
    }
}

impl fmt::Display for Mount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host.display(), self.guest)
    }
}

/// Everything a guest instance may see of the host.
#[derive(Debug, Clone, Default)]
pub(crate) struct Sandbox {
    pub(crate) envs: Vec<String>,
    pub(crate) mounts: Vec<Mount>,
    pub(crate) root_fs: Option<PathBuf>,
    pub(crate) network: bool,
}

impl Sandbox {
    /// Allow-listed variables present in the host environment right now.
    pub(crate) fn forwarded_envs(&self) -> Vec<(String, String)> {
        self.envs
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect()
    }

    pub(crate) fn wasi_ctx(&self) -> WasmResult<WasiP1Ctx> {
        let mut builder = WasiCtxBuilder::new();
        builder.inherit_stdout().inherit_stderr();

        for (name, value) in self.forwarded_envs() {
            builder.env(&name, &value);
        }

        for mount in &self.mounts {
            builder
                .preopened_dir(&mount.host, &mount.guest, DirPerms::all(), FilePerms::all())
                .map_err(|e| WasmError::InvalidMount {
                    mount: mount.to_string(),
                    reason: e.to_string(),
                })?;
        }

        if let Some(root) = &self.root_fs {
            builder
                .preopened_dir(root, "/", DirPerms::all(), FilePerms::all())
                .map_err(|e| WasmError::InvalidMount {
                    mount: format!("{}:/", root.display()),
                    reason: e.to_string(),
                })?;
        }

        if self.network {
            builder.inherit_network().allow_ip_name_lookup(true);
        }

        Ok(builder.build_p1())
    }
}

/// Resolves the guest's requested root filesystem against the mount
/// allow-list.
pub(crate) fn allowed_root(root_fs: &str, mounts: &[Mount]) -> WasmResult<PathBuf> {
    let requested = Path::new(root_fs);
    let canonical = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    let wanted = canonical(requested);

    mounts
        .iter()
        .find(|m| canonical(&m.host) == wanted)
        .map(|m| m.host.clone())
        .ok_or_else(|| {
            WasmError::GuestConfig(format!("rootFS {root_fs:?} is not an allowed mount"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_forms() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().to_str().unwrap();

        let same: Mount = host.parse().unwrap();
        assert_eq!(same.host, dir.path());
        assert_eq!(same.guest, host);

        let remapped: Mount = format!("{host}:/data").parse().unwrap();
        assert_eq!(remapped.host, dir.path());
        assert_eq!(remapped.guest, "/data");
    }

    #[test]
    fn invalid_mounts_are_rejected() {
        assert!("".parse::<Mount>().is_err());
        assert!(":/data".parse::<Mount>().is_err());
        assert!("/definitely/not/here:/data".parse::<Mount>().is_err());
    }

    #[test]
    fn only_present_envs_are_forwarded() {
        let sandbox = Sandbox {
            envs: vec!["PATH".to_string(), "PORTCULLIS_TEST_SURELY_UNSET".to_string()],
            ..Sandbox::default()
        };
        let envs = sandbox.forwarded_envs();
        assert_eq!(envs.len(), 1);
        assert_eq!(envs[0].0, "PATH");
    }

    #[test]
    fn root_fs_must_be_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let mounts = vec![Mount {
            host: dir.path().to_path_buf(),
            guest: "/data".to_string(),
        }];

        assert_eq!(
            allowed_root(dir.path().to_str().unwrap(), &mounts).unwrap(),
            dir.path()
        );
        assert!(allowed_root("/etc", &mounts).is_err());
    }

    #[test]
    fn wasi_context_builds_with_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox {
            mounts: vec![Mount {
                host: dir.path().to_path_buf(),
                guest: "/data".to_string(),
            }],
            root_fs: Some(dir.path().to_path_buf()),
            ..Sandbox::default()
        };
        assert!(sandbox.wasi_ctx().is_ok());
    }
}
