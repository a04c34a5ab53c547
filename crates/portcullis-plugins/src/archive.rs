//! Plugin archive layout and extraction strategies.
//!
//! Archives are zip files. Two strategies exist and the manager tries them in
//! order: [`ModuleZipExtractor`] accepts only well-formed module archives
//! (every file under `{module}@{version}/`), [`GenericZipExtractor`] accepts
//! any archive with a single synthetic top-level directory.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;

/// Upper bound on the uncompressed size of a module archive.
pub const MAX_MODULE_ZIP_SIZE: u64 = 500 << 20;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ArchiveError {
    #[error("failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt archive {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("invalid module archive {path}: {reason}")]
    Layout { path: PathBuf, reason: String },

    #[error("archive entry {entry:?} escapes the destination directory")]
    PathEscape { entry: String },

    #[error("failed to extract to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Location of the archive of `module@version` under `archives`.
///
/// Empty, `.` and `..` module segments are dropped and separators in the
/// version are neutralised, so the result never leaves `archives`.
pub fn archive_path(archives: &Path, module: &str, version: &str) -> PathBuf {
    let mut path = module_dir(archives, module);
    let version = version.replace(['/', '\\'], "_");
    let version = match version.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => version,
    };
    path.push(format!("{version}.zip"));
    path
}

/// Directory of `module` under a sources root, with the same segment rules
/// as [`archive_path`].
pub fn module_dir(root: &Path, module: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for segment in module.split(['/', '\\']) {
        if matches!(segment, "" | "." | "..") {
            continue;
        }
        path.push(segment);
    }
    path
}

/// One way of unpacking a plugin archive into `dest`.
pub trait Extractor: Send + Sync {
    fn name(&self) -> &'static str;

    fn extract(&self, archive: &Path, module: &str, version: &str, dest: &Path)
    -> ArchiveResult<()>;
}

/// Strategies in the order the manager tries them.
pub fn default_extractors() -> Vec<Box<dyn Extractor>> {
    vec![Box::new(ModuleZipExtractor), Box::new(GenericZipExtractor)]
}

/// Strict module archive extraction.
///
/// The whole archive is validated before anything is written: every entry
/// under `{module}@{version}/`, clean relative paths, no vendored trees, no
/// case-insensitive duplicates, bounded total size, empty destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleZipExtractor;

impl Extractor for ModuleZipExtractor {
    fn name(&self) -> &'static str {
        "module"
    }

    fn extract(
        &self,
        archive: &Path,
        module: &str,
        version: &str,
        dest: &Path,
    ) -> ArchiveResult<()> {
        let mut zip = open_zip(archive)?;
        let prefix = format!("{module}@{version}/");
        let layout = |reason: String| ArchiveError::Layout {
            path: archive.to_path_buf(),
            reason,
        };

        let mut planned = Vec::new();
        let mut seen = HashSet::new();
        let mut total: u64 = 0;

        for index in 0..zip.len() {
            let entry = zip.by_index(index).map_err(|e| corrupt(archive, e))?;
            let name = entry.name().to_string();

            let rel = name
                .strip_prefix(&prefix)
                .ok_or_else(|| layout(format!("{name:?} is not in {prefix:?}")))?;
            if entry.is_dir() {
                continue;
            }

            check_module_file_path(rel).map_err(|reason| layout(format!("{name:?}: {reason}")))?;
            if !seen.insert(rel.to_lowercase()) {
                return Err(layout(format!("case-insensitive duplicate {rel:?}")));
            }

            total = total.saturating_add(entry.size());
            if total > MAX_MODULE_ZIP_SIZE {
                return Err(layout(format!(
                    "total uncompressed size exceeds {MAX_MODULE_ZIP_SIZE} bytes"
                )));
            }

            planned.push((index, rel.to_string()));
        }

        if dir_has_entries(dest) {
            return Err(layout(format!("destination {} is not empty", dest.display())));
        }

        for (index, rel) in planned {
            let mut entry = zip.by_index(index).map_err(|e| corrupt(archive, e))?;
            write_entry(&mut entry, &dest.join(rel))?;
        }

        debug!(module, version, dest = %dest.display(), "extracted module archive");
        Ok(())
    }
}

/// Lenient extraction for vendored trees, WASM binaries and archives that
/// are not module shaped.
///
/// The first path segment of every entry is dropped; the remainder is
/// cleaned and must stay inside `dest`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericZipExtractor;

impl Extractor for GenericZipExtractor {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn extract(
        &self,
        archive: &Path,
        module: &str,
        version: &str,
        dest: &Path,
    ) -> ArchiveResult<()> {
        let mut zip = open_zip(archive)?;
        let dest_abs = std::path::absolute(dest).map_err(|source| ArchiveError::Io {
            path: dest.to_path_buf(),
            source,
        })?;

        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(|e| corrupt(archive, e))?;
            let name = entry.name().to_string();

            let normalized = name.replace('\\', "/");
            let Some((_, rest)) = normalized.split_once('/') else {
                continue;
            };

            let cleaned = clean_path(rest);
            if cleaned == "." {
                continue;
            }
            if cleaned.contains("..") {
                return Err(ArchiveError::PathEscape { entry: name });
            }

            let target = dest_abs.join(&cleaned);
            if !target.starts_with(&dest_abs) {
                return Err(ArchiveError::PathEscape { entry: name });
            }

            if entry.is_dir() {
                std::fs::create_dir_all(&target).map_err(|source| ArchiveError::Io {
                    path: target.clone(),
                    source,
                })?;
            } else {
                write_entry(&mut entry, &target)?;
            }
        }

        debug!(module, version, dest = %dest.display(), "extracted generic archive");
        Ok(())
    }
}

/// Lexical cleaning of a `/`-separated path: drops empty and `.` elements and
/// folds `..` into the preceding element where one exists.
pub fn clean_path(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(last) if *last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

fn check_module_file_path(rel: &str) -> Result<(), String> {
    if rel.is_empty() {
        return Err("empty file path".into());
    }
    if rel.starts_with('/') || rel.contains('\\') {
        return Err("path must be relative and use forward slashes".into());
    }
    if rel.chars().any(|c| c.is_control()) {
        return Err("path contains control characters".into());
    }
    for element in rel.split('/') {
        if matches!(element, "" | "." | "..") {
            return Err(format!("invalid path element {element:?}"));
        }
    }
    if rel.starts_with("vendor/") || rel.contains("/vendor/") {
        return Err("file is in a vendor directory".into());
    }
    Ok(())
}

fn open_zip(archive: &Path) -> ArchiveResult<ZipArchive<File>> {
    let file = File::open(archive).map_err(|source| ArchiveError::Open {
        path: archive.to_path_buf(),
        source,
    })?;
    ZipArchive::new(file).map_err(|e| corrupt(archive, e))
}

fn corrupt(archive: &Path, source: zip::result::ZipError) -> ArchiveError {
    ArchiveError::Corrupt {
        path: archive.to_path_buf(),
        source,
    }
}

fn dir_has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn write_entry(reader: &mut impl io::Read, target: &Path) -> ArchiveResult<()> {
    let io_err = |source| ArchiveError::Io {
        path: target.to_path_buf(),
        source,
    };
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut out = File::create(target).map_err(io_err)?;
    io::copy(reader, &mut out).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Component;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn archive_path_stays_under_archives() {
        let root = Path::new("/var/lib/portcullis/archives");

        assert_eq!(
            archive_path(root, "github.com/acme/demo", "v1.2.0"),
            root.join("github.com/acme/demo/v1.2.0.zip")
        );

        for (module, version) in [
            ("../../etc", "passwd"),
            ("/abs/module", "../../v1"),
            ("a/./b/../c", ".."),
            ("..\\..\\win", "v1\\..\\x"),
            ("", ""),
        ] {
            let path = archive_path(root, module, version);
            assert!(path.starts_with(root), "{module} {version} -> {path:?}");
            assert!(
                !path.components().any(|c| c == Component::ParentDir),
                "{module} {version} -> {path:?}"
            );
        }
    }

    #[test]
    fn clean_path_matches_lexical_rules() {
        assert_eq!(clean_path("a/b/../c"), "a/c");
        assert_eq!(clean_path("./a//b/"), "a/b");
        assert_eq!(clean_path("../../etc/passwd"), "../../etc/passwd");
        assert_eq!(clean_path("a/../../"), "..");
        assert_eq!(clean_path("/../etc"), "/etc");
        assert_eq!(clean_path(""), ".");
    }

    #[test]
    fn module_zip_extracts_well_formed_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("v1.0.0.zip");
        write_zip(
            &archive,
            &[
                ("github.com/acme/demo@v1.0.0/.portcullis.yml", "type: middleware\n"),
                ("github.com/acme/demo@v1.0.0/lib/demo.rhai", "fn x() { 1 }"),
            ],
        );

        let dest = dir.path().join("out");
        ModuleZipExtractor
            .extract(&archive, "github.com/acme/demo", "v1.0.0", &dest)
            .unwrap();

        assert!(dest.join(".portcullis.yml").is_file());
        assert_eq!(
            std::fs::read_to_string(dest.join("lib/demo.rhai")).unwrap(),
            "fn x() { 1 }"
        );
    }

    #[test]
    fn module_zip_rejects_foreign_layouts_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");

        let cases: [(&str, &[(&str, &str)]); 3] = [
            ("prefix", &[("demo-1.0.0/demo.rhai", "")]),
            (
                "vendor",
                &[
                    ("m@v1/a.rhai", ""),
                    ("m@v1/vendor/dep/b.rhai", ""),
                ],
            ),
            ("duplicate", &[("m@v1/A.rhai", ""), ("m@v1/a.rhai", "")]),
        ];

        for (label, entries) in cases {
            let archive = dir.path().join(format!("{label}.zip"));
            write_zip(&archive, entries);

            let err = ModuleZipExtractor
                .extract(&archive, "m", "v1", &dest)
                .unwrap_err();
            assert!(matches!(err, ArchiveError::Layout { .. }), "{label}: {err}");
            assert!(!dest.exists(), "{label}: wrote before validating");
        }
    }

    #[test]
    fn generic_zip_strips_top_level_directory() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("plain.zip");
        write_zip(
            &archive,
            &[
                ("demo-main/.portcullis.yml", "type: middleware\nruntime: wasm\n"),
                ("demo-main/plugin.wasm", "\0asm"),
                ("demo-main/vendor/dep/x.txt", "x"),
                ("stray-root-file", "ignored"),
            ],
        );

        let dest = dir.path().join("out");
        GenericZipExtractor
            .extract(&archive, "demo", "v1", &dest)
            .unwrap();

        assert!(dest.join(".portcullis.yml").is_file());
        assert!(dest.join("plugin.wasm").is_file());
        assert!(dest.join("vendor/dep/x.txt").is_file());
        assert!(!dest.join("stray-root-file").exists());
    }

    #[test]
    fn generic_zip_refuses_zip_slip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("plugin/../../etc/passwd", "root::0:0")]);

        let dest = dir.path().join("sandbox").join("out");
        let err = GenericZipExtractor
            .extract(&archive, "evil", "v1", &dest)
            .unwrap_err();

        assert!(matches!(err, ArchiveError::PathEscape { .. }), "{err}");
        assert!(!dir.path().join("etc/passwd").exists());
        assert!(!dir.path().join("sandbox/etc/passwd").exists());
    }

    #[test]
    fn generic_zip_refuses_rooted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("rooted.zip");
        write_zip(&archive, &[("plugin//tmp/owned", "x")]);

        let dest = dir.path().join("out");
        let err = GenericZipExtractor
            .extract(&archive, "rooted", "v1", &dest)
            .unwrap_err();

        assert!(matches!(err, ArchiveError::PathEscape { .. }), "{err}");
    }
}
