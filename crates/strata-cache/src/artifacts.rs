use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{CacheError, Result};
use crate::util::{atomic_write, prune_empty_dirs, remove_file_best_effort};

pub const ARTIFACT_EXTENSION: &str = "sig";
pub const MANIFEST_EXTENSION: &str = "rs";

/// Opaque per-root storage of compiled signature artifacts.
///
/// Artifacts are keyed by binary name. Manifests are keyed by the root-relative path of
/// a source file and list the binary names that source declared when it was last built.
pub trait ArtifactStore: Send + Sync {
    fn read_manifest(&self, source_path: &str) -> Result<Option<Vec<String>>>;

    fn write_manifest(&self, source_path: &str, binary_names: &[String]) -> Result<()>;

    fn delete_manifest(&self, source_path: &str) -> Result<()>;

    fn read_artifact(&self, binary_name: &str) -> Result<Option<Vec<u8>>>;

    fn write_artifact(&self, binary_name: &str, bytes: &[u8]) -> Result<()>;

    fn delete_artifact(&self, binary_name: &str) -> Result<()>;

    fn contains(&self, binary_name: &str) -> Result<bool> {
        Ok(self.read_artifact(binary_name)?.is_some())
    }

    /// Binary names of every stored artifact, sorted.
    fn artifacts(&self) -> Result<Vec<String>>;

    /// Binary names stored directly in `package` (`""` for the default package), sorted.
    fn package_artifacts(&self, package: &str) -> Result<Vec<String>>;

    /// `top_level` itself plus its nested types (`p.A`, `p.A$B`, ...).
    fn artifact_family(&self, top_level: &str) -> Result<Vec<String>> {
        let nested = format!("{top_level}$");
        Ok(self
            .package_artifacts(package_of(top_level))?
            .into_iter()
            .filter(|name| name == top_level || name.starts_with(&nested))
            .collect())
    }
}

/// Package part of a binary name, empty for the default package.
pub fn package_of(binary_name: &str) -> &str {
    binary_name
        .rsplit_once('.')
        .map(|(package, _)| package)
        .unwrap_or("")
}

/// Artifacts as `.sig` files mirroring the package structure below one directory.
#[derive(Clone, Debug)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_path(&self, binary_name: &str) -> Result<PathBuf> {
        validate_binary_name(binary_name)?;
        let relative = binary_name.replace('.', "/");
        Ok(self.dir.join(format!("{relative}.{ARTIFACT_EXTENSION}")))
    }

    pub fn manifest_path(&self, source_path: &str) -> Result<PathBuf> {
        let stem = strip_extension(source_path.trim_start_matches('/'));
        if stem.is_empty() || stem.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(CacheError::InvalidBinaryName {
                name: source_path.to_string(),
            });
        }
        Ok(self.dir.join(format!("{stem}.{MANIFEST_EXTENSION}")))
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        if let Some(parent) = path.parent() {
            prune_empty_dirs(parent, &self.dir);
        }
        Ok(())
    }

    /// Remove every artifact and manifest.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn read_manifest(&self, source_path: &str) -> Result<Option<Vec<String>>> {
        let path = self.manifest_path(source_path)?;
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(
                    target = "strata.cache",
                    path = %path.display(),
                    "discarding unreadable manifest"
                );
                remove_file_best_effort(&path, "read_manifest.invalid_utf8");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Some(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    fn write_manifest(&self, source_path: &str, binary_names: &[String]) -> Result<()> {
        let path = self.manifest_path(source_path)?;
        let mut text = String::new();
        for name in binary_names {
            text.push_str(name);
            text.push('\n');
        }
        atomic_write(&path, text.as_bytes())
    }

    fn delete_manifest(&self, source_path: &str) -> Result<()> {
        let path = self.manifest_path(source_path)?;
        self.delete_file(&path)
    }

    fn read_artifact(&self, binary_name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.artifact_path(binary_name)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write_artifact(&self, binary_name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.artifact_path(binary_name)?;
        atomic_write(&path, bytes)
    }

    fn delete_artifact(&self, binary_name: &str) -> Result<()> {
        let path = self.artifact_path(binary_name)?;
        self.delete_file(&path)
    }

    fn contains(&self, binary_name: &str) -> Result<bool> {
        Ok(self.artifact_path(binary_name)?.is_file())
    }

    fn artifacts(&self) -> Result<Vec<String>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.dir).follow_links(false) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.dir) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            names.push(strip_extension(&relative).replace('/', "."));
        }
        names.sort();
        Ok(names)
    }

    fn package_artifacts(&self, package: &str) -> Result<Vec<String>> {
        let dir = if package.is_empty() {
            self.dir.clone()
        } else {
            validate_binary_name(package)?;
            self.dir.join(package.replace('.', "/"))
        };
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            names.push(if package.is_empty() {
                stem.to_string()
            } else {
                format!("{package}.{stem}")
            });
        }
        names.sort();
        Ok(names)
    }
}

fn strip_extension(path: &str) -> &str {
    let file_start = path.rfind('/').map(|idx| idx + 1).unwrap_or(0);
    match path[file_start..].rfind('.') {
        Some(dot) => &path[..file_start + dot],
        None => path,
    }
}

fn validate_binary_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.contains(['/', '\\'])
        && name
            .split('.')
            .all(|segment| !segment.is_empty() && segment != "..");
    // `module-info` is the only binary name with a dash.
    let valid = valid && (!name.contains('-') || name == "module-info");
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidBinaryName {
            name: name.to_string(),
        })
    }
}
