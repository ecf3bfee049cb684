use crate::error::CacheError;
use crate::fingerprint::Fingerprint;
use std::path::{Path, PathBuf};

use strata_core::RootUrl;

const ROOTS_DIR: &str = "roots";

/// Configuration for selecting the on-disk cache root.
#[derive(Clone, Debug, Default)]
pub struct CacheConfig {
    /// Override the global cache directory.
    pub cache_root_override: Option<PathBuf>,
}

impl CacheConfig {
    pub fn from_env() -> Self {
        Self {
            cache_root_override: std::env::var_os("STRATA_CACHE_DIR").map(PathBuf::from),
        }
    }
}

/// The global cache directory holding one subdirectory per indexed root.
#[derive(Clone, Debug)]
pub struct CacheDir {
    root: PathBuf,
}

impl CacheDir {
    pub fn new(config: CacheConfig) -> Result<Self, CacheError> {
        let root = match config.cache_root_override {
            Some(root) => root,
            None => default_cache_root()?,
        };
        std::fs::create_dir_all(root.join(ROOTS_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for `root`, without creating it.
    pub fn root_dir(&self, root: &RootUrl) -> RootCacheDir {
        RootCacheDir {
            dir: self
                .root
                .join(ROOTS_DIR)
                .join(Fingerprint::for_root(root).as_str()),
        }
    }

    /// Whether anything was ever persisted for `root`.
    pub fn exists(&self, root: &RootUrl) -> bool {
        self.root_dir(root).dir.is_dir()
    }

    /// Delete every persisted file of `root`.
    pub fn remove_root(&self, root: &RootUrl) -> Result<(), CacheError> {
        let dir = self.root_dir(root).dir;
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// File layout of one root's cache directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootCacheDir {
    dir: PathBuf,
}

impl RootCacheDir {
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn attributes_path(&self) -> PathBuf {
        self.dir.join("attributes.properties")
    }

    pub fn checksums_path(&self) -> PathBuf {
        self.dir.join("checksums.properties")
    }

    pub fn fqn_path(&self) -> PathBuf {
        self.dir.join("fqn2files.properties")
    }

    pub fn generated_sources_path(&self) -> PathBuf {
        self.dir.join("apt-sources.properties")
    }

    pub fn class_index_path(&self) -> PathBuf {
        self.dir.join("class-index.json")
    }

    pub fn classes_dir(&self) -> PathBuf {
        self.dir.join("classes")
    }

    pub fn create(&self) -> Result<(), CacheError> {
        std::fs::create_dir_all(self.classes_dir())?;
        Ok(())
    }
}

pub(crate) fn default_cache_root() -> Result<PathBuf, CacheError> {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .ok_or(CacheError::MissingHomeDir)?;

    Ok(home.join(".strata").join("cache"))
}
