use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use url::Url;

use crate::error::Result;
use crate::set_map::SetMapFile;

/// Which source files declared each binary name.
///
/// Used when clearing stale artifacts: an artifact is only deleted together with its
/// source when no other source still declares the same binary name.
#[derive(Debug)]
pub struct FqnStore {
    file: SetMapFile,
}

impl FqnStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            file: SetMapFile::load(path.into())?,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Record that `source` declares every name in `binary_names`.
    pub fn set<'a>(&mut self, binary_names: impl IntoIterator<Item = &'a str>, source: &Url) {
        for name in binary_names {
            self.file.insert(name, source.as_str());
        }
    }

    /// Forget that `source` declares `binary_name`. Returns `false` if it never did.
    pub fn remove(&mut self, binary_name: &str, source: &Url) -> bool {
        self.file.remove_value(binary_name, source.as_str())
    }

    /// Whether a source other than `source` declares `binary_name`.
    pub fn check(&self, binary_name: &str, source: &Url) -> bool {
        self.file
            .values(binary_name)
            .iter()
            .any(|declaring| declaring != source.as_str())
    }

    pub fn sources(&self, binary_name: &str) -> BTreeSet<String> {
        self.file.values(binary_name)
    }

    pub fn store(&mut self) -> Result<()> {
        self.file.store()
    }
}
