use std::collections::BTreeSet;
use std::path::PathBuf;

use url::Url;

use crate::error::Result;
use crate::set_map::SetMapFile;

/// Source files produced by annotation processors, keyed by the source that triggered
/// them.
#[derive(Debug)]
pub struct GeneratedSources {
    file: SetMapFile,
}

impl GeneratedSources {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            file: SetMapFile::load(path.into())?,
        })
    }

    pub fn generated_by(&self, source: &Url) -> BTreeSet<Url> {
        self.file
            .values(source.as_str())
            .iter()
            .filter_map(|raw| Url::parse(raw).ok())
            .collect()
    }

    /// Replace the generated set of `source`, returning the previous one.
    pub fn set(&mut self, source: &Url, generated: &BTreeSet<Url>) -> BTreeSet<Url> {
        let values = generated.iter().map(|url| url.as_str().to_string()).collect();
        self.file
            .replace(source.as_str(), values)
            .iter()
            .filter_map(|raw| Url::parse(raw).ok())
            .collect()
    }

    pub fn remove(&mut self, source: &Url) -> BTreeSet<Url> {
        self.file
            .remove_key(source.as_str())
            .iter()
            .filter_map(|raw| Url::parse(raw).ok())
            .collect()
    }

    /// Every generated file known for any source.
    pub fn all_generated(&self) -> BTreeSet<Url> {
        self.file
            .keys()
            .flat_map(|key| self.file.values(key))
            .filter_map(|raw| Url::parse(&raw).ok())
            .collect()
    }

    pub fn store(&mut self) -> Result<()> {
        self.file.store()
    }
}
