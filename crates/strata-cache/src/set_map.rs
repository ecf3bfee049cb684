use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::properties::Properties;

/// Properties file mapping a key to a space separated set of values.
///
/// Values are URLs or binary names, neither of which contains a raw space.
#[derive(Debug)]
pub(crate) struct SetMapFile {
    path: PathBuf,
    props: Properties,
    modified: bool,
}

impl SetMapFile {
    pub(crate) fn load(path: PathBuf) -> Result<Self> {
        let props = Properties::load_lenient(&path)?;
        Ok(Self {
            path,
            props,
            modified: false,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn values(&self, key: &str) -> BTreeSet<String> {
        self.props
            .get(key)
            .map(|raw| raw.split(' ').filter(|v| !v.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &str> {
        self.props.iter().map(|(key, _)| key)
    }

    pub(crate) fn insert(&mut self, key: &str, value: &str) {
        let mut values = self.values(key);
        if values.insert(value.to_string()) {
            self.put(key, values);
        }
    }

    pub(crate) fn replace(&mut self, key: &str, values: BTreeSet<String>) -> BTreeSet<String> {
        let previous = self.values(key);
        if previous != values {
            self.put(key, values);
        }
        previous
    }

    pub(crate) fn remove_value(&mut self, key: &str, value: &str) -> bool {
        let mut values = self.values(key);
        if !values.remove(value) {
            return false;
        }
        self.put(key, values);
        true
    }

    pub(crate) fn remove_key(&mut self, key: &str) -> BTreeSet<String> {
        let previous = self.values(key);
        if self.props.remove(key).is_some() {
            self.modified = true;
        }
        previous
    }

    fn put(&mut self, key: &str, values: BTreeSet<String>) {
        if values.is_empty() {
            self.props.remove(key);
        } else {
            let joined = values.into_iter().collect::<Vec<_>>().join(" ");
            self.props.set(key, joined);
        }
        self.modified = true;
    }

    pub(crate) fn store(&mut self) -> Result<()> {
        if !self.modified && self.path.exists() {
            return Ok(());
        }
        self.props.store(&self.path)?;
        self.modified = false;
        Ok(())
    }
}
