use std::collections::HashMap;
use std::path::{Path, PathBuf};

use url::Url;

use strata_core::{DeclaredElement, Modifier};

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::properties::Properties;

/// Structural digests of source files, keyed by file URL.
///
/// A digest covers the externally visible shape of a file's declarations only, so edits
/// to private members, method bodies, comments or formatting leave it unchanged.
///
/// Changes are reported relative to the last [`CheckSums::checkpoint`], so a file
/// analysed twice between checkpoints keeps reporting the change it first saw.
#[derive(Debug)]
pub struct CheckSums {
    path: PathBuf,
    props: Properties,
    /// Digest each file had at the last checkpoint, recorded on first touch.
    baseline: HashMap<String, Option<String>>,
    modified: bool,
}

impl CheckSums {
    /// Load the digests stored at `path`. A corrupt file is logged and read as empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let props = Properties::load_lenient(&path)?;
        Ok(Self {
            path,
            props,
            baseline: HashMap::new(),
            modified: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start a new comparison window: later checks compare against the current digests.
    pub fn checkpoint(&mut self) {
        self.baseline.clear();
    }

    /// Record the digest of `declared` for `file` and report whether it is unchanged
    /// since the last checkpoint.
    ///
    /// A file without a digest at the checkpoint counts as unchanged: its types reach
    /// dependents through the added-types set instead.
    pub fn check_and_set(&mut self, file: &Url, declared: &[DeclaredElement]) -> bool {
        let digest = structural_digest(declared);
        let previous = self.props.set(file.as_str(), digest.as_str());
        if previous.as_deref() != Some(digest.as_str()) {
            self.modified = true;
        }
        match self.baseline.entry(file.as_str().to_owned()).or_insert(previous) {
            Some(baseline) => baseline.as_str() == digest.as_str(),
            None => true,
        }
    }

    pub fn get(&self, file: &Url) -> Option<&str> {
        self.props.get(file.as_str())
    }

    pub fn remove(&mut self, file: &Url) {
        let previous = self.props.remove(file.as_str());
        if previous.is_some() {
            self.modified = true;
        }
        self.baseline.entry(file.as_str().to_owned()).or_insert(previous);
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn store(&mut self) -> Result<()> {
        if !self.modified && self.path.exists() {
            return Ok(());
        }
        self.props.store(&self.path)?;
        self.modified = false;
        Ok(())
    }
}

/// Order-independent digest over the non-private shape of `declared`.
pub fn structural_digest(declared: &[DeclaredElement]) -> Fingerprint {
    let mut tuples = Vec::new();
    for element in declared {
        collect_tuples(element, "", &mut tuples);
    }
    tuples.sort_unstable();
    Fingerprint::from_parts(tuples)
}

fn collect_tuples(element: &DeclaredElement, owner: &str, out: &mut Vec<String>) {
    let modifiers: Vec<&str> = element.modifiers.iter().map(|m| m.as_str()).collect();
    let path = if owner.is_empty() {
        element.name.clone()
    } else {
        format!("{owner}#{}", element.name)
    };
    out.push(format!(
        "{}|{}|{}|{}|{}|{}",
        element.kind,
        path,
        element.signature,
        modifiers.join(" "),
        element.deprecated,
        element.constant_value.as_deref().unwrap_or(""),
    ));

    for member in &element.members {
        if member.modifiers.contains(&Modifier::Private) {
            continue;
        }
        collect_tuples(member, &path, out);
    }
}
