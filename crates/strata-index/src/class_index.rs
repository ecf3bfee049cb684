use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use strata_cache::{atomic_write, CacheDir, CacheError};
use strata_core::{RootUrl, TypeHandle};

/// Bump whenever the persisted layout changes; older files are discarded on load.
pub const CLASS_INDEX_SCHEMA_VERSION: u32 = 1;

/// What one source file contributed to its root's class index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFacts {
    /// Binary names of the types the file declares.
    pub declared: Vec<String>,
    /// `(subtype, supertype)` pairs declared by the file.
    pub supertypes: Vec<(String, String)>,
    /// Binary names of every type the file refers to.
    pub references: Vec<String>,
    pub has_errors: bool,
    pub dirty: bool,
}

impl FileFacts {
    pub fn new<'a>(
        declared: impl IntoIterator<Item = &'a TypeHandle>,
        supertypes: impl IntoIterator<Item = &'a (TypeHandle, TypeHandle)>,
        references: impl IntoIterator<Item = &'a TypeHandle>,
        has_errors: bool,
    ) -> Self {
        let mut declared: Vec<String> = declared
            .into_iter()
            .map(|ty| ty.binary_name().to_string())
            .collect();
        declared.sort();
        declared.dedup();
        let mut supertypes: Vec<(String, String)> = supertypes
            .into_iter()
            .map(|(sub, sup)| (sub.binary_name().to_string(), sup.binary_name().to_string()))
            .collect();
        supertypes.sort();
        supertypes.dedup();
        let mut references: Vec<String> = references
            .into_iter()
            .map(|ty| ty.binary_name().to_string())
            .collect();
        references.sort();
        references.dedup();
        Self {
            declared,
            supertypes,
            references,
            has_errors,
            dirty: false,
        }
    }
}

/// Read side of a root's class index, as seen by dependency propagation.
pub trait ClassIndex: Send + Sync {
    /// Direct subtypes of `ty` declared in this root.
    fn implementors(&self, ty: &TypeHandle) -> BTreeSet<TypeHandle>;

    /// Files of this root that declare or reference `ty`.
    fn resources(&self, ty: &TypeHandle) -> BTreeSet<Url>;

    /// Files of this root whose last compilation reported errors.
    fn files_in_error(&self) -> BTreeSet<Url>;
}

pub trait ClassIndexProvider: Send + Sync {
    /// The class index of `root`, or `None` when the root has never been indexed.
    fn class_index(&self, root: &RootUrl) -> Option<Arc<dyn ClassIndex>>;
}

#[derive(Serialize, Deserialize)]
struct Persisted {
    schema_version: u32,
    files: BTreeMap<String, FileFacts>,
}

/// Per-root class index persisted as a single JSON document.
///
/// The per-file facts are authoritative. The reverse maps are kept in step with them
/// one file at a time and are never persisted.
#[derive(Clone, Debug, Default)]
pub struct PersistentClassIndex {
    files: BTreeMap<Url, FileFacts>,
    /// Supertype to `(subtype, declaring file)`.
    subtypes: BTreeMap<String, BTreeSet<(String, Url)>>,
    referenced_by: BTreeMap<String, BTreeSet<Url>>,
    declared_by: BTreeMap<String, BTreeSet<Url>>,
    modified: bool,
}

impl PersistentClassIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index at `path`.
    ///
    /// A missing file yields an empty index. A corrupt or outdated file is logged and
    /// also yields an empty index so the next full pass rebuilds it.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(err) => return Err(err.into()),
        };
        let persisted: Persisted = match serde_json::from_slice(&bytes) {
            Ok(persisted) => persisted,
            Err(err) => {
                tracing::warn!(
                    target = "strata.index",
                    path = %path.display(),
                    error = %CacheError::from(err),
                    "discarding corrupt class index"
                );
                return Ok(Self::new());
            }
        };
        if persisted.schema_version != CLASS_INDEX_SCHEMA_VERSION {
            tracing::debug!(
                target = "strata.index",
                path = %path.display(),
                found = persisted.schema_version,
                expected = CLASS_INDEX_SCHEMA_VERSION,
                "discarding class index with a different schema version"
            );
            return Ok(Self::new());
        }

        let mut index = Self::new();
        for (url, facts) in persisted.files {
            match Url::parse(&url) {
                Ok(url) => {
                    index.link(&url, &facts);
                    index.files.insert(url, facts);
                }
                Err(err) => tracing::debug!(
                    target = "strata.index",
                    url = %url,
                    error = %err,
                    "skipping class index entry with an invalid url"
                ),
            }
        }
        Ok(index)
    }

    pub fn store(&mut self, path: &Path) -> Result<(), CacheError> {
        let persisted = Persisted {
            schema_version: CLASS_INDEX_SCHEMA_VERSION,
            files: self
                .files
                .iter()
                .map(|(url, facts)| (url.to_string(), facts.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec(&persisted)?;
        atomic_write(path, &bytes)?;
        self.modified = false;
        Ok(())
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> impl Iterator<Item = &Url> {
        self.files.keys()
    }

    pub fn facts(&self, file: &Url) -> Option<&FileFacts> {
        self.files.get(file)
    }

    /// Replace everything recorded for `file`.
    pub fn update_file(&mut self, file: &Url, facts: FileFacts) {
        if let Some(old) = self.files.remove(file) {
            self.unlink(file, &old);
        }
        self.link(file, &facts);
        self.files.insert(file.clone(), facts);
        self.modified = true;
    }

    pub fn invalidate_file(&mut self, file: &Url) {
        if let Some(old) = self.files.remove(file) {
            self.unlink(file, &old);
            self.modified = true;
        }
    }

    /// Flag `file` as changed on disk but not yet recompiled.
    ///
    /// The flag is cleared by the next [`PersistentClassIndex::update_file`] of the file.
    pub fn set_dirty(&mut self, file: &Url) {
        let facts = self.files.entry(file.clone()).or_default();
        if !facts.dirty {
            facts.dirty = true;
            self.modified = true;
        }
    }

    pub fn dirty_files(&self) -> BTreeSet<Url> {
        self.files
            .iter()
            .filter(|(_, facts)| facts.dirty)
            .map(|(url, _)| url.clone())
            .collect()
    }

    /// Files declaring `binary_name`.
    pub fn declared_in(&self, binary_name: &str) -> BTreeSet<Url> {
        self.declared_by
            .get(binary_name)
            .cloned()
            .unwrap_or_default()
    }

    fn link(&mut self, file: &Url, facts: &FileFacts) {
        for (sub, sup) in &facts.supertypes {
            self.subtypes
                .entry(sup.clone())
                .or_default()
                .insert((sub.clone(), file.clone()));
        }
        for name in &facts.references {
            self.referenced_by
                .entry(name.clone())
                .or_default()
                .insert(file.clone());
        }
        for name in &facts.declared {
            self.declared_by
                .entry(name.clone())
                .or_default()
                .insert(file.clone());
        }
    }

    fn unlink(&mut self, file: &Url, facts: &FileFacts) {
        for (sub, sup) in &facts.supertypes {
            remove_entry(&mut self.subtypes, sup, &(sub.clone(), file.clone()));
        }
        for name in &facts.references {
            remove_entry(&mut self.referenced_by, name, file);
        }
        for name in &facts.declared {
            remove_entry(&mut self.declared_by, name, file);
        }
    }
}

fn remove_entry<V: Ord>(map: &mut BTreeMap<String, BTreeSet<V>>, key: &str, value: &V) {
    if let Some(values) = map.get_mut(key) {
        values.remove(value);
        if values.is_empty() {
            map.remove(key);
        }
    }
}

impl ClassIndex for PersistentClassIndex {
    fn implementors(&self, ty: &TypeHandle) -> BTreeSet<TypeHandle> {
        self.subtypes
            .get(ty.binary_name())
            .map(|subs| subs.iter().map(|(sub, _)| TypeHandle::other(sub)).collect())
            .unwrap_or_default()
    }

    fn resources(&self, ty: &TypeHandle) -> BTreeSet<Url> {
        let mut files = self.declared_in(ty.binary_name());
        if let Some(referencing) = self.referenced_by.get(ty.binary_name()) {
            files.extend(referencing.iter().cloned());
        }
        files
    }

    fn files_in_error(&self) -> BTreeSet<Url> {
        self.files
            .iter()
            .filter(|(_, facts)| facts.has_errors)
            .map(|(url, _)| url.clone())
            .collect()
    }
}

/// Loads class indexes from the cache directory and keeps them in memory until
/// invalidated.
pub struct DiskClassIndexProvider {
    cache_dir: CacheDir,
    loaded: Mutex<HashMap<RootUrl, Arc<PersistentClassIndex>>>,
}

impl DiskClassIndexProvider {
    pub fn new(cache_dir: CacheDir) -> Self {
        Self {
            cache_dir,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    pub fn index_path(&self, root: &RootUrl) -> PathBuf {
        self.cache_dir.root_dir(root).class_index_path()
    }

    pub fn load(&self, root: &RootUrl) -> Option<Arc<PersistentClassIndex>> {
        if let Some(index) = self.loaded.lock().get(root) {
            return Some(index.clone());
        }
        let path = self.index_path(root);
        if !path.exists() {
            return None;
        }
        let index = match PersistentClassIndex::load(&path) {
            Ok(index) => Arc::new(index),
            Err(err) => {
                tracing::warn!(
                    target = "strata.index",
                    root = %root,
                    error = %err,
                    "failed to load class index"
                );
                return None;
            }
        };
        self.loaded.lock().insert(root.clone(), index.clone());
        Some(index)
    }

    /// Forget the in-memory copy of `root`'s index; the next lookup reloads it.
    pub fn invalidate(&self, root: &RootUrl) {
        self.loaded.lock().remove(root);
    }

    /// Drop every in-memory index. Used when the process runs low on memory.
    pub fn free_memory(&self) {
        let dropped = {
            let mut loaded = self.loaded.lock();
            let len = loaded.len();
            loaded.clear();
            len
        };
        tracing::debug!(target = "strata.index", dropped, "released cached class indexes");
    }
}

impl ClassIndexProvider for DiskClassIndexProvider {
    fn class_index(&self, root: &RootUrl) -> Option<Arc<dyn ClassIndex>> {
        self.load(root).map(|index| index as Arc<dyn ClassIndex>)
    }
}

/// Serves one root from an in-flight index and every other root from `fallback`.
pub struct OverlayClassIndexProvider<'a> {
    root: RootUrl,
    current: Arc<dyn ClassIndex>,
    fallback: &'a dyn ClassIndexProvider,
}

impl<'a> OverlayClassIndexProvider<'a> {
    pub fn new(
        root: RootUrl,
        current: Arc<dyn ClassIndex>,
        fallback: &'a dyn ClassIndexProvider,
    ) -> Self {
        Self {
            root,
            current,
            fallback,
        }
    }
}

impl ClassIndexProvider for OverlayClassIndexProvider<'_> {
    fn class_index(&self, root: &RootUrl) -> Option<Arc<dyn ClassIndex>> {
        if *root == self.root {
            Some(self.current.clone())
        } else {
            self.fallback.class_index(root)
        }
    }
}
