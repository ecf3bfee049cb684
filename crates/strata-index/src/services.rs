//! The services every indexing transaction carries.
//!
//! They are registered by [`begin_standard_transaction`] in a fixed order: artifacts,
//! processor-generated files, persistent index, cache attributes, class index events,
//! modified files. Attributes come after the persistent index so a failed index write
//! is reflected in the committed index state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use url::Url;

use strata_cache::{
    atomic_write, keys, package_of, ArtifactStore, AttributeStore, CacheDir, CacheError,
    CheckSums, FqnStore, FsArtifactStore, GeneratedSources, RootCacheDir,
};
use strata_core::{IndexState, RootUrl, TypeHandle};

use crate::class_index::PersistentClassIndex;
use crate::compiler::GeneratedSource;
use crate::error::IndexError;
use crate::transaction::{RegisteredService, Service, ServiceKind, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactMode {
    /// Writes go straight to disk. Used when the root has no artifacts yet.
    Direct,
    /// Writes are staged in memory and applied on commit.
    WriteBack,
}

#[derive(Debug, Clone)]
enum Staged<T> {
    Write(T),
    Delete,
}

/// Artifact writes of one pass.
///
/// In write-back mode readers see staged changes on top of what is on disk, and a
/// rollback leaves the disk untouched.
#[derive(Debug)]
pub struct ArtifactTransaction {
    store: FsArtifactStore,
    mode: ArtifactMode,
    artifacts: Mutex<BTreeMap<String, Staged<Vec<u8>>>>,
    manifests: Mutex<BTreeMap<String, Staged<Vec<String>>>>,
    deferred_deletes: Mutex<Vec<PathBuf>>,
}

impl ArtifactTransaction {
    pub fn new(store: FsArtifactStore, mode: ArtifactMode) -> Self {
        Self {
            store,
            mode,
            artifacts: Mutex::new(BTreeMap::new()),
            manifests: Mutex::new(BTreeMap::new()),
            deferred_deletes: Mutex::new(Vec::new()),
        }
    }

    /// Write-back when `store` already holds artifacts, direct otherwise.
    pub fn for_store(store: FsArtifactStore) -> Self {
        let populated = std::fs::read_dir(store.dir())
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        let mode = if populated {
            ArtifactMode::WriteBack
        } else {
            ArtifactMode::Direct
        };
        Self::new(store, mode)
    }

    pub fn mode(&self) -> ArtifactMode {
        self.mode
    }

    pub fn store(&self) -> &FsArtifactStore {
        &self.store
    }

    /// Delete a file outside the artifact store once the pass commits.
    pub fn delete_file(&self, path: &Path) -> Result<(), IndexError> {
        match self.mode {
            ArtifactMode::Direct => remove_if_exists(path),
            ArtifactMode::WriteBack => {
                self.deferred_deletes.lock().push(path.to_path_buf());
                Ok(())
            }
        }
    }

    #[cfg(test)]
    fn staged_len(&self) -> usize {
        self.artifacts.lock().len() + self.manifests.lock().len()
    }
}

fn remove_if_exists(path: &Path) -> Result<(), IndexError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl ArtifactStore for ArtifactTransaction {
    fn read_manifest(&self, source_path: &str) -> strata_cache::Result<Option<Vec<String>>> {
        if let Some(staged) = self.manifests.lock().get(source_path) {
            return Ok(match staged {
                Staged::Write(names) => Some(names.clone()),
                Staged::Delete => None,
            });
        }
        self.store.read_manifest(source_path)
    }

    fn write_manifest(&self, source_path: &str, binary_names: &[String]) -> strata_cache::Result<()> {
        match self.mode {
            ArtifactMode::Direct => self.store.write_manifest(source_path, binary_names),
            ArtifactMode::WriteBack => {
                self.store.manifest_path(source_path)?;
                self.manifests
                    .lock()
                    .insert(source_path.to_string(), Staged::Write(binary_names.to_vec()));
                Ok(())
            }
        }
    }

    fn delete_manifest(&self, source_path: &str) -> strata_cache::Result<()> {
        match self.mode {
            ArtifactMode::Direct => self.store.delete_manifest(source_path),
            ArtifactMode::WriteBack => {
                self.manifests
                    .lock()
                    .insert(source_path.to_string(), Staged::Delete);
                Ok(())
            }
        }
    }

    fn read_artifact(&self, binary_name: &str) -> strata_cache::Result<Option<Vec<u8>>> {
        if let Some(staged) = self.artifacts.lock().get(binary_name) {
            return Ok(match staged {
                Staged::Write(bytes) => Some(bytes.clone()),
                Staged::Delete => None,
            });
        }
        self.store.read_artifact(binary_name)
    }

    fn write_artifact(&self, binary_name: &str, bytes: &[u8]) -> strata_cache::Result<()> {
        match self.mode {
            ArtifactMode::Direct => self.store.write_artifact(binary_name, bytes),
            ArtifactMode::WriteBack => {
                self.store.artifact_path(binary_name)?;
                self.artifacts
                    .lock()
                    .insert(binary_name.to_string(), Staged::Write(bytes.to_vec()));
                Ok(())
            }
        }
    }

    fn delete_artifact(&self, binary_name: &str) -> strata_cache::Result<()> {
        match self.mode {
            ArtifactMode::Direct => self.store.delete_artifact(binary_name),
            ArtifactMode::WriteBack => {
                self.artifacts
                    .lock()
                    .insert(binary_name.to_string(), Staged::Delete);
                Ok(())
            }
        }
    }

    fn artifacts(&self) -> strata_cache::Result<Vec<String>> {
        let mut names: BTreeSet<String> = self.store.artifacts()?.into_iter().collect();
        for (name, staged) in self.artifacts.lock().iter() {
            match staged {
                Staged::Write(_) => {
                    names.insert(name.clone());
                }
                Staged::Delete => {
                    names.remove(name);
                }
            }
        }
        Ok(names.into_iter().collect())
    }

    fn package_artifacts(&self, package: &str) -> strata_cache::Result<Vec<String>> {
        let mut names: BTreeSet<String> = self.store.package_artifacts(package)?.into_iter().collect();
        for (name, staged) in self.artifacts.lock().iter() {
            if package_of(name) != package {
                continue;
            }
            match staged {
                Staged::Write(_) => {
                    names.insert(name.clone());
                }
                Staged::Delete => {
                    names.remove(name);
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

impl Service for ArtifactTransaction {
    fn commit(&mut self) -> Result<(), IndexError> {
        let artifacts = std::mem::take(self.artifacts.get_mut());
        let manifests = std::mem::take(self.manifests.get_mut());
        let deletes = std::mem::take(self.deferred_deletes.get_mut());
        let (written, deleted) = (artifacts.len(), deletes.len());
        for (name, staged) in artifacts {
            match staged {
                Staged::Write(bytes) => self.store.write_artifact(&name, &bytes)?,
                Staged::Delete => self.store.delete_artifact(&name)?,
            }
        }
        for (path, staged) in manifests {
            match staged {
                Staged::Write(names) => self.store.write_manifest(&path, &names)?,
                Staged::Delete => self.store.delete_manifest(&path)?,
            }
        }
        for path in deletes {
            remove_if_exists(&path)?;
        }
        tracing::trace!(
            target = "strata.index",
            dir = %self.store.dir().display(),
            written,
            deleted,
            "artifacts committed"
        );
        Ok(())
    }

    fn roll_back(&mut self) -> Result<(), IndexError> {
        self.artifacts.get_mut().clear();
        self.manifests.get_mut().clear();
        self.deferred_deletes.get_mut().clear();
        Ok(())
    }
}

impl RegisteredService for ArtifactTransaction {
    const KIND: ServiceKind = ServiceKind::Artifacts;
}

/// Tracks sources written by annotation processors.
///
/// Generated files are written immediately. A rollback deletes the ones this pass
/// created that were not known before it started.
#[derive(Debug)]
pub struct ProcessorGeneratedFiles {
    store: GeneratedSources,
    known: BTreeSet<Url>,
    created: BTreeSet<Url>,
}

impl ProcessorGeneratedFiles {
    pub fn load(paths: &RootCacheDir) -> Result<Self, CacheError> {
        let store = GeneratedSources::load(paths.generated_sources_path())?;
        let known = store.all_generated();
        Ok(Self {
            store,
            known,
            created: BTreeSet::new(),
        })
    }

    pub fn generated_by(&self, origin: &Url) -> BTreeSet<Url> {
        self.store.generated_by(origin)
    }

    /// Forget what `origin` generated, returning the files so they can be deleted.
    pub fn forget(&mut self, origin: &Url) -> BTreeSet<Url> {
        self.store.remove(origin)
    }

    pub fn is_generated(&self, file: &Url) -> bool {
        self.known.contains(file) || self.created.contains(file)
    }

    /// Write `source` to disk and remember it as generated by its origin.
    pub fn record(&mut self, source: &GeneratedSource) -> Result<(), IndexError> {
        let url = &source.indexable.url;
        if let Ok(path) = url.to_file_path() {
            atomic_write(&path, source.text.as_bytes())?;
        }
        let mut generated = self.store.generated_by(&source.origin);
        generated.insert(url.clone());
        self.store.set(&source.origin, &generated);
        if !self.known.contains(url) {
            self.created.insert(url.clone());
        }
        Ok(())
    }
}

impl Service for ProcessorGeneratedFiles {
    fn commit(&mut self) -> Result<(), IndexError> {
        self.store.store()?;
        self.known.append(&mut self.created);
        Ok(())
    }

    fn roll_back(&mut self) -> Result<(), IndexError> {
        for url in std::mem::take(&mut self.created) {
            if let Ok(path) = url.to_file_path() {
                if let Err(err) = remove_if_exists(&path) {
                    tracing::debug!(
                        target = "strata.index",
                        path = %path.display(),
                        error = %err,
                        "failed to delete generated source on rollback"
                    );
                }
            }
        }
        Ok(())
    }
}

impl RegisteredService for ProcessorGeneratedFiles {
    const KIND: ServiceKind = ServiceKind::GeneratedFiles;
}

/// The class index, structural digests and declaring-file map of one root.
///
/// Everything is loaded when the transaction starts and written on commit. A failed
/// write marks the index broken, which the attributes service then records.
#[derive(Debug)]
pub struct PersistentIndexTransaction {
    root: RootUrl,
    paths: RootCacheDir,
    class_index: Arc<PersistentClassIndex>,
    checksums: CheckSums,
    fqns: FqnStore,
    broken: Arc<AtomicBool>,
}

impl PersistentIndexTransaction {
    pub fn load(
        root: &RootUrl,
        paths: RootCacheDir,
        broken: Arc<AtomicBool>,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            root: root.clone(),
            class_index: Arc::new(PersistentClassIndex::load(&paths.class_index_path())?),
            checksums: CheckSums::load(paths.checksums_path())?,
            fqns: FqnStore::load(paths.fqn_path())?,
            paths,
            broken,
        })
    }

    pub fn class_index(&self) -> &PersistentClassIndex {
        &self.class_index
    }

    /// The in-flight index as a shared handle, for readers outside the transaction.
    pub fn shared_class_index(&self) -> Arc<PersistentClassIndex> {
        Arc::clone(&self.class_index)
    }

    /// Copies the index first if a shared handle is still alive.
    pub fn class_index_mut(&mut self) -> &mut PersistentClassIndex {
        Arc::make_mut(&mut self.class_index)
    }

    pub fn checksums(&self) -> &CheckSums {
        &self.checksums
    }

    pub fn checksums_mut(&mut self) -> &mut CheckSums {
        &mut self.checksums
    }

    pub fn fqns(&self) -> &FqnStore {
        &self.fqns
    }

    pub fn fqns_mut(&mut self) -> &mut FqnStore {
        &mut self.fqns
    }

    pub fn set_broken(&self, reason: &str) {
        if !self.broken.swap(true, Ordering::SeqCst) {
            tracing::warn!(target = "strata.index", root = %self.root, reason, "index marked broken");
        }
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }
}

impl Service for PersistentIndexTransaction {
    fn commit(&mut self) -> Result<(), IndexError> {
        let first_error = match self.paths.create() {
            Err(err) => Some(err),
            Ok(()) => [
                self.checksums.store(),
                self.fqns.store(),
                Arc::make_mut(&mut self.class_index).store(&self.paths.class_index_path()),
            ]
            .into_iter()
            .find_map(Result::err),
        };
        match first_error {
            None => Ok(()),
            Some(err) => {
                self.set_broken(&err.to_string());
                Err(IndexError::Broken {
                    root: self.root.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    fn roll_back(&mut self) -> Result<(), IndexError> {
        Ok(())
    }
}

impl RegisteredService for PersistentIndexTransaction {
    const KIND: ServiceKind = ServiceKind::PersistentIndex;
}

/// Moves the root's [`IndexState`] forward on commit and flushes its attributes on
/// either outcome.
pub struct CacheAttributesTransaction {
    root: RootUrl,
    attributes: AttributeStore,
    broken: Arc<AtomicBool>,
    invalid: bool,
    full_pass: bool,
}

impl CacheAttributesTransaction {
    pub fn new(root: &RootUrl, attributes: AttributeStore, broken: Arc<AtomicBool>) -> Self {
        Self {
            root: root.clone(),
            attributes,
            broken,
            invalid: false,
            full_pass: false,
        }
    }

    /// Commit as [`IndexState::Invalid`] regardless of the pass outcome.
    pub fn set_invalid(&mut self) {
        self.invalid = true;
    }

    pub fn set_full_pass(&mut self) {
        self.full_pass = true;
    }

    pub fn is_full_pass(&self) -> bool {
        self.full_pass
    }
}

/// The persisted state of `root`, [`IndexState::New`] when missing or unreadable.
pub fn read_index_state(attributes: &AttributeStore, root: &RootUrl) -> Result<IndexState, CacheError> {
    let raw = attributes.get(root, keys::INDEX_STATE, None)?;
    Ok(raw.and_then(|raw| raw.parse().ok()).unwrap_or_default())
}

impl Service for CacheAttributesTransaction {
    fn commit(&mut self) -> Result<(), IndexError> {
        let current = read_index_state(&self.attributes, &self.root)?;
        let next = if self.invalid || self.broken.load(Ordering::SeqCst) {
            IndexState::Invalid
        } else {
            current.after_commit(self.full_pass)
        };
        self.attributes
            .set(&self.root, keys::INDEX_STATE, Some(next.as_str()))?;
        if self.full_pass && next == IndexState::Initialized {
            self.attributes.set(&self.root, keys::DIRTY, None)?;
        }
        self.attributes.flush(&self.root)?;
        tracing::debug!(
            target = "strata.index",
            root = %self.root,
            from = %current,
            to = %next,
            full_pass = self.full_pass,
            "index state committed"
        );
        Ok(())
    }

    fn roll_back(&mut self) -> Result<(), IndexError> {
        self.attributes.flush(&self.root)?;
        Ok(())
    }
}

impl RegisteredService for CacheAttributesTransaction {
    const KIND: ServiceKind = ServiceKind::CacheAttributes;
}

/// Type-level changes of one committed pass.
///
/// A module declared by the root shows up as a module handle in `added` the first time
/// and in `changed` afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassIndexEvent {
    pub root: RootUrl,
    pub added: BTreeSet<TypeHandle>,
    pub removed: BTreeSet<TypeHandle>,
    pub changed: BTreeSet<TypeHandle>,
    /// Binary names of the artifacts the pass wrote.
    pub added_cache_files: BTreeSet<String>,
    /// Binary names of the artifacts the pass deleted and did not write again.
    pub removed_cache_files: BTreeSet<String>,
}

impl ClassIndexEvent {
    fn new(root: &RootUrl) -> Self {
        Self {
            root: root.clone(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            changed: BTreeSet::new(),
            added_cache_files: BTreeSet::new(),
            removed_cache_files: BTreeSet::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.added_cache_files.is_empty()
            && self.removed_cache_files.is_empty()
    }
}

pub trait ClassIndexListener: Send + Sync {
    fn types_changed(&self, event: &ClassIndexEvent);
}

/// Batches type changes and delivers them to listeners only once the pass commits.
pub struct ClassIndexEventsTransaction {
    event: ClassIndexEvent,
    listeners: Vec<Arc<dyn ClassIndexListener>>,
}

impl ClassIndexEventsTransaction {
    pub fn new(root: &RootUrl, listeners: Vec<Arc<dyn ClassIndexListener>>) -> Self {
        Self {
            event: ClassIndexEvent::new(root),
            listeners,
        }
    }

    pub fn added_types(&mut self, types: impl IntoIterator<Item = TypeHandle>) {
        self.event.added.extend(types);
    }

    pub fn removed_types(&mut self, types: impl IntoIterator<Item = TypeHandle>) {
        self.event.removed.extend(types);
    }

    pub fn changed_types(&mut self, types: impl IntoIterator<Item = TypeHandle>) {
        self.event.changed.extend(types);
    }

    pub fn added_cache_files(&mut self, names: impl IntoIterator<Item = String>) {
        self.event.added_cache_files.extend(names);
    }

    pub fn removed_cache_files(&mut self, names: impl IntoIterator<Item = String>) {
        self.event.removed_cache_files.extend(names);
    }

    pub fn pending(&self) -> &ClassIndexEvent {
        &self.event
    }
}

impl Service for ClassIndexEventsTransaction {
    fn commit(&mut self) -> Result<(), IndexError> {
        if self.event.is_empty() {
            return Ok(());
        }
        for listener in &self.listeners {
            listener.types_changed(&self.event);
        }
        Ok(())
    }

    fn roll_back(&mut self) -> Result<(), IndexError> {
        self.event = ClassIndexEvent::new(&self.event.root);
        Ok(())
    }
}

impl RegisteredService for ClassIndexEventsTransaction {
    const KIND: ServiceKind = ServiceKind::ClassIndexEvents;
}

/// Files whose compiled output changed, published per root by committed passes.
#[derive(Clone, Debug, Default)]
pub struct ModifiedFilesRegistry {
    inner: Arc<Mutex<BTreeMap<RootUrl, BTreeSet<Url>>>>,
}

impl ModifiedFilesRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modified(&self, root: &RootUrl) -> BTreeSet<Url> {
        self.inner.lock().get(root).cloned().unwrap_or_default()
    }

    /// Remove and return what was published for `root`.
    pub fn take(&self, root: &RootUrl) -> BTreeSet<Url> {
        self.inner.lock().remove(root).unwrap_or_default()
    }

    fn publish(&self, root: &RootUrl, files: BTreeSet<Url>) {
        self.inner
            .lock()
            .entry(root.clone())
            .or_default()
            .extend(files);
    }
}

pub struct ModifiedFilesTransaction {
    root: RootUrl,
    registry: ModifiedFilesRegistry,
    pending: BTreeSet<Url>,
}

impl ModifiedFilesTransaction {
    pub fn new(root: &RootUrl, registry: ModifiedFilesRegistry) -> Self {
        Self {
            root: root.clone(),
            registry,
            pending: BTreeSet::new(),
        }
    }

    pub fn record(&mut self, files: impl IntoIterator<Item = Url>) {
        self.pending.extend(files);
    }
}

impl Service for ModifiedFilesTransaction {
    fn commit(&mut self) -> Result<(), IndexError> {
        if !self.pending.is_empty() {
            self.registry
                .publish(&self.root, std::mem::take(&mut self.pending));
        }
        Ok(())
    }

    fn roll_back(&mut self) -> Result<(), IndexError> {
        self.pending.clear();
        Ok(())
    }
}

impl RegisteredService for ModifiedFilesTransaction {
    const KIND: ServiceKind = ServiceKind::ModifiedFiles;
}

/// Shared state the standard services are built from.
#[derive(Clone)]
pub struct ServiceEnv {
    pub cache_dir: CacheDir,
    pub attributes: AttributeStore,
    pub listeners: Vec<Arc<dyn ClassIndexListener>>,
    pub modified_files: ModifiedFilesRegistry,
}

/// Open a transaction for `root` with every standard service registered.
pub fn begin_standard_transaction(
    root: &RootUrl,
    env: &ServiceEnv,
) -> Result<Transaction, IndexError> {
    let paths = env.cache_dir.root_dir(root);
    let broken = Arc::new(AtomicBool::new(false));
    let mut tx = Transaction::begin(root);
    let artifacts = ArtifactTransaction::for_store(FsArtifactStore::new(paths.classes_dir()));
    tracing::debug!(
        target = "strata.index",
        root = %root,
        mode = ?artifacts.mode(),
        "opening indexing transaction"
    );
    tx.register(artifacts)?;
    tx.register(ProcessorGeneratedFiles::load(&paths)?)?;
    tx.register(PersistentIndexTransaction::load(
        root,
        paths,
        Arc::clone(&broken),
    )?)?;
    tx.register(CacheAttributesTransaction::new(
        root,
        env.attributes.clone(),
        broken,
    ))?;
    tx.register(ClassIndexEventsTransaction::new(root, env.listeners.clone()))?;
    tx.register(ModifiedFilesTransaction::new(
        root,
        env.modified_files.clone(),
    ))?;
    Ok(tx)
}
