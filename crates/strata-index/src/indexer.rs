//! The per-root indexing pass.
//!
//! A scan of one root opens a [`ScanSession`], feeds it one or more batches through
//! [`RootIndexer::index`] and [`RootIndexer::files_deleted`], and closes it with
//! [`RootIndexer::scan_finished`], which commits the session's transaction or rolls it
//! back. [`RootIndexer::index_root`] does all of that for a single batch.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use url::Url;

use strata_cache::{
    keys, ArtifactStore, AttributeStore, AttributeStoreConfig, CacheConfig, CacheDir,
    FsArtifactStore,
};
use strata_config::IndexingConfig;
use strata_core::fs::{collect_files, max_modified_time, modified_time};
use strata_core::{Indexable, IndexState, RootUrl, TrackingMode, TypeHandle, STRATA_VERSION};
use strata_scheduler::{CancellationToken, Scheduler, SuspendSignal};

use crate::class_index::{ClassIndex, DiskClassIndexProvider, OverlayClassIndexProvider};
use crate::deps::{DependencyQuery, DependencyResolver, Dependents, RootGraph};
use crate::error::{IndexError, IndexingError};
use crate::memory::{MemoryPressure, MemoryStatus, SystemMemoryStatus};
use crate::prefetch::{CompileTuple, PrefetchEnv};
use crate::services::{
    begin_standard_transaction, read_index_state, ArtifactTransaction,
    CacheAttributesTransaction, ClassIndexEventsTransaction, ClassIndexListener,
    ModifiedFilesRegistry, ModifiedFilesTransaction, PersistentIndexTransaction,
    ProcessorGeneratedFiles, ServiceEnv,
};
use crate::transaction::Transaction;
use crate::worker::{
    run_worker_chain, CompileContext, CompileOutput, CompileStatus, CompileWorker,
    CompileWorkerProvider,
};

/// Receives files of other roots (or of the indexed root itself) that have to be
/// reindexed because of what a pass changed.
pub trait SupplementarySink: Send + Sync {
    fn revisit(&self, root: &RootUrl, files: &BTreeSet<Url>);
}

/// A [`SupplementarySink`] that only collects requests.
#[derive(Clone, Debug, Default)]
pub struct CollectingSink {
    requests: Arc<Mutex<IndexMap<RootUrl, BTreeSet<Url>>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> IndexMap<RootUrl, BTreeSet<Url>> {
        std::mem::take(&mut *self.requests.lock())
    }
}

impl SupplementarySink for CollectingSink {
    fn revisit(&self, root: &RootUrl, files: &BTreeSet<Url>) {
        self.requests
            .lock()
            .entry(root.clone())
            .or_default()
            .extend(files.iter().cloned());
    }
}

/// Prebuilt output of a root, e.g. the classes directory of an external build.
#[derive(Clone, Debug, Default)]
pub struct BinaryRoots {
    pub roots: Vec<PathBuf>,
    /// Use the binaries instead of compiling whenever they are newer than the sources.
    pub prefer_binaries: bool,
}

pub trait BinaryForSource: Send + Sync {
    fn binaries(&self, root: &RootUrl) -> Option<BinaryRoots>;
}

/// Signatures of the settings a root was indexed with. Any change forces a full pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanMetadata {
    pub source_path: String,
    pub compiler_options: String,
    pub source_level: String,
}

/// An open scan of one root.
pub struct ScanSession {
    root: RootUrl,
    tx: Transaction,
    up_to_date: bool,
    cancelled: bool,
    failed: bool,
    /// Revisit requests and dirty marks, sent only once the transaction commits.
    pending: Dependents,
}

impl ScanSession {
    pub fn root(&self) -> &RootUrl {
        &self.root
    }

    /// Whether the root's index was valid when the scan started. If not, the scan
    /// should index every file of the root.
    pub fn up_to_date(&self) -> bool {
        self.up_to_date
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Make [`RootIndexer::scan_finished`] roll back instead of committing.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// What the batches so far will ask of other roots and files once the scan commits.
    pub fn pending_dependents(&self) -> &Dependents {
        &self.pending
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub compiled: BTreeSet<Url>,
    pub added: BTreeSet<TypeHandle>,
    pub removed: BTreeSet<TypeHandle>,
    pub changed: BTreeSet<TypeHandle>,
    /// Types whose structural digest changed.
    pub modified: BTreeSet<TypeHandle>,
    pub dependents: IndexMap<RootUrl, BTreeSet<Url>>,
    pub deferred: BTreeSet<RootUrl>,
    pub module_name: Option<String>,
    pub low_memory: bool,
    pub compiled_ok: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    CopiedFromBinaries { artifacts: usize },
    Indexed(PassSummary),
    Cancelled,
}

struct IndexerMemory {
    status: Arc<dyn MemoryStatus>,
    class_indexes: Arc<DiskClassIndexProvider>,
}

impl MemoryStatus for IndexerMemory {
    fn pressure(&self) -> MemoryPressure {
        self.status.pressure()
    }

    fn free_memory(&self) {
        self.class_indexes.free_memory();
        self.status.free_memory();
    }
}

pub struct RootIndexer {
    env: ServiceEnv,
    graph: Arc<dyn RootGraph>,
    class_indexes: Arc<DiskClassIndexProvider>,
    workers: Arc<dyn CompileWorkerProvider>,
    sink: Arc<dyn SupplementarySink>,
    memory: IndexerMemory,
    prefetch: PrefetchEnv,
    binaries: Option<Arc<dyn BinaryForSource>>,
    tracking: TrackingMode,
    max_rounds: u32,
}

impl RootIndexer {
    pub fn new(
        attributes: AttributeStore,
        graph: Arc<dyn RootGraph>,
        workers: Arc<dyn CompileWorkerProvider>,
        sink: Arc<dyn SupplementarySink>,
    ) -> Self {
        let cache_dir = attributes.cache_dir().clone();
        let class_indexes = Arc::new(DiskClassIndexProvider::new(cache_dir.clone()));
        Self {
            env: ServiceEnv {
                cache_dir,
                attributes,
                listeners: Vec::new(),
                modified_files: ModifiedFilesRegistry::new(),
            },
            graph,
            memory: IndexerMemory {
                status: Arc::new(SystemMemoryStatus::new()),
                class_indexes: Arc::clone(&class_indexes),
            },
            class_indexes,
            workers,
            sink,
            prefetch: PrefetchEnv::sequential(),
            binaries: None,
            tracking: TrackingMode::default(),
            max_rounds: 2,
        }
    }

    /// Build an indexer from the `[indexing]` section of the configuration.
    ///
    /// With a scheduler, attribute writes are deferred and sources are prefetched
    /// concurrently when the policy allows it.
    pub fn from_config(
        config: &IndexingConfig,
        scheduler: Option<Scheduler>,
        graph: Arc<dyn RootGraph>,
        workers: Arc<dyn CompileWorkerProvider>,
        sink: Arc<dyn SupplementarySink>,
    ) -> Result<Self, IndexError> {
        let cache_dir = CacheDir::new(CacheConfig {
            cache_root_override: config.effective_cache_root(),
        })?;
        let attributes_config = AttributeStoreConfig {
            write_delay: config.attributes.write_delay(),
            cache_ttl: config.attributes.cache_ttl(),
        };
        let (attributes, suspend) = match scheduler {
            Some(scheduler) => (
                AttributeStore::with_scheduler(cache_dir, attributes_config, scheduler),
                SuspendSignal::new(),
            ),
            None => (
                AttributeStore::new(cache_dir, attributes_config),
                SuspendSignal::unsupported(),
            ),
        };
        tracing::debug!(
            target = "strata.index",
            cache_root = %attributes.cache_dir().root().display(),
            tracking = ?config.dependency_tracking,
            "indexer configured"
        );
        Ok(Self::new(attributes, graph, workers, sink)
            .with_tracking_mode(config.dependency_tracking)
            .with_max_processor_rounds(config.max_processor_rounds)
            .with_prefetch(PrefetchEnv::from_config(&config.prefetch, suspend)))
    }

    pub fn with_tracking_mode(mut self, mode: TrackingMode) -> Self {
        self.tracking = mode;
        self
    }

    pub fn with_max_processor_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub fn with_memory_status(mut self, status: Arc<dyn MemoryStatus>) -> Self {
        self.memory.status = status;
        self
    }

    pub fn with_prefetch(mut self, prefetch: PrefetchEnv) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_binaries(mut self, binaries: Arc<dyn BinaryForSource>) -> Self {
        self.binaries = Some(binaries);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ClassIndexListener>) -> Self {
        self.env.listeners.push(listener);
        self
    }

    pub fn attributes(&self) -> &AttributeStore {
        &self.env.attributes
    }

    pub fn cache_dir(&self) -> &CacheDir {
        &self.env.cache_dir
    }

    pub fn class_indexes(&self) -> &Arc<DiskClassIndexProvider> {
        &self.class_indexes
    }

    pub fn modified_files(&self) -> &ModifiedFilesRegistry {
        &self.env.modified_files
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.tracking
    }

    /// Open a scan of `root` and check whether its index can be updated incrementally.
    pub fn scan_started(
        &self,
        root: &RootUrl,
        metadata: &ScanMetadata,
    ) -> Result<ScanSession, IndexingError> {
        let tx = begin_standard_transaction(root, &self.env)
            .map_err(|err| IndexingError::new(root, err))?;
        let up_to_date = match self.check_up_to_date(root, metadata) {
            Ok(up_to_date) => up_to_date,
            Err(err) => {
                tracing::warn!(
                    target = "strata.index",
                    root = %root,
                    error = %err,
                    "validity check failed, assuming the root changed"
                );
                false
            }
        };
        tracing::debug!(target = "strata.index", root = %root, up_to_date, "scan started");
        Ok(ScanSession {
            root: root.clone(),
            tx,
            up_to_date,
            cancelled: false,
            failed: false,
            pending: Dependents::default(),
        })
    }

    fn check_up_to_date(&self, root: &RootUrl, metadata: &ScanMetadata) -> Result<bool, IndexError> {
        let attributes = &self.env.attributes;
        let index_ok = match read_index_state(attributes, root)? {
            IndexState::Initialized => true,
            IndexState::New => self.class_indexes.load(root).is_some(),
            IndexState::Invalid => false,
        };

        let mut changed = false;
        for (key, value) in [
            (keys::SOURCE_PATH, metadata.source_path.as_str()),
            (keys::COMPILER_OPTIONS, metadata.compiler_options.as_str()),
            (keys::SOURCE_LEVEL, metadata.source_level.as_str()),
            (keys::STRATA_VERSION, STRATA_VERSION),
        ] {
            changed |= attributes.ensure(root, key, Some(value), false)?;
        }
        if changed {
            attributes.set(root, keys::DIRTY, Some("true"))?;
        }
        let dirty = attributes.get(root, keys::DIRTY, None)?.as_deref() == Some("true");
        Ok(index_ok && !changed && !dirty)
    }

    /// Index `files` of the session's root.
    ///
    /// `all_files` marks a full pass: the files are every source of the root, and a
    /// successful commit clears the root's dirty flag and any `Invalid` state.
    pub fn index(
        &self,
        session: &mut ScanSession,
        files: &[Indexable],
        all_files: bool,
        token: &CancellationToken,
    ) -> Result<PassOutcome, IndexingError> {
        match self.run_pass(session, files, all_files, token) {
            Ok(PassOutcome::Cancelled) => {
                tracing::debug!(target = "strata.index", root = %session.root, "pass cancelled");
                session.cancelled = true;
                Ok(PassOutcome::Cancelled)
            }
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                session.failed = true;
                Err(IndexingError::new(&session.root, err))
            }
        }
    }

    fn run_pass(
        &self,
        session: &mut ScanSession,
        files: &[Indexable],
        all_files: bool,
        token: &CancellationToken,
    ) -> Result<PassOutcome, IndexError> {
        if token.is_cancelled() {
            return Ok(PassOutcome::Cancelled);
        }
        let root = session.root.clone();
        let tx = &mut session.tx;
        if all_files {
            tx.get_mut::<CacheAttributesTransaction>()?.set_full_pass();
        }
        tx.get_mut::<PersistentIndexTransaction>()?
            .checksums_mut()
            .checkpoint();

        if let Some(artifacts) = self.try_binary_shortcut(tx, &root, files)? {
            tracing::info!(
                target = "strata.index",
                root = %root,
                artifacts,
                "copied prebuilt binaries instead of compiling"
            );
            return Ok(PassOutcome::CopiedFromBinaries { artifacts });
        }

        let mut removed_pre = BTreeSet::new();
        let mut tuples = Vec::with_capacity(files.len());
        for indexable in files {
            if token.is_cancelled() {
                return Ok(PassOutcome::Cancelled);
            }
            removed_pre.extend(clear_stale_artifacts(tx, &root, indexable)?);
            match indexable.to_path() {
                Some(path) if path.is_file() => {
                    tuples.push(CompileTuple::file(indexable.clone(), path));
                }
                _ => forget_file(tx, &indexable.url)?,
            }
        }

        let workers = self.workers.workers(&root);
        let out = {
            let mut ctx = CompileContext {
                root: &root,
                tx: &mut *tx,
                prefetch: &self.prefetch,
                memory: &self.memory,
                token,
            };
            self.compile_rounds(&workers, &mut ctx, tuples)
        };
        if out.status == CompileStatus::Cancelled || token.is_cancelled() {
            return Ok(PassOutcome::Cancelled);
        }
        if out.low_memory {
            tracing::warn!(
                target = "strata.index",
                root = %root,
                "indexing ran low on memory, consider a larger heap budget"
            );
        }
        if !out.is_success() {
            tracing::warn!(
                target = "strata.index",
                root = %root,
                status = ?out.status,
                "compilation did not complete, marking index invalid"
            );
            tx.get_mut::<CacheAttributesTransaction>()?.set_invalid();
        }

        let added: BTreeSet<TypeHandle> = out.added_types.difference(&removed_pre).cloned().collect();
        let removed: BTreeSet<TypeHandle> = removed_pre.difference(&out.added_types).cloned().collect();
        let changed: BTreeSet<TypeHandle> = out.added_types.intersection(&removed_pre).cloned().collect();

        let query = DependencyQuery::new(root.clone())
            .changed(out.modified_types.iter().cloned())
            .removed(removed.iter().cloned())
            .include_error_files(!added.is_empty());
        let mut dependents = self.find_dependent(tx, &query)?;
        if token.is_cancelled() {
            return Ok(PassOutcome::Cancelled);
        }
        // Files flagged dirty and not compiled by this pass are revisited with the dependents.
        let dirty = tx
            .get::<PersistentIndexTransaction>()?
            .class_index()
            .dirty_files();
        if !dirty.is_empty() {
            dependents.files.entry(root.clone()).or_default().extend(dirty);
        }
        let drop_root = match dependents.files.get_mut(&root) {
            Some(own) => {
                own.retain(|file| !out.finished_files.contains(file));
                all_files || own.is_empty()
            }
            None => false,
        };
        if drop_root {
            dependents.files.shift_remove(&root);
        }

        let had_module = self
            .env
            .attributes
            .get(&root, keys::MODULE_NAME, None)?
            .is_some();
        if let Some(module) = &out.module_name {
            self.env
                .attributes
                .ensure(&root, keys::MODULE_NAME, Some(module.as_str()), false)?;
        }
        let events = tx.get_mut::<ClassIndexEventsTransaction>()?;
        events.added_types(added.iter().cloned());
        events.removed_types(removed.iter().cloned());
        events.changed_types(changed.iter().cloned());
        if had_module {
            events.changed_types(out.added_modules.iter().cloned());
        } else {
            events.added_types(out.added_modules.iter().cloned());
        }
        events.added_cache_files(out.created_artifacts.iter().cloned());
        events.removed_cache_files(removed.iter().map(|ty| ty.binary_name().to_string()));
        tx.get_mut::<ModifiedFilesTransaction>()?
            .record(out.finished_files.iter().cloned());
        session.pending.merge(dependents.clone());

        tracing::debug!(
            target = "strata.index",
            root = %root,
            compiled = out.finished_files.len(),
            added = added.len(),
            removed = removed.len(),
            changed = changed.len(),
            modified = out.modified_types.len(),
            "pass compiled"
        );
        Ok(PassOutcome::Indexed(PassSummary {
            compiled: out.finished_files.clone(),
            added,
            removed,
            changed,
            modified: out.modified_types.clone(),
            dependents: dependents.files,
            deferred: dependents.deferred,
            module_name: out.module_name.clone(),
            low_memory: out.low_memory,
            compiled_ok: out.is_success(),
        }))
    }

    /// Run the worker chain, then again over processor output, up to the round limit.
    fn compile_rounds(
        &self,
        workers: &[Box<dyn CompileWorker>],
        ctx: &mut CompileContext<'_>,
        tuples: Vec<CompileTuple>,
    ) -> CompileOutput {
        let mut total = CompileOutput::default();
        let mut batch = tuples;
        let mut round = 0;
        while !batch.is_empty() {
            round += 1;
            let out = run_worker_chain(workers, ctx, &batch);
            let generated = out.apt_generated.clone();
            total.merge(out);
            if !total.is_success() {
                break;
            }
            if round >= self.max_rounds {
                if !generated.is_empty() {
                    tracing::warn!(
                        target = "strata.index",
                        root = %ctx.root,
                        rounds = round,
                        pending = generated.len(),
                        "processor round limit reached"
                    );
                }
                break;
            }
            batch = generated;
        }
        total
    }

    fn find_dependent(
        &self,
        tx: &Transaction,
        query: &DependencyQuery,
    ) -> Result<Dependents, IndexError> {
        let current: Arc<dyn ClassIndex> =
            tx.get::<PersistentIndexTransaction>()?.shared_class_index();
        let indexes = OverlayClassIndexProvider::new(
            query.root.clone(),
            current,
            self.class_indexes.as_ref(),
        );
        let resolver = DependencyResolver::new(self.graph.as_ref(), &indexes, self.tracking);
        Ok(resolver.find_dependent(query))
    }

    fn submit_dependents(&self, dependents: &Dependents) {
        for (root, files) in &dependents.files {
            self.sink.revisit(root, files);
        }
        for root in &dependents.deferred {
            if let Err(err) = self.env.attributes.set(root, keys::DIRTY, Some("true")) {
                tracing::warn!(
                    target = "strata.index",
                    root = %root,
                    error = %err,
                    "failed to mark dependent root dirty"
                );
            }
        }
    }

    fn try_binary_shortcut(
        &self,
        tx: &Transaction,
        root: &RootUrl,
        files: &[Indexable],
    ) -> Result<Option<usize>, IndexError> {
        let Some(binaries) = self.binaries.as_ref().and_then(|b| b.binaries(root)) else {
            return Ok(None);
        };
        if !binaries.prefer_binaries {
            return Ok(None);
        }
        let mut class_files = Vec::new();
        for binary_root in &binaries.roots {
            for path in collect_files(binary_root)? {
                if path.extension().is_some_and(|ext| ext == "class") {
                    class_files.push((binary_root, path));
                }
            }
        }
        if class_files.is_empty() {
            return Ok(None);
        }

        let newest_source = max_modified_time(files.iter().filter_map(Indexable::to_path))?;
        let newest_binary = max_modified_time(class_files.iter().map(|(_, path)| path.clone()))?;
        match (newest_binary, newest_source) {
            (Some(binary), Some(source)) if binary >= source => {}
            (Some(_), None) => {}
            _ => return Ok(None),
        }

        let artifacts = tx.get::<ArtifactTransaction>()?;
        let mut copied = 0;
        for (binary_root, path) in class_files {
            let Some(binary_name) = binary_name_of(binary_root, &path) else {
                continue;
            };
            if artifact_is_current(artifacts.store(), &binary_name, &path) {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            artifacts.write_artifact(&binary_name, &bytes)?;
            copied += 1;
        }
        Ok(Some(copied))
    }

    /// Clear everything recorded for `deleted` and propagate the removed types.
    ///
    /// Roots holding only annotation processor output are skipped; their files go away
    /// together with the sources that generated them.
    pub fn files_deleted(
        &self,
        session: &mut ScanSession,
        deleted: &[Indexable],
        token: &CancellationToken,
    ) -> Result<(), IndexingError> {
        if self.graph.is_processor_output(&session.root) {
            tracing::trace!(
                target = "strata.index",
                root = %session.root,
                "ignoring deletions in processor output root"
            );
            return Ok(());
        }
        let result = self.delete_files(session, deleted, token);
        result.map_err(|err| {
            session.failed = true;
            IndexingError::new(&session.root, err)
        })
    }

    fn delete_files(
        &self,
        session: &mut ScanSession,
        deleted: &[Indexable],
        token: &CancellationToken,
    ) -> Result<(), IndexError> {
        let root = session.root.clone();
        let tx = &mut session.tx;
        let mut removed = BTreeSet::new();
        for indexable in deleted {
            if token.is_cancelled() {
                session.cancelled = true;
                return Ok(());
            }
            removed.extend(clear_stale_artifacts(tx, &root, indexable)?);
            forget_file(tx, &indexable.url)?;
        }
        if removed.is_empty() {
            return Ok(());
        }
        let events = tx.get_mut::<ClassIndexEventsTransaction>()?;
        events.removed_types(removed.iter().cloned());
        events.removed_cache_files(removed.iter().map(|ty| ty.binary_name().to_string()));

        let query = DependencyQuery::new(root.clone()).removed(removed);
        let mut dependents = self.find_dependent(tx, &query)?;
        let gone: BTreeSet<&Url> = deleted.iter().map(|indexable| &indexable.url).collect();
        let drop_root = match dependents.files.get_mut(&root) {
            Some(own) => {
                own.retain(|file| !gone.contains(file));
                own.is_empty()
            }
            None => false,
        };
        if drop_root {
            dependents.files.shift_remove(&root);
        }
        tracing::debug!(
            target = "strata.index",
            root = %root,
            deleted = deleted.len(),
            dependents = dependents.files.len(),
            "deleted files cleared"
        );
        session.pending.merge(dependents);
        Ok(())
    }

    /// Record that `files` changed on disk and wait for recompilation.
    pub fn files_dirty(
        &self,
        session: &mut ScanSession,
        files: &[Indexable],
    ) -> Result<(), IndexingError> {
        let index = session
            .tx
            .get_mut::<PersistentIndexTransaction>()
            .map_err(|err| IndexingError::new(&session.root, err))?;
        for indexable in files {
            index.class_index_mut().set_dirty(&indexable.url);
        }
        Ok(())
    }

    /// Commit the session, or roll it back when it was cancelled or failed.
    pub fn scan_finished(&self, session: ScanSession) -> Result<(), IndexingError> {
        let ScanSession {
            root,
            mut tx,
            cancelled,
            failed,
            pending,
            ..
        } = session;
        if failed {
            if let Err(err) = self.env.attributes.set(&root, keys::DIRTY, Some("true")) {
                tracing::warn!(target = "strata.index", root = %root, error = %err, "failed to mark root dirty");
            }
        }
        let commit = !(cancelled || failed);
        let result = if commit { tx.commit() } else { tx.roll_back() };
        self.class_indexes.invalidate(&root);
        if commit && result.is_ok() {
            self.submit_dependents(&pending);
        } else if !pending.is_empty() {
            tracing::debug!(
                target = "strata.index",
                root = %root,
                roots = pending.files.len(),
                deferred = pending.deferred.len(),
                "dropping dependents of an uncommitted scan"
            );
        }
        tracing::debug!(
            target = "strata.index",
            root = %root,
            committed = commit,
            ok = result.is_ok(),
            "scan finished"
        );
        result.map_err(|err| IndexingError::new(&root, err))
    }

    /// Drop in-memory state of roots that left the workspace and mark them dirty, so
    /// they are fully reindexed should they come back.
    pub fn roots_removed(&self, roots: &[RootUrl]) {
        for root in roots {
            self.class_indexes.invalidate(root);
            if !self.env.cache_dir.exists(root) {
                continue;
            }
            let result = self
                .env
                .attributes
                .set(root, keys::DIRTY, Some("true"))
                .and_then(|()| self.env.attributes.flush(root));
            if let Err(err) = result {
                tracing::warn!(target = "strata.index", root = %root, error = %err, "failed to mark removed root dirty");
            }
            self.env.attributes.evict(root);
        }
    }

    /// Run a whole scan of `root`.
    ///
    /// When the root's index is not up to date every source below the root is indexed
    /// and sources that disappeared are cleared; otherwise only `files` are.
    pub fn index_root(
        &self,
        root: &RootUrl,
        metadata: &ScanMetadata,
        files: &[Indexable],
        token: &CancellationToken,
    ) -> Result<PassOutcome, IndexingError> {
        let mut session = self.scan_started(root, metadata)?;
        let result = self.scan(&mut session, files, token);
        let finished = self.scan_finished(session);
        let outcome = result?;
        finished?;
        Ok(outcome)
    }

    fn scan(
        &self,
        session: &mut ScanSession,
        files: &[Indexable],
        token: &CancellationToken,
    ) -> Result<PassOutcome, IndexingError> {
        if session.up_to_date() {
            return self.index(session, files, false, token);
        }
        let root = session.root.clone();
        let sources = self
            .root_sources(session)
            .map_err(|err| IndexingError::new(&root, err))?;
        let present: BTreeSet<&Url> = sources.iter().map(|indexable| &indexable.url).collect();
        let vanished: Vec<Indexable> = session
            .tx
            .get::<PersistentIndexTransaction>()
            .map_err(|err| IndexingError::new(&root, err))?
            .class_index()
            .files()
            .filter(|url| !present.contains(url))
            .filter_map(|url| {
                let relative = root.relativize(url)?;
                Some(Indexable::new(relative, url.clone(), strata_core::JAVA_MIME_TYPE))
            })
            .collect();
        if !vanished.is_empty() {
            self.files_deleted(session, &vanished, token)?;
        }
        self.index(session, &sources, true, token)
    }

    /// Every Java source below `root`, processor output excluded.
    fn root_sources(&self, session: &ScanSession) -> Result<Vec<Indexable>, IndexError> {
        let root = &session.root;
        let Some(dir) = root.to_dir() else {
            return Ok(Vec::new());
        };
        let generated = session.tx.get::<ProcessorGeneratedFiles>()?;
        let mut out = Vec::new();
        for path in collect_files(&dir)? {
            if path.extension().is_none_or(|ext| ext != "java") {
                continue;
            }
            let Ok(relative) = path.strip_prefix(&dir) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let Some(indexable) = Indexable::java(root, &relative) else {
                continue;
            };
            if !generated.is_generated(&indexable.url) {
                out.push(indexable);
            }
        }
        Ok(out)
    }
}

/// Delete the artifacts `indexable` produced last time and return the types that
/// disappeared with them.
///
/// The manifest written with the artifacts lists the declared binary names. Without a
/// manifest, or when it names the file's own primary type, the artifact family of the
/// primary type is scanned instead; a name still declared by another source is kept.
fn clear_stale_artifacts(
    tx: &mut Transaction,
    root: &RootUrl,
    indexable: &Indexable,
) -> Result<BTreeSet<TypeHandle>, IndexError> {
    let url = &indexable.url;
    let mut removed = BTreeSet::new();

    let generated = tx.get_mut::<ProcessorGeneratedFiles>()?.forget(url);
    for generated_url in generated {
        if let Ok(path) = generated_url.to_file_path() {
            tx.get::<ArtifactTransaction>()?.delete_file(&path)?;
        }
        match root.relativize(&generated_url) {
            Some(relative) => {
                let generated = Indexable::new(relative, generated_url.clone(), indexable.mime_type.clone());
                removed.extend(clear_stale_artifacts(tx, root, &generated)?);
                forget_file(tx, &generated_url)?;
            }
            None => tracing::debug!(
                target = "strata.index",
                file = %generated_url,
                "generated source outside its root, artifacts left in place"
            ),
        }
    }

    let own = indexable.stem().replace('/', ".");
    let manifest = tx
        .get::<ArtifactTransaction>()?
        .read_manifest(&indexable.relative_path)?;
    let mut scan_family = manifest.is_none();
    for name in manifest.into_iter().flatten() {
        if name == own {
            scan_family = true;
            continue;
        }
        let fqns = tx.get_mut::<PersistentIndexTransaction>()?.fqns_mut();
        if fqns.remove(&name, url) && !fqns.check(&name, url) {
            tx.get::<ArtifactTransaction>()?.delete_artifact(&name)?;
            removed.insert(TypeHandle::other(name));
        }
    }
    if scan_family {
        let family = tx.get::<ArtifactTransaction>()?.artifact_family(&own)?;
        for name in family {
            let fqns = tx.get_mut::<PersistentIndexTransaction>()?.fqns_mut();
            if fqns.check(&name, url) {
                continue;
            }
            fqns.remove(&name, url);
            tx.get::<ArtifactTransaction>()?.delete_artifact(&name)?;
            removed.insert(TypeHandle::other(name));
        }
    }
    tx.get::<ArtifactTransaction>()?
        .delete_manifest(&indexable.relative_path)?;
    Ok(removed)
}

fn forget_file(tx: &mut Transaction, url: &Url) -> Result<(), IndexError> {
    let index = tx.get_mut::<PersistentIndexTransaction>()?;
    index.checksums_mut().remove(url);
    index.class_index_mut().invalidate_file(url);
    Ok(())
}

/// Whether the stored artifact of `binary_name` is at least as new as `class_file`.
fn artifact_is_current(store: &FsArtifactStore, binary_name: &str, class_file: &Path) -> bool {
    let Ok(artifact) = store.artifact_path(binary_name) else {
        return false;
    };
    match (modified_time(&artifact), modified_time(class_file)) {
        (Ok(Some(artifact)), Ok(Some(class_file))) => artifact >= class_file,
        _ => false,
    }
}

/// `p/q/A$B.class` below `binary_root` becomes `p.q.A$B`.
fn binary_name_of(binary_root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(binary_root).ok()?.with_extension("");
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("."))
}
